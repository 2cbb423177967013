use super::*;

/// Delay between process-table scans.
pub const SCAN_INTERVAL: Duration = Duration::from_secs(5);

/// One row of the system process table.
#[derive(Clone, Copy, Debug, PartialEq)]
pub struct ProcessEntry {
  pub pid: i32,
  pub ppid: i32,
}

/// Read access to the system process table and per-process counters.
pub trait ProcessTable: Send + Sync {
  /// Every (pid, ppid) pair currently known to the system.
  fn snapshot(&self) -> Result<Vec<ProcessEntry>>;

  /// Memory and cumulative CPU counters for one pid, `None` when the pid is
  /// gone or unreadable.
  fn usage(&self, pid: i32) -> Option<ProcessSample>;
}

/// The `/proc`-backed process table.
pub struct ProcTable;

#[cfg(target_os = "linux")]
impl ProcessTable for ProcTable {
  fn snapshot(&self) -> Result<Vec<ProcessEntry>> {
    let processes = procfs::process::all_processes()
      .map_err(|error| Error::ProcessTable(error.to_string()))?;

    let mut entries = Vec::new();

    for process in processes {
      let Ok(process) = process else {
        continue;
      };

      let Ok(stat) = process.stat() else {
        continue;
      };

      entries.push(ProcessEntry {
        pid: stat.pid,
        ppid: stat.ppid,
      });
    }

    Ok(entries)
  }

  fn usage(&self, pid: i32) -> Option<ProcessSample> {
    let process = procfs::process::Process::new(pid).ok()?;

    let stat = process.stat().ok()?;

    let ticks = procfs::ticks_per_second();

    let to_ms = |ticks_spent: u64| (ticks_spent * 1_000) as f64 / ticks as f64;

    let swap = process
      .status()
      .ok()
      .and_then(|status| status.vmswap)
      .unwrap_or(0)
      * 1024;

    Some(ProcessSample {
      rss: procfs::WithCurrentSystemInfo::get(stat.rss_bytes()),
      swap,
      system_ms: to_ms(stat.stime),
      total_ms: to_ms(stat.utime + stat.stime),
      user_ms: to_ms(stat.utime),
    })
  }
}

#[cfg(not(target_os = "linux"))]
impl ProcessTable for ProcTable {
  fn snapshot(&self) -> Result<Vec<ProcessEntry>> {
    Ok(Vec::new())
  }

  fn usage(&self, _pid: i32) -> Option<ProcessSample> {
    None
  }
}

/// The transitive closure of `root`'s children in `table`, including `root`
/// itself.
///
/// `ps`-style tools cannot be trusted for transitive descendants in one
/// call, so the closure is computed here: keep sweeping the remaining rows,
/// adopting any row whose parent is already family, until a full pass adds
/// nothing.
pub fn descendants(root: i32, table: &[ProcessEntry]) -> HashSet<i32> {
  let mut family = HashSet::from([root]);

  let mut buffer = table.to_vec();

  loop {
    let mut changed = false;

    buffer.retain(|entry| {
      if family.contains(&entry.ppid) {
        family.insert(entry.pid);
        changed = true;
        false
      } else {
        true
      }
    });

    if !changed {
      break;
    }
  }

  family
}

/// Periodically recomputes the descendant set rooted at the supervisor.
///
/// The first scan runs immediately; the exit latch short-circuits the scan
/// timer, so the loop ends as soon as the child is reaped.
pub struct PidCollector {
  exit: Arc<ExitLatch>,
  interval: Duration,
  pids: Arc<RwLock<HashMap<i32, Arc<PidRecord>>>>,
  root: i32,
  table: Arc<dyn ProcessTable>,
}

impl PidCollector {
  pub fn new(
    exit: Arc<ExitLatch>,
    pids: Arc<RwLock<HashMap<i32, Arc<PidRecord>>>>,
    root: i32,
    table: Arc<dyn ProcessTable>,
    interval: Duration,
  ) -> Self {
    Self {
      exit,
      interval,
      pids,
      root,
      table,
    }
  }

  pub fn spawn(self) -> thread::JoinHandle<()> {
    thread::spawn(move || self.run())
  }

  fn run(self) {
    self.scan();

    while self.exit.wait_for(self.interval).is_none() {
      self.scan();
    }

    debug!("pid collector stopped");
  }

  /// Replace the pid set with the current scan, carrying over the records of
  /// surviving pids so their rate estimators keep their history.
  fn scan(&self) {
    let entries = match self.table.snapshot() {
      Ok(entries) => entries,
      Err(error) => {
        warn!(%error, "process table scan failed");
        return;
      }
    };

    let family = descendants(self.root, &entries);

    let mut next = HashMap::with_capacity(family.len());

    {
      let current = self.pids.read();

      for pid in family {
        let record = current
          .get(&pid)
          .cloned()
          .unwrap_or_else(|| Arc::new(PidRecord::new(pid)));

        next.insert(pid, record);
      }
    }

    *self.pids.write() = next;
  }
}
