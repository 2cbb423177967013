use super::*;

/// The memory fields this supervisor actually measures.
pub const MEASURED_MEMORY_FIELDS: &[&str] = &["RSS", "Swap"];

/// The CPU fields this supervisor actually measures.
pub const MEASURED_CPU_FIELDS: &[&str] = &["System Mode", "User Mode", "Percent"];

/// Raw counters read from the system for one pid.
#[derive(Clone, Copy, Debug, Default, PartialEq)]
pub struct ProcessSample {
  /// Resident set size, bytes.
  pub rss: u64,

  /// Swapped-out size, bytes.
  pub swap: u64,

  /// Cumulative system-mode CPU time, milliseconds.
  pub system_ms: f64,

  /// Cumulative total CPU time, milliseconds.
  pub total_ms: f64,

  /// Cumulative user-mode CPU time, milliseconds.
  pub user_ms: f64,
}

#[derive(Clone, Debug, Default)]
pub struct MemoryStats {
  pub measured_fields: Vec<String>,
  pub rss: u64,
  pub swap: u64,
}

#[derive(Clone, Debug, Default)]
pub struct CpuStats {
  pub measured_fields: Vec<String>,

  /// Total CPU over the sample interval, percent.
  pub percent: f64,

  /// System-mode CPU over the sample interval, percent.
  pub system_mode: f64,

  /// User-mode CPU over the sample interval, percent.
  pub user_mode: f64,
}

#[derive(Clone, Debug, Default)]
pub struct ResourceUsage {
  pub cpu: CpuStats,
  pub memory: MemoryStats,
}

/// Aggregated usage for the whole task at one point in time.
#[derive(Clone, Debug, Default)]
pub struct TaskResourceUsage {
  /// Per-pid breakdown.
  pub pids: HashMap<i32, ResourceUsage>,

  /// Wall clock of the aggregation, nanoseconds since the UNIX epoch.
  pub timestamp: u64,

  /// Sum across every supervised pid.
  pub total: ResourceUsage,
}

impl TaskResourceUsage {
  pub fn aggregate(pids: HashMap<i32, ResourceUsage>) -> Self {
    let mut total = ResourceUsage {
      cpu: CpuStats {
        measured_fields: measured(MEASURED_CPU_FIELDS),
        ..Default::default()
      },
      memory: MemoryStats {
        measured_fields: measured(MEASURED_MEMORY_FIELDS),
        ..Default::default()
      },
    };

    for usage in pids.values() {
      total.memory.rss += usage.memory.rss;
      total.memory.swap += usage.memory.swap;
      total.cpu.percent += usage.cpu.percent;
      total.cpu.system_mode += usage.cpu.system_mode;
      total.cpu.user_mode += usage.cpu.user_mode;
    }

    Self {
      pids,
      timestamp: now_ns(),
      total,
    }
  }
}

fn measured(fields: &[&str]) -> Vec<String> {
  fields.iter().map(|field| field.to_string()).collect()
}

/// Turns a cumulative counter into a percentage over the interval since the
/// previous sample.
#[derive(Debug, Default)]
pub struct RateEstimator {
  previous: Option<(Instant, f64)>,
}

impl RateEstimator {
  /// Feed the current cumulative value (milliseconds of CPU time) and get
  /// the usage percentage since the last feed. The first feed yields zero.
  pub fn percent(&mut self, cumulative_ms: f64) -> f64 {
    self.percent_at(cumulative_ms, Instant::now())
  }

  fn percent_at(&mut self, cumulative_ms: f64, now: Instant) -> f64 {
    let percent = match self.previous {
      Some((at, value)) => {
        let elapsed_ms = now.duration_since(at).as_secs_f64() * 1_000.0;

        if elapsed_ms > 0.0 {
          (((cumulative_ms - value) / elapsed_ms) * 100.0).max(0.0)
        } else {
          0.0
        }
      }
      None => 0.0,
    };

    self.previous = Some((now, cumulative_ms));

    percent
  }
}

/// A supervised pid plus the estimators that turn its cumulative CPU
/// counters into per-interval percentages.
#[derive(Debug)]
pub struct PidRecord {
  pub pid: i32,
  system: Mutex<RateEstimator>,
  total: Mutex<RateEstimator>,
  user: Mutex<RateEstimator>,
}

impl PidRecord {
  pub fn new(pid: i32) -> Self {
    Self {
      pid,
      system: Mutex::new(RateEstimator::default()),
      total: Mutex::new(RateEstimator::default()),
      user: Mutex::new(RateEstimator::default()),
    }
  }

  /// Fold one raw sample into the estimators and produce the pid's usage.
  pub fn usage(&self, sample: &ProcessSample) -> ResourceUsage {
    ResourceUsage {
      cpu: CpuStats {
        measured_fields: measured(MEASURED_CPU_FIELDS),
        percent: self.total.lock().percent(sample.total_ms),
        system_mode: self.system.lock().percent(sample.system_ms),
        user_mode: self.user.lock().percent(sample.user_ms),
      },
      memory: MemoryStats {
        measured_fields: measured(MEASURED_MEMORY_FIELDS),
        rss: sample.rss,
        swap: sample.swap,
      },
    }
  }
}
