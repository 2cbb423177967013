use super::*;

/// Controllers a task control group is created under.
pub const CGROUP_CONTROLLERS: &[&str] = &["cpu", "freezer", "memory"];

/// Mount point of the cgroup filesystem.
pub const CGROUP_ROOT: &str = "/sys/fs/cgroup";

const KILL_ATTEMPTS: u32 = 5;

const KILL_BACKOFF: Duration = Duration::from_millis(20);

/// A control group spanning `CGROUP_CONTROLLERS`, holding the supervisor and
/// everything it forks.
///
/// The supervisor enters the group itself before starting the child, so the
/// child inherits membership at fork time and cannot escape by re-forking.
#[derive(Debug)]
pub struct Cgroup {
  name: String,
  paths: HashMap<String, PathBuf>,
  root: PathBuf,
}

impl Cgroup {
  /// Create the per-controller directories under `root`.
  pub fn create(root: &Path, name: &str) -> Result<Self> {
    let mut paths = HashMap::new();

    for controller in CGROUP_CONTROLLERS {
      let path = root.join(controller).join("warden").join(name);

      if let Err(error) = fs::create_dir_all(&path) {
        for created in paths.values() {
          let _ = fs::remove_dir(created);
        }

        return Err(Error::Cgroup(format!(
          "failed to create {}: {error}",
          path.display()
        )));
      }

      paths.insert(controller.to_string(), path);
    }

    Ok(Self {
      name: name.to_string(),
      paths,
      root: root.to_path_buf(),
    })
  }

  /// Add `pid` to every controller's member list.
  pub fn enter(&self, pid: i32) -> Result {
    for path in self.paths.values() {
      write_procs(&path.join("cgroup.procs"), pid).map_err(|error| {
        Error::Cgroup(format!(
          "failed to enter {}: {error}",
          path.display()
        ))
      })?;
    }

    Ok(())
  }

  pub fn member_pids(path: &Path) -> Result<Vec<i32>> {
    let procs = match fs::read_to_string(path.join("cgroup.procs")) {
      Ok(procs) => procs,
      // A group that never got its member file is simply empty.
      Err(error) if error.kind() == io::ErrorKind::NotFound => return Ok(Vec::new()),
      Err(error) => return Err(error.into()),
    };

    Ok(
      procs
        .lines()
        .filter_map(|line| line.trim().parse().ok())
        .collect(),
    )
  }

  pub fn name(&self) -> &str {
    &self.name
  }

  pub fn paths(&self) -> &HashMap<String, PathBuf> {
    &self.paths
  }

  /// Kill every member, evict `supervisor` last, and remove the directories.
  ///
  /// Every step runs on every controller regardless of earlier failures; the
  /// collected errors are returned.
  pub fn destroy(self, supervisor: i32) -> Vec<Error> {
    let mut errors = Vec::new();

    for (controller, path) in &self.paths {
      if let Err(error) = empty_group(path, supervisor) {
        errors.push(error);
      }

      if let Err(error) = evict(&self.root, controller, path, supervisor) {
        errors.push(error);
      }

      let _ = fs::remove_file(path.join("cgroup.procs"));

      if let Err(error) = fs::remove_dir(path) {
        errors.push(Error::Cgroup(format!(
          "failed to remove {}: {error}",
          path.display()
        )));
      }
    }

    errors
  }
}

fn write_procs(path: &Path, pid: i32) -> io::Result<()> {
  fs::OpenOptions::new()
    .append(true)
    .create(true)
    .open(path)?
    .write_all(pid.to_string().as_bytes())
}

/// SIGKILL every member except `supervisor` until the group drains.
fn empty_group(path: &Path, supervisor: i32) -> Result {
  for attempt in 0..KILL_ATTEMPTS {
    let members: Vec<i32> = Cgroup::member_pids(path)?
      .into_iter()
      .filter(|pid| *pid != supervisor)
      .collect();

    if members.is_empty() {
      return Ok(());
    }

    for pid in members {
      if let Err(errno) = kill(Pid::from_raw(pid), Signal::SIGKILL) {
        if errno != Errno::ESRCH {
          warn!(pid, %errno, "failed to kill control group member");
        }
      }
    }

    if attempt + 1 < KILL_ATTEMPTS {
      thread::sleep(KILL_BACKOFF);
    }
  }

  Err(Error::Cgroup(format!(
    "control group {} still has members",
    path.display()
  )))
}

/// Move `supervisor` back to the controller root so the group can be removed.
fn evict(root: &Path, controller: &str, path: &Path, supervisor: i32) -> Result {
  if !Cgroup::member_pids(path)?.contains(&supervisor) {
    return Ok(());
  }

  let parent = root.join(controller).join("cgroup.procs");

  write_procs(&parent, supervisor).map_err(|error| {
    Error::Cgroup(format!(
      "failed to leave {}: {error}",
      path.display()
    ))
  })?;

  Ok(())
}
