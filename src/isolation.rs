use super::*;

/// Isolation resources referenced by `ProcessState`.
#[derive(Clone, Debug, Default)]
pub struct IsolationConfig {
  /// Name of the control group, when resource limits are in effect.
  pub cgroup: Option<String>,

  /// Controller name to absolute cgroup path.
  pub paths: HashMap<String, PathBuf>,
}

/// Owns the OS-level isolation a launch acquires: the task control group and
/// the bind mounts backing the chroot.
#[derive(Debug, Default)]
pub struct IsolationManager {
  cgroup: Option<Cgroup>,
  mounts: Vec<MountedDir>,
}

impl IsolationManager {
  /// Acquire whatever isolation `request` asks for, in order: control group
  /// (entering it with the supervisor's own pid, so that the child inherits
  /// membership at fork time), then the chroot mounts.
  ///
  /// If any step fails, everything acquired so far is released before the
  /// error is surfaced.
  pub fn configure(request: &LaunchRequest, task_dir: &Path, name: &str) -> Result<Self> {
    let mut manager = Self::default();

    let supervisor = std::process::id() as i32;

    if request.resource_limits {
      let cgroup = Cgroup::create(Path::new(CGROUP_ROOT), name)?;

      if let Err(error) = cgroup.enter(supervisor) {
        for failure in cgroup.destroy(supervisor) {
          warn!(%failure, "discarding partially created control group");
        }

        return Err(error);
      }

      info!(name, "supervisor entered control group");

      manager.cgroup = Some(cgroup);
    }

    if request.fs_isolation {
      for mount in Mount::task_defaults() {
        match mount.establish(task_dir) {
          Ok(Some(mounted)) => manager.mounts.push(mounted),
          Ok(None) => {}
          Err(error) => {
            for failure in manager.release(supervisor) {
              warn!(%failure, "unwinding partially isolated task directory");
            }

            return Err(error);
          }
        }
      }
    }

    Ok(manager)
  }

  pub fn config(&self) -> IsolationConfig {
    IsolationConfig {
      cgroup: self.cgroup.as_ref().map(|cgroup| cgroup.name().to_string()),
      paths: self
        .cgroup
        .as_ref()
        .map(|cgroup| cgroup.paths().clone())
        .unwrap_or_default(),
    }
  }

  /// Destroy the control group, killing every remaining member.
  pub fn destroy_cgroup(&mut self, supervisor: i32) -> Vec<Error> {
    match self.cgroup.take() {
      Some(cgroup) => cgroup.destroy(supervisor),
      None => Vec::new(),
    }
  }

  pub fn has_cgroup(&self) -> bool {
    self.cgroup.is_some()
  }

  /// Release everything still held. Both teardowns are attempted; errors
  /// from each are collected.
  pub fn release(&mut self, supervisor: i32) -> Vec<Error> {
    let mut errors = self.destroy_cgroup(supervisor);

    errors.extend(self.teardown_mounts());

    errors
  }

  /// Undo the chroot mounts in reverse order.
  pub fn teardown_mounts(&mut self) -> Vec<Error> {
    let mut errors = Vec::new();

    for mounted in self.mounts.drain(..).rev() {
      if let Err(error) = mounted.release() {
        errors.push(error);
      }
    }

    errors
  }
}
