use super::*;

/// What to run, and inside which isolation boundaries.
///
/// Immutable once accepted by `Executor::launch`.
#[derive(Clone, Debug, Default)]
pub struct LaunchRequest {
  /// Arguments to pass to the command.
  pub args: Vec<String>,

  /// Path of the command to run, possibly containing `${VAR}` placeholders.
  pub command: String,

  /// Confine the child's filesystem view to the task directory.
  ///
  /// When set, the child is chrooted into the task directory and the command
  /// path is resolved relative to it.
  pub fs_isolation: bool,

  /// Place the child (and every process it forks) into a dedicated control
  /// group.
  pub resource_limits: bool,

  /// Run the command as this user instead of the supervisor's own.
  pub user: Option<String>,
}

/// Everything surrounding a launch that is not the command itself.
///
/// Held for the lifetime of the launch; only the task metadata may be
/// replaced, through `Executor::update_task`.
#[derive(Clone, Debug)]
pub struct ExecutorContext {
  /// Identifier of the allocation this task belongs to.
  pub alloc_id: String,

  /// Container id, present when `driver` is a container driver.
  pub container_id: Option<String>,

  /// Name of the driver that initiated the launch, e.g. `exec` or `docker`.
  ///
  /// Selects how script checks are dispatched.
  pub driver: String,

  /// The environment templater.
  pub environment: Arc<dyn TaskEnvironment>,

  /// Directory the log rotators write into.
  pub log_dir: PathBuf,

  /// Lower bound of the port range available to a syslog listener.
  pub port_lower: u16,

  /// Upper bound of the port range available to a syslog listener.
  pub port_upper: u16,

  /// Task metadata: name, log configuration, services.
  pub task: Task,

  /// The task's working directory, provisioned by the caller.
  pub task_dir: PathBuf,
}

/// Task metadata carried by the context.
#[derive(Clone, Debug, Default)]
pub struct Task {
  pub log_config: LogConfig,
  pub name: String,
  pub services: Vec<Service>,
}

/// Bounds for one log rotator.
#[derive(Clone, Debug)]
pub struct LogConfig {
  /// Maximum size of a single log file, in megabytes.
  pub max_file_size_mb: u64,

  /// How many rotated files to retain per stream.
  pub max_files: usize,
}

impl LogConfig {
  pub fn max_file_size_bytes(&self) -> u64 {
    self.max_file_size_mb * 1024 * 1024
  }
}

impl Default for LogConfig {
  fn default() -> Self {
    Self {
      max_file_size_mb: 10,
      max_files: 10,
    }
  }
}

/// A service to register with the external agent, with zero or more checks.
#[derive(Clone, Debug, Default)]
pub struct Service {
  pub checks: Vec<ServiceCheck>,
  pub name: String,
  pub tags: Vec<String>,
}

/// A single health check attached to a service.
///
/// Only checks of kind `script` are owned by the executor; every other kind
/// is delegated to the registry agent unchanged.
#[derive(Clone, Debug, Default, PartialEq)]
pub struct ServiceCheck {
  pub args: Vec<String>,
  pub command: String,
  pub interval: Duration,
  /// Check kind: `script`, `http`, `tcp`, ...
  pub kind: String,
  pub name: String,
  pub path: String,
  pub protocol: String,
  pub timeout: Duration,
}
