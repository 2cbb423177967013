use super::*;

/// The opaque client of the external registry agent.
///
/// Implementations own their background loop: `start` brings it up, `sync`
/// replaces the registered service set, `shutdown` deregisters everything
/// and stops the loop.
pub trait ServiceSyncer: Send {
  fn shutdown(&mut self) -> Result;

  fn start(&mut self) -> Result;

  fn sync(&mut self, services: &[RegisteredService]) -> Result;
}

/// A service as submitted to the agent, dynamic fields already interpolated.
#[derive(Clone, Debug, PartialEq)]
pub struct RegisteredService {
  pub checks: Vec<RegisteredCheck>,
  pub id: String,
  pub name: String,
  pub tags: Vec<String>,
}

/// Who runs a check: the executor itself (script checks) or the agent
/// (everything else).
#[derive(Clone, Debug, PartialEq)]
pub enum RegisteredCheck {
  /// Owned by the agent, passed through unchanged apart from interpolation.
  Delegated(ServiceCheck),

  /// Owned by the executor.
  Script(ScriptCheck),
}

/// A health check whose command this supervisor executes itself.
///
/// The variant is keyed by the driver that launched the task; the two
/// variants differ in where the command has to run.
#[derive(Clone, Debug, PartialEq)]
pub enum ScriptCheck {
  /// The task runs under a container driver; the command is executed inside
  /// the container.
  Container {
    args: Vec<String>,
    command: String,
    container_id: String,
    interval: Duration,
    name: String,
    timeout: Duration,
  },

  /// The task runs directly on the host; the command is executed against
  /// the task directory, entering the chroot when the task is
  /// filesystem-isolated.
  Host {
    args: Vec<String>,
    command: String,
    fs_isolation: bool,
    interval: Duration,
    name: String,
    task_dir: PathBuf,
    timeout: Duration,
  },
}

/// Keeps the task's services registered with the external agent for as long
/// as the task lives.
pub struct RegistryBridge {
  id: String,
  syncer: Box<dyn ServiceSyncer>,
}

impl RegistryBridge {
  /// Start the syncer's background loop; services are keyed by
  /// `<allocID>-<taskName>`.
  pub fn new(alloc_id: &str, task_name: &str, mut syncer: Box<dyn ServiceSyncer>) -> Result<Self> {
    syncer.start()?;

    Ok(Self {
      id: format!("{alloc_id}-{task_name}"),
      syncer,
    })
  }

  pub fn id(&self) -> &str {
    &self.id
  }

  pub fn shutdown(&mut self) -> Result {
    info!(id = %self.id, "shutting down registry bridge");

    self.syncer.shutdown()
  }

  /// Re-submit the task's current service set.
  pub fn sync(&mut self, ctx: &ExecutorContext, fs_isolation: bool) -> Result {
    let services = ctx
      .task
      .services
      .iter()
      .map(|service| registered_service(ctx, &self.id, service, fs_isolation))
      .collect::<Result<Vec<RegisteredService>>>()?;

    debug!(id = %self.id, count = services.len(), "syncing services");

    self.syncer.sync(&services)
  }
}

fn registered_service(
  ctx: &ExecutorContext,
  id: &str,
  service: &Service,
  fs_isolation: bool,
) -> Result<RegisteredService> {
  let environment = ctx.environment.as_ref();

  Ok(RegisteredService {
    checks: service
      .checks
      .iter()
      .map(|check| registered_check(ctx, check, fs_isolation))
      .collect::<Result<Vec<RegisteredCheck>>>()?,
    id: id.to_string(),
    name: environment.interpolate(&service.name),
    tags: service
      .tags
      .iter()
      .map(|tag| environment.interpolate(tag))
      .collect(),
  })
}

/// Dispatch one check: script checks become the executor-owned variant
/// matching the driver, everything else is delegated to the agent.
fn registered_check(
  ctx: &ExecutorContext,
  check: &ServiceCheck,
  fs_isolation: bool,
) -> Result<RegisteredCheck> {
  let environment = ctx.environment.as_ref();

  let interpolated = ServiceCheck {
    args: environment.interpolate_all(&check.args),
    command: environment.interpolate(&check.command),
    interval: check.interval,
    kind: check.kind.clone(),
    name: environment.interpolate(&check.name),
    path: environment.interpolate(&check.path),
    protocol: environment.interpolate(&check.protocol),
    timeout: check.timeout,
  };

  if interpolated.kind != "script" {
    return Ok(RegisteredCheck::Delegated(interpolated));
  }

  match ctx.driver.as_str() {
    "docker" => {
      let container_id = ctx.container_id.clone().ok_or_else(|| {
        Error::Registry(format!(
          "script check {} requires a container id",
          interpolated.name
        ))
      })?;

      Ok(RegisteredCheck::Script(ScriptCheck::Container {
        args: interpolated.args,
        command: interpolated.command,
        container_id,
        interval: interpolated.interval,
        name: interpolated.name,
        timeout: interpolated.timeout,
      }))
    }
    "exec" | "java" => Ok(RegisteredCheck::Script(ScriptCheck::Host {
      args: interpolated.args,
      command: interpolated.command,
      fs_isolation,
      interval: interpolated.interval,
      name: interpolated.name,
      task_dir: ctx.task_dir.clone(),
      timeout: interpolated.timeout,
    })),
    driver => Err(Error::Registry(format!(
      "unable to create script check for driver {driver}"
    ))),
  }
}
