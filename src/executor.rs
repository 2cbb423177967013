use super::*;

/// Builds the opaque registry syncer on first use.
pub type SyncerFactory = Box<dyn Fn() -> Result<Box<dyn ServiceSyncer>> + Send + Sync>;

/// Supervises one task command from launch to teardown.
///
/// Created idle; `launch` starts the child and the background activities
/// (wait watcher, pid collector), `exit` tears everything down. An instance
/// supervises at most one launch.
pub struct Executor {
  ctx: Mutex<Option<ExecutorContext>>,
  exit: Arc<ExitLatch>,
  fs_isolation: AtomicBool,
  isolation: Mutex<Option<IsolationManager>>,
  launched: AtomicBool,
  pid: Mutex<Option<u32>>,
  pids: Arc<RwLock<HashMap<i32, Arc<PidRecord>>>>,
  registry: Mutex<Option<RegistryBridge>>,
  resource_limits: AtomicBool,
  rotators: Mutex<Option<RotatorPair>>,
  scan_interval: Duration,
  syncer_factory: SyncerFactory,
  table: Arc<dyn ProcessTable>,
}

impl Executor {
  pub fn new(syncer_factory: SyncerFactory) -> Self {
    Self::with_process_table(syncer_factory, Arc::new(ProcTable), SCAN_INTERVAL)
  }

  pub fn with_process_table(
    syncer_factory: SyncerFactory,
    table: Arc<dyn ProcessTable>,
    scan_interval: Duration,
  ) -> Self {
    Self {
      ctx: Mutex::new(None),
      exit: Arc::new(ExitLatch::new()),
      fs_isolation: AtomicBool::new(false),
      isolation: Mutex::new(None),
      launched: AtomicBool::new(false),
      pid: Mutex::new(None),
      pids: Arc::new(RwLock::new(HashMap::new())),
      registry: Mutex::new(None),
      resource_limits: AtomicBool::new(false),
      rotators: Mutex::new(None),
      scan_interval,
      syncer_factory,
      table,
    }
  }

  /// Launch the task command.
  ///
  /// On success the returned state carries the child's pid and an exit code
  /// of `-1`; the terminal state is delivered through `wait`.
  pub fn launch(&self, ctx: ExecutorContext, request: LaunchRequest) -> Result<ProcessState> {
    ensure!(
      !self.launched.swap(true, Ordering::SeqCst),
      Error::AlreadyLaunched
    );

    let result = self.launch_inner(ctx, request);

    if result.is_err() {
      self.launched.store(false, Ordering::SeqCst);
    }

    result
  }

  fn launch_inner(&self, ctx: ExecutorContext, request: LaunchRequest) -> Result<ProcessState> {
    let supervisor = std::process::id() as i32;

    ensure!(
      ctx.task_dir.is_dir(),
      Error::Setup(format!(
        "task directory {} does not exist",
        ctx.task_dir.display()
      ))
    );

    let environment = Arc::clone(&ctx.environment);

    let command_path = environment.interpolate(&request.command);
    let args = environment.interpolate_all(&request.args);

    // Failures up to the isolation step acquire no OS state, so surfacing
    // them needs no teardown.
    let resolved = resolve(&ctx.task_dir, &command_path)?;

    make_executable(&resolved)?;

    let program = if request.fs_isolation {
      // Inside the chroot the task directory is the root; the child execs
      // the path relative to it.
      resolved
        .strip_prefix(&ctx.task_dir)
        .map(Path::to_path_buf)
        .unwrap_or_else(|_| resolved.clone())
    } else {
      resolved.clone()
    };

    let user = match &request.user {
      Some(name) => Some(lookup_user(name)?),
      None => None,
    };

    // The supervisor enters the cgroup here, before the child exists.
    let mut isolation = IsolationManager::configure(
      &request,
      &ctx.task_dir,
      &format!("{}-{}", ctx.alloc_id, ctx.task.name),
    )?;

    let isolation_config =
      (request.fs_isolation || request.resource_limits).then(|| isolation.config());

    let pair = {
      let mut rotators = self.rotators.lock();

      if rotators.is_none() {
        match RotatorPair::create(&ctx.log_dir, &ctx.task.name, &ctx.task.log_config) {
          Ok(pair) => *rotators = Some(pair),
          Err(error) => {
            for failure in isolation.release(supervisor) {
              warn!(%failure, "releasing isolation after failed launch");
            }

            return Err(error);
          }
        }
      }

      rotators.clone()
    };

    let mut command = Command::new(&program);

    command
      .args(&args)
      .env_clear()
      .envs(environment.env_list())
      .stdin(Stdio::null())
      .stdout(Stdio::piped())
      .stderr(Stdio::piped());

    if request.fs_isolation {
      let root = ctx.task_dir.clone();

      let ids = user.as_ref().map(|user| (user.uid, user.gid));

      unsafe {
        command.pre_exec(move || {
          chroot(root.as_path()).map_err(io::Error::from)?;
          nix::unistd::chdir("/").map_err(io::Error::from)?;

          // chroot(2) needs CAP_SYS_CHROOT, so the switch to the task user
          // has to happen after the jail is in place.
          if let Some((uid, gid)) = ids {
            nix::unistd::setgroups(&[gid]).map_err(io::Error::from)?;
            nix::unistd::setgid(gid).map_err(io::Error::from)?;
            nix::unistd::setuid(uid).map_err(io::Error::from)?;
          }

          Ok(())
        });
      }
    } else {
      if let Some(user) = &user {
        command.uid(user.uid.as_raw()).gid(user.gid.as_raw());
      }

      command.current_dir(&ctx.task_dir);
    }

    let mut child = match command.spawn() {
      Ok(child) => child,
      Err(error) => {
        // Partial setup: release the acquired isolation before surfacing.
        for failure in isolation.release(supervisor) {
          warn!(%failure, "releasing isolation after failed start");
        }

        return Err(Error::Setup(format!(
          "failed to start {}: {error}",
          program.display()
        )));
      }
    };

    let pid = child.id();

    if let Some(pair) = &pair {
      if let Some(stdout) = child.stdout.take() {
        spawn_copier(stdout, Arc::clone(&pair.stdout), "stdout");
      }

      if let Some(stderr) = child.stderr.take() {
        spawn_copier(stderr, Arc::clone(&pair.stderr), "stderr");
      }
    }

    *self.pid.lock() = Some(pid);
    self.fs_isolation.store(request.fs_isolation, Ordering::SeqCst);
    self
      .resource_limits
      .store(request.resource_limits, Ordering::SeqCst);
    *self.isolation.lock() = Some(isolation);
    *self.ctx.lock() = Some(ctx);

    let state = ProcessState::initial(pid, isolation_config.clone());

    let exit = Arc::clone(&self.exit);

    thread::spawn(move || {
      let terminal = match child.wait() {
        Ok(status) => ProcessState::terminal(&status, isolation_config),
        Err(error) => {
          warn!(%error, "failed to wait on child");

          ProcessState {
            exit_code: 1,
            isolation: isolation_config,
            pid: 0,
            signal: 0,
            time: now_ns(),
          }
        }
      };

      info!(
        exit_code = terminal.exit_code,
        signal = terminal.signal,
        "child terminated"
      );

      exit.close(terminal);
    });

    PidCollector::new(
      Arc::clone(&self.exit),
      Arc::clone(&self.pids),
      supervisor,
      Arc::clone(&self.table),
      self.scan_interval,
    )
    .spawn();

    info!(pid, command = %program.display(), "task launched");

    Ok(state)
  }

  /// Block until the child has terminated and return its terminal state.
  pub fn wait(&self) -> ProcessState {
    self.exit.wait()
  }

  /// Ask the child to stop: interrupt on POSIX, kill on Windows.
  ///
  /// A child that already finished is not an error.
  pub fn shutdown(&self) -> Result {
    let pid = (*self.pid.lock()).ok_or(Error::NoProcess)?;

    if self.exit.poll().is_some() {
      return Ok(());
    }

    let signal = if cfg!(windows) {
      Signal::SIGKILL
    } else {
      Signal::SIGINT
    };

    signal_pid(pid, signal)
  }

  /// Full teardown: registry bridge, then the child (directly, or through
  /// cgroup destruction when resource limits are in effect), then the log
  /// rotators, then the chroot mounts.
  ///
  /// Killing precedes closing the rotators so the copiers can drain the
  /// child's last writes. Every step runs regardless of earlier failures;
  /// their errors are collected.
  pub fn exit(&self) -> Result {
    let mut errors = Vec::new();

    if let Some(mut bridge) = self.registry.lock().take() {
      if let Err(error) = bridge.shutdown() {
        errors.push(error);
      }
    }

    let supervisor = std::process::id() as i32;

    let child_running = self.pid.lock().is_some() && self.exit.poll().is_none();

    {
      let mut isolation = self.isolation.lock();

      if let Some(manager) = isolation.as_mut() {
        if manager.has_cgroup() {
          // Destroying the group kills every member, the child included.
          errors.extend(manager.destroy_cgroup(supervisor));
        }
      }
    }

    if child_running && !self.resource_limits.load(Ordering::SeqCst) {
      if let Some(pid) = *self.pid.lock() {
        if let Err(error) = signal_pid(pid, Signal::SIGKILL) {
          errors.push(error);
        }
      }
    }

    if let Some(pair) = self.rotators.lock().take() {
      errors.extend(pair.close());
    }

    {
      let mut isolation = self.isolation.lock();

      if let Some(manager) = isolation.as_mut() {
        errors.extend(manager.teardown_mounts());
      }
    }

    Error::teardown(errors)
  }

  /// Latest aggregated resource usage across the descendant set; empty when
  /// nothing is supervised.
  pub fn stats(&self) -> TaskResourceUsage {
    let records: Vec<Arc<PidRecord>> = self.pids.read().values().cloned().collect();

    let mut usages = HashMap::with_capacity(records.len());

    for record in records {
      match self.table.usage(record.pid) {
        Some(sample) => {
          usages.insert(record.pid, record.usage(&sample));
        }
        None => debug!(pid = record.pid, "skipping vanished pid"),
      }
    }

    TaskResourceUsage::aggregate(usages)
  }

  /// Re-apply file-size and file-count bounds to both rotators.
  pub fn update_log_config(&self, config: &LogConfig) -> Result {
    let rotators = self.rotators.lock();

    match rotators.as_ref() {
      Some(pair) => {
        pair.reconfigure(config);

        Ok(())
      }
      None => Err(Error::RotatorMissing),
    }
  }

  /// Replace the task metadata: re-apply the log configuration and, when a
  /// bridge exists, re-sync the services.
  pub fn update_task(&self, task: Task) -> Result {
    {
      let mut guard = self.ctx.lock();

      let ctx = guard.as_mut().ok_or(Error::NoProcess)?;

      ctx.task = task.clone();
    }

    if let Err(error) = self.update_log_config(&task.log_config) {
      warn!(%error, "log reconfiguration skipped");
    }

    if self.registry.lock().is_some() {
      self.sync_services()?;
    }

    Ok(())
  }

  /// Register the task's services, creating the bridge on first call.
  pub fn sync_services(&self) -> Result {
    let ctx = self.ctx.lock().clone().ok_or(Error::NoProcess)?;

    let mut registry = self.registry.lock();

    if registry.is_none() {
      let syncer = (self.syncer_factory)()?;

      *registry = Some(RegistryBridge::new(&ctx.alloc_id, &ctx.task.name, syncer)?);
    }

    match registry.as_mut() {
      Some(bridge) => bridge.sync(&ctx, self.fs_isolation.load(Ordering::SeqCst)),
      None => Ok(()),
    }
  }

  /// Shut the bridge down, if one was ever created.
  pub fn deregister_services(&self) -> Result {
    match self.registry.lock().take() {
      Some(mut bridge) => bridge.shutdown(),
      None => Ok(()),
    }
  }

  /// Bind a syslog listener for the task and return it; its address is what
  /// gets handed back to the caller.
  pub fn launch_syslog_listener(&self) -> Result<SyslogListener> {
    let guard = self.ctx.lock();

    let ctx = guard.as_ref().ok_or(Error::NoProcess)?;

    let listener = SyslogListener::bind(ctx.port_lower, ctx.port_upper)?;

    info!(address = %listener.address(), "syslog listener bound");

    Ok(listener)
  }

  pub fn version(&self) -> &'static str {
    VERSION
  }
}

fn lookup_user(name: &str) -> Result<User> {
  User::from_name(name)
    .map_err(|errno| Error::Setup(format!("failed to look up user {name}: {errno}")))?
    .ok_or_else(|| Error::UnknownUser(name.to_string()))
}

fn signal_pid(pid: u32, signal: Signal) -> Result {
  match kill(Pid::from_raw(pid as i32), signal) {
    // Already finished is not an error.
    Ok(()) | Err(Errno::ESRCH) => Ok(()),
    Err(errno) => Err(errno.into()),
  }
}

fn spawn_copier(mut source: impl Read + Send + 'static, rotator: Arc<FileRotator>, stream: &'static str) {
  thread::spawn(move || {
    let mut buffer = [0u8; 8192];

    loop {
      match source.read(&mut buffer) {
        Ok(0) => break,
        Ok(n) => {
          if let Err(error) = rotator.write_all(&buffer[..n]) {
            warn!(%error, stream, "dropping child output");
            break;
          }
        }
        Err(error) if error.kind() == io::ErrorKind::Interrupted => continue,
        Err(error) => {
          debug!(%error, stream, "output stream closed");
          break;
        }
      }
    }

    let _ = rotator.flush();
  });
}

#[cfg(test)]
mod tests {
  use {super::*, assert_matches::assert_matches, tempfile::TempDir};

  struct NullSyncer;

  impl ServiceSyncer for NullSyncer {
    fn shutdown(&mut self) -> Result {
      Ok(())
    }

    fn start(&mut self) -> Result {
      Ok(())
    }

    fn sync(&mut self, _services: &[RegisteredService]) -> Result {
      Ok(())
    }
  }

  fn null_factory() -> SyncerFactory {
    Box::new(|| Ok(Box::new(NullSyncer) as Box<dyn ServiceSyncer>))
  }

  fn executor() -> Executor {
    Executor::with_process_table(null_factory(), Arc::new(ProcTable), Duration::from_millis(50))
  }

  struct Dirs {
    ctx: ExecutorContext,
    _log_dir: TempDir,
    _task_dir: TempDir,
  }

  fn context(task_name: &str) -> Dirs {
    let task_dir = TempDir::new().unwrap();
    let log_dir = TempDir::new().unwrap();

    let ctx = ExecutorContext {
      alloc_id: "alloc1".into(),
      container_id: None,
      driver: "exec".into(),
      environment: Arc::new(MapEnvironment::default()),
      log_dir: log_dir.path().to_path_buf(),
      port_lower: 10_000,
      port_upper: 10_100,
      task: Task {
        log_config: LogConfig::default(),
        name: task_name.into(),
        services: vec![Service {
          checks: Vec::new(),
          name: "svc".into(),
          tags: Vec::new(),
        }],
      },
      task_dir: task_dir.path().to_path_buf(),
    };

    Dirs {
      ctx,
      _log_dir: log_dir,
      _task_dir: task_dir,
    }
  }

  #[test]
  fn version_is_static() {
    assert_eq!(executor().version(), "1.0.0");
  }

  #[test]
  fn shutdown_before_launch_fails() {
    assert_matches!(executor().shutdown(), Err(Error::NoProcess));
  }

  #[test]
  fn update_log_config_before_launch_fails() {
    assert_matches!(
      executor().update_log_config(&LogConfig::default()),
      Err(Error::RotatorMissing)
    );
  }

  #[test]
  fn stats_are_empty_before_launch() {
    let usage = executor().stats();

    assert!(usage.pids.is_empty());
    assert_eq!(usage.total.memory.rss, 0);
  }

  #[test]
  fn exit_before_launch_destroys_nothing() {
    assert!(executor().exit().is_ok());
  }

  #[test]
  fn sync_services_before_launch_fails() {
    assert_matches!(executor().sync_services(), Err(Error::NoProcess));
  }

  #[test]
  fn syslog_listener_before_launch_fails() {
    assert_matches!(
      executor().launch_syslog_listener(),
      Err(Error::NoProcess)
    );
  }

  #[test]
  fn unknown_binary_fails_setup_without_side_effects() {
    let executor = executor();

    let dirs = context("web");

    let log_dir = dirs.ctx.log_dir.clone();

    let result = executor.launch(
      dirs.ctx,
      LaunchRequest {
        command: "warden-test-no-such-binary".into(),
        ..Default::default()
      },
    );

    assert_matches!(result, Err(Error::BinaryNotFound));

    // No rotator files were created.
    assert_eq!(fs::read_dir(log_dir).unwrap().count(), 0);
  }

  #[test]
  #[cfg(target_os = "linux")]
  fn happy_path_echo() {
    let executor = executor();

    let dirs = context("web");

    let log_dir = dirs.ctx.log_dir.clone();

    let initial = executor
      .launch(
        dirs.ctx,
        LaunchRequest {
          args: vec!["hi".into()],
          command: "/bin/echo".into(),
          ..Default::default()
        },
      )
      .unwrap();

    assert!(initial.pid >= 1);
    assert_eq!(initial.exit_code, -1);

    let listener = executor.launch_syslog_listener().unwrap();

    assert!(!listener.address().is_empty());

    let terminal = executor.wait();

    assert_eq!(terminal.exit_code, 0);
    assert_eq!(terminal.signal, 0);
    assert_eq!(terminal.pid, 0);
    assert!(terminal.time > 0);

    // Give the copier a moment to drain the pipe.
    thread::sleep(Duration::from_millis(200));

    assert_eq!(
      fs::read_to_string(log_dir.join("web.stdout.0")).unwrap(),
      "hi\n"
    );

    assert!(executor.exit().is_ok());
  }

  #[test]
  #[cfg(target_os = "linux")]
  fn second_launch_is_rejected() {
    let executor = executor();

    let first = context("web");
    let second = context("web");

    executor
      .launch(
        first.ctx,
        LaunchRequest {
          command: "/bin/echo".into(),
          ..Default::default()
        },
      )
      .unwrap();

    assert_matches!(
      executor.launch(
        second.ctx,
        LaunchRequest {
          command: "/bin/echo".into(),
          ..Default::default()
        },
      ),
      Err(Error::AlreadyLaunched)
    );

    executor.wait();

    executor.exit().unwrap();
  }

  #[test]
  #[cfg(target_os = "linux")]
  fn exit_kills_a_running_child() {
    let executor = Arc::new(executor());

    let dirs = context("sleepy");

    executor
      .launch(
        dirs.ctx,
        LaunchRequest {
          args: vec!["3600".into()],
          command: "/bin/sleep".into(),
          ..Default::default()
        },
      )
      .unwrap();

    let waiter = Arc::clone(&executor);

    let handle = thread::spawn(move || waiter.wait());

    executor.exit().unwrap();

    let terminal = handle.join().unwrap();

    assert_eq!(terminal.exit_code, 137);
    assert_eq!(terminal.signal, 9);
  }

  #[test]
  #[cfg(target_os = "linux")]
  fn collector_tracks_the_child() {
    let executor = executor();

    let dirs = context("sleepy");

    let initial = executor
      .launch(
        dirs.ctx,
        LaunchRequest {
          args: vec!["3600".into()],
          command: "/bin/sleep".into(),
          ..Default::default()
        },
      )
      .unwrap();

    // First scan runs immediately; allow it to land.
    thread::sleep(Duration::from_millis(300));

    let usage = executor.stats();

    let supervisor = std::process::id() as i32;

    assert!(usage.pids.contains_key(&supervisor));
    assert!(usage.pids.contains_key(&(initial.pid as i32)));

    executor.exit().unwrap();
  }

  #[test]
  #[cfg(target_os = "linux")]
  fn live_log_reconfiguration_round_trips() {
    let executor = executor();

    let dirs = context("web");

    executor
      .launch(
        dirs.ctx,
        LaunchRequest {
          args: vec!["1".into()],
          command: "/bin/sleep".into(),
          ..Default::default()
        },
      )
      .unwrap();

    executor
      .update_log_config(&LogConfig {
        max_file_size_mb: 2,
        max_files: 5,
      })
      .unwrap();

    executor.wait();

    executor.exit().unwrap();
  }

  #[test]
  #[cfg(target_os = "linux")]
  fn services_sync_and_deregister() {
    #[derive(Default)]
    struct Recording {
      services: Arc<Mutex<Vec<RegisteredService>>>,
    }

    impl ServiceSyncer for Recording {
      fn shutdown(&mut self) -> Result {
        self.services.lock().clear();
        Ok(())
      }

      fn start(&mut self) -> Result {
        Ok(())
      }

      fn sync(&mut self, services: &[RegisteredService]) -> Result {
        *self.services.lock() = services.to_vec();
        Ok(())
      }
    }

    let recorded: Arc<Mutex<Vec<RegisteredService>>> = Arc::default();

    let factory_recorded = Arc::clone(&recorded);

    let factory: SyncerFactory = Box::new(move || {
      Ok(Box::new(Recording {
        services: Arc::clone(&factory_recorded),
      }) as Box<dyn ServiceSyncer>)
    });

    let executor =
      Executor::with_process_table(factory, Arc::new(ProcTable), Duration::from_millis(50));

    let dirs = context("web");

    executor
      .launch(
        dirs.ctx,
        LaunchRequest {
          command: "/bin/echo".into(),
          ..Default::default()
        },
      )
      .unwrap();

    executor.sync_services().unwrap();

    {
      let services = recorded.lock();

      assert_eq!(services.len(), 1);
      assert_eq!(services[0].id, "alloc1-web");
    }

    executor.deregister_services().unwrap();

    assert!(recorded.lock().is_empty());

    executor.wait();

    executor.exit().unwrap();
  }
}
