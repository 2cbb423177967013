#![cfg(feature = "integration")]

use {
  assert_matches::assert_matches,
  nix::unistd::geteuid,
  std::{fs, path::Path, sync::Arc, thread, time::Duration},
  tempfile::TempDir,
  warden::{
    Executor, ExecutorContext, LaunchRequest, LogConfig, MapEnvironment, ProcTable,
    RegisteredService, Result, Service, ServiceSyncer, SyncerFactory, Task, CGROUP_CONTROLLERS,
    CGROUP_ROOT,
  },
};

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

fn executor() -> Executor {
  Executor::with_process_table(
    Box::new(|| Ok(Box::new(NullSyncer) as Box<dyn ServiceSyncer>)) as SyncerFactory,
    Arc::new(ProcTable),
    Duration::from_millis(100),
  )
}

struct Dirs {
  ctx: ExecutorContext,
  _log_dir: TempDir,
  _task_dir: TempDir,
}

fn context(task_name: &str, log_config: LogConfig) -> Dirs {
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
      log_config,
      name: task_name.into(),
      services: vec![Service::default()],
    },
    task_dir: task_dir.path().to_path_buf(),
  };

  Dirs {
    ctx,
    _log_dir: log_dir,
    _task_dir: task_dir,
  }
}

fn cgroup_v1_available() -> bool {
  CGROUP_CONTROLLERS
    .iter()
    .all(|controller| Path::new(CGROUP_ROOT).join(controller).is_dir())
}

#[test]
fn graceful_shutdown_interrupts_the_child() {
  let executor = executor();

  let dirs = context("sleepy", LogConfig::default());

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

  executor.shutdown().unwrap();

  let terminal = executor.wait();

  assert_eq!(terminal.exit_code, 130);
  assert_eq!(terminal.signal, 2);

  // Signalling an already finished child is not an error.
  executor.shutdown().unwrap();

  executor.exit().unwrap();
}

#[test]
fn forked_grandchildren_appear_in_one_scan_interval() {
  let executor = executor();

  let dirs = context("forky", LogConfig::default());

  executor
    .launch(
      dirs.ctx,
      LaunchRequest {
        args: vec![
          "-c".into(),
          "sleep 30 & sleep 30 & wait".into(),
        ],
        command: "/bin/sh".into(),
        ..Default::default()
      },
    )
    .unwrap();

  // Two collector periods: the forks land, the next scan adopts them.
  thread::sleep(Duration::from_millis(500));

  let usage = executor.stats();

  // Supervisor, shell, and both sleeps.
  assert!(usage.pids.len() >= 4, "only saw {:?}", usage.pids.keys());

  executor.exit().unwrap();

  let terminal = executor.wait();

  assert_eq!(terminal.signal, 9);
}

#[test]
fn rotation_honors_a_live_reconfiguration() {
  let executor = executor();

  let dirs = context("noisy", LogConfig {
    max_file_size_mb: 1,
    max_files: 3,
  });

  let log_dir = dirs.ctx.log_dir.clone();

  executor
    .launch(
      dirs.ctx,
      LaunchRequest {
        args: vec![
          "-c".into(),
          // Pause so the reconfiguration lands before the stream starts.
          "sleep 1; head -c 5242880 /dev/zero".into(),
        ],
        command: "/bin/sh".into(),
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

  let terminal = executor.wait();

  assert_eq!(terminal.exit_code, 0);

  thread::sleep(Duration::from_millis(500));

  let cap = 2 * 1024 * 1024;

  let mut stdout_files = 0;

  for entry in fs::read_dir(&log_dir).unwrap() {
    let entry = entry.unwrap();

    if entry.file_name().to_string_lossy().starts_with("noisy.stdout.") {
      stdout_files += 1;

      assert!(entry.metadata().unwrap().len() <= cap);
    }
  }

  // 5 MiB at a 2 MiB cap: three files, within the new retention bound.
  assert_eq!(stdout_files, 3);

  executor.exit().unwrap();
}

#[test]
fn resource_limited_exit_destroys_the_cgroup() {
  if !geteuid().is_root() || !cgroup_v1_available() {
    return;
  }

  let executor = Arc::new(executor());

  let dirs = context("limited", LogConfig::default());

  let initial = executor
    .launch(
      dirs.ctx,
      LaunchRequest {
        args: vec!["3600".into()],
        command: "/bin/sleep".into(),
        resource_limits: true,
        ..Default::default()
      },
    )
    .unwrap();

  let isolation = initial.isolation.expect("isolation config populated");

  assert!(isolation.cgroup.is_some());
  assert_eq!(isolation.paths.len(), CGROUP_CONTROLLERS.len());

  for path in isolation.paths.values() {
    assert!(path.exists());
  }

  let waiter = Arc::clone(&executor);

  let handle = thread::spawn(move || waiter.wait());

  executor.exit().unwrap();

  let terminal = handle.join().unwrap();

  assert_eq!(terminal.exit_code, 137);
  assert_eq!(terminal.signal, 9);

  for path in isolation.paths.values() {
    assert!(!path.exists(), "{} survived teardown", path.display());
  }

  // A second exit destroys nothing new.
  assert!(executor.exit().is_ok());
}

#[test]
fn filesystem_isolation_supports_a_user_switch() {
  if !geteuid().is_root() || nix::unistd::User::from_name("nobody").ok().flatten().is_none() {
    return;
  }

  let executor = executor();

  let dirs = context("jailed-user", LogConfig::default());

  let log_dir = dirs.ctx.log_dir.clone();

  executor
    .launch(
      dirs.ctx,
      LaunchRequest {
        args: vec!["hi".into()],
        command: "/bin/echo".into(),
        fs_isolation: true,
        user: Some("nobody".into()),
        ..Default::default()
      },
    )
    .unwrap();

  let terminal = executor.wait();

  // The privilege drop happens after the chroot, so the confined child
  // still comes up as the requested user.
  assert_eq!(terminal.exit_code, 0);
  assert_eq!(terminal.signal, 0);

  thread::sleep(Duration::from_millis(200));

  assert_eq!(
    fs::read_to_string(log_dir.join("jailed-user.stdout.0")).unwrap(),
    "hi\n"
  );

  executor.exit().unwrap();
}

#[test]
fn filesystem_isolation_confines_the_child() {
  if !geteuid().is_root() {
    return;
  }

  let executor = executor();

  let dirs = context("jailed", LogConfig::default());

  let log_dir = dirs.ctx.log_dir.clone();

  let result = executor.launch(
    dirs.ctx,
    LaunchRequest {
      args: vec!["/".into()],
      command: "/bin/ls".into(),
      fs_isolation: true,
      ..Default::default()
    },
  );

  assert_matches!(result, Ok(state) if state.pid >= 1);

  let terminal = executor.wait();

  assert_eq!(terminal.exit_code, 0);

  thread::sleep(Duration::from_millis(200));

  let listing = fs::read_to_string(log_dir.join("jailed.stdout.0")).unwrap();

  // The child saw the populated task directory as its root.
  assert!(listing.contains("bin"));
  assert!(listing.contains("proc"));

  executor.exit().unwrap();
}
