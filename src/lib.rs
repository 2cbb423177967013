//! Supervisor for a single task command: launches it inside configured
//! isolation boundaries, tracks its process descendants, rotates its output
//! logs, samples per-process resource usage, and keeps an external service
//! registry in lockstep with the task's lifetime.

use {
  nix::{
    errno::Errno,
    mount::{mount, umount2, MntFlags, MsFlags},
    sys::signal::{kill, Signal},
    unistd::{chroot, Pid, User},
  },
  parking_lot::{Condvar, Mutex, RwLock},
  std::{
    collections::{HashMap, HashSet},
    env, fmt, fs,
    io::{self, Read, Write},
    net::{SocketAddr, TcpListener},
    os::unix::{
      fs::PermissionsExt,
      net::UnixListener,
      process::{CommandExt, ExitStatusExt},
    },
    path::{Path, PathBuf},
    process::{Command, ExitStatus, Stdio},
    sync::{
      atomic::{AtomicBool, AtomicU64, Ordering},
      Arc,
    },
    thread,
    time::{Duration, Instant, SystemTime, UNIX_EPOCH},
  },
  thiserror::Error,
  tracing::{debug, info, warn},
};

pub use crate::{
  cgroup::{Cgroup, CGROUP_CONTROLLERS, CGROUP_ROOT},
  context::{ExecutorContext, LaunchRequest, LogConfig, Service, ServiceCheck, Task},
  environment::{MapEnvironment, TaskEnvironment},
  error::Error,
  executor::{Executor, SyncerFactory},
  isolation::{IsolationConfig, IsolationManager},
  mount::{Mount, MountOptions, MountedDir},
  pids::{descendants, PidCollector, ProcTable, ProcessEntry, ProcessTable, SCAN_INTERVAL},
  process::{now_ns, ExitLatch, ProcessState},
  registry::{RegisteredCheck, RegisteredService, RegistryBridge, ScriptCheck, ServiceSyncer},
  resolver::{make_executable, resolve},
  rotator::{FileRotator, RotatorPair},
  stats::{
    CpuStats, MemoryStats, PidRecord, ProcessSample, RateEstimator, ResourceUsage,
    TaskResourceUsage, MEASURED_CPU_FIELDS, MEASURED_MEMORY_FIELDS,
  },
  syslog::SyslogListener,
};

mod cgroup;
mod context;
mod ensure;
mod environment;
mod error;
mod executor;
mod isolation;
mod mount;
mod pids;
mod process;
mod registry;
mod resolver;
mod rotator;
mod stats;
mod syslog;

pub type Result<T = (), E = Error> = std::result::Result<T, E>;

/// Reported by `Executor::version`; opaque to callers.
pub const VERSION: &str = "1.0.0";
