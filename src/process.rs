use super::*;

/// Terminal snapshot of the supervised child.
#[derive(Clone, Debug)]
pub struct ProcessState {
  /// Exit code surfaced to the caller.
  ///
  /// `-1` in the initial state returned by launch, the child's own status on
  /// normal exit, `128 + signum` on signal death, `1` on an unknown error.
  pub exit_code: i32,

  /// Isolation resources the launch acquired, if any.
  pub isolation: Option<IsolationConfig>,

  /// Child pid; `0` once the child has exited.
  pub pid: u32,

  /// Signal that killed the child, `0` if none.
  pub signal: i32,

  /// Wall clock, nanoseconds since the UNIX epoch.
  pub time: u64,
}

impl ProcessState {
  pub fn initial(pid: u32, isolation: Option<IsolationConfig>) -> Self {
    Self {
      exit_code: -1,
      isolation,
      pid,
      signal: 0,
      time: now_ns(),
    }
  }

  /// The terminal state for a reaped child.
  pub fn terminal(status: &ExitStatus, isolation: Option<IsolationConfig>) -> Self {
    let (exit_code, signal) = exit_code_of(status);

    Self {
      exit_code,
      isolation,
      pid: 0,
      signal,
      time: now_ns(),
    }
  }
}

#[cfg(unix)]
fn exit_code_of(status: &ExitStatus) -> (i32, i32) {
  match status.signal() {
    Some(signal) => (128 + signal, signal),
    None => (status.code().unwrap_or(1), 0),
  }
}

#[cfg(not(unix))]
fn exit_code_of(status: &ExitStatus) -> (i32, i32) {
  (status.code().unwrap_or(1), 0)
}

pub fn now_ns() -> u64 {
  SystemTime::now()
    .duration_since(UNIX_EPOCH)
    .map(|elapsed| elapsed.as_nanos() as u64)
    .unwrap_or(0)
}

/// Closed exactly once, by the wait watcher, when the child terminates.
///
/// Waiters either block indefinitely (`wait`) or race the close against a
/// deadline (`wait_for`), which is how the pid collector folds its scan timer
/// and the exit signal into one suspension point.
#[derive(Default)]
pub struct ExitLatch {
  cond: Condvar,
  state: Mutex<Option<ProcessState>>,
}

impl ExitLatch {
  pub fn new() -> Self {
    Self::default()
  }

  /// Record the terminal state and wake every waiter. Later calls are
  /// ignored; the first terminal state wins.
  pub fn close(&self, state: ProcessState) {
    let mut guard = self.state.lock();

    if guard.is_none() {
      *guard = Some(state);
      self.cond.notify_all();
    }
  }

  /// The terminal state if the latch is already closed.
  pub fn poll(&self) -> Option<ProcessState> {
    self.state.lock().clone()
  }

  /// Block until the latch closes.
  pub fn wait(&self) -> ProcessState {
    let mut guard = self.state.lock();

    loop {
      if let Some(state) = guard.as_ref() {
        return state.clone();
      }

      self.cond.wait(&mut guard);
    }
  }

  /// Block until the latch closes or `timeout` elapses, whichever comes
  /// first.
  pub fn wait_for(&self, timeout: Duration) -> Option<ProcessState> {
    let deadline = Instant::now() + timeout;

    let mut guard = self.state.lock();

    loop {
      if let Some(state) = guard.as_ref() {
        return Some(state.clone());
      }

      if self.cond.wait_until(&mut guard, deadline).timed_out() {
        return guard.clone();
      }
    }
  }
}
