use super::*;

#[derive(Debug, Error)]
pub enum Error {
  #[error("process already launched")]
  AlreadyLaunched,
  #[error("binary not found")]
  BinaryNotFound,
  #[error("cgroup error: {0}")]
  Cgroup(String),
  #[error("filesystem error: {0}")]
  Filesystem(#[from] io::Error),
  #[error("mount error: {0}")]
  Mount(String),
  #[error("no process launched")]
  NoProcess,
  #[error("process table error: {0}")]
  ProcessTable(String),
  #[error("registry error: {0}")]
  Registry(String),
  #[error("log rotator does not exist")]
  RotatorMissing,
  #[error("setup error: {0}")]
  Setup(String),
  #[error("system error: {0}")]
  System(#[from] nix::Error),
  #[error("teardown failed: {}", .0.iter().map(|error| error.to_string()).collect::<Vec<String>>().join("; "))]
  Teardown(Vec<Error>),
  #[error("unknown user: {0}")]
  UnknownUser(String),
}

impl Error {
  /// Collapse the errors collected during teardown: `Ok` when every step
  /// succeeded, one `Teardown` multi-error otherwise.
  pub fn teardown(errors: Vec<Error>) -> Result {
    if errors.is_empty() {
      Ok(())
    } else {
      Err(Error::Teardown(errors))
    }
  }
}

#[cfg(test)]
mod tests {
  use super::*;

  #[test]
  fn teardown_of_no_errors_is_ok() {
    assert!(Error::teardown(Vec::new()).is_ok());
  }

  #[test]
  fn teardown_collects_every_step() {
    let result = Error::teardown(vec![
      Error::Cgroup("rmdir failed".into()),
      Error::Mount("busy".into()),
    ]);

    let message = result.unwrap_err().to_string();

    assert_eq!(
      message,
      "teardown failed: cgroup error: rmdir failed; mount error: busy"
    );
  }
}
