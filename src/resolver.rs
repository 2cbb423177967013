use super::*;

/// Locate `command` for a task rooted at `task_dir`.
///
/// Search order: `<taskDir>/local/<cmd>`, `<taskDir>/<cmd>`, then the host
/// `PATH`. The first existing file wins and the returned path is absolute.
pub fn resolve(task_dir: &Path, command: &str) -> Result<PathBuf> {
  let local = task_dir.join("local").join(command);

  if local.is_file() {
    return Ok(local);
  }

  let direct = task_dir.join(command);

  if direct.is_file() {
    return Ok(direct);
  }

  if let Some(path) = env::var_os("PATH") {
    for dir in env::split_paths(&path) {
      let candidate = dir.join(command);

      if candidate.is_file() {
        return Ok(candidate);
      }
    }
  }

  Err(Error::BinaryNotFound)
}

/// Ensure owner, group, and world can execute `path`; chmod only when bits
/// are missing.
#[cfg(unix)]
pub fn make_executable(path: &Path) -> Result {
  let mode = fs::metadata(path)
    .map_err(|error| Error::Setup(format!("failed to stat {}: {error}", path.display())))?
    .permissions()
    .mode();

  let desired = mode | 0o555;

  if desired != mode {
    fs::set_permissions(path, fs::Permissions::from_mode(desired)).map_err(|error| {
      Error::Setup(format!(
        "failed to make {} executable: {error}",
        path.display()
      ))
    })?;
  }

  Ok(())
}

#[cfg(not(unix))]
pub fn make_executable(_path: &Path) -> Result {
  Ok(())
}
