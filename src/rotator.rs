use super::*;

/// An append-only sink that switches to `<base>.N+1` once `<base>.N` reaches
/// the size cap, retaining a bounded history.
///
/// All state sits under one lock, so runtime reconfiguration is atomic with
/// respect to rotation decisions.
#[derive(Debug)]
pub struct FileRotator {
  inner: Mutex<Inner>,
}

#[derive(Debug)]
struct Inner {
  base: String,
  dir: PathBuf,
  file: Option<fs::File>,
  index: u64,
  max_file_size: u64,
  max_files: usize,
  written: u64,
}

impl FileRotator {
  /// Open a rotator writing `<dir>/<base>.N`.
  ///
  /// Picks up where a previous incarnation left off: writing continues on
  /// the highest existing index.
  pub fn new(dir: &Path, base: &str, max_files: usize, max_file_size: u64) -> Result<Self> {
    let mut inner = Inner {
      base: base.to_string(),
      dir: dir.to_path_buf(),
      file: None,
      index: highest_index(dir, base).unwrap_or(0),
      max_file_size,
      max_files,
      written: 0,
    };

    inner.open()?;

    Ok(Self {
      inner: Mutex::new(inner),
    })
  }

  /// Stop writing: flush and drop the current file. Writes arriving after
  /// close are discarded.
  pub fn close(&self) -> Result {
    let mut inner = self.inner.lock();

    if let Some(file) = inner.file.as_mut() {
      file.flush()?;
    }

    inner.file = None;

    Ok(())
  }

  pub fn flush(&self) -> io::Result<()> {
    match self.inner.lock().file.as_mut() {
      Some(file) => file.flush(),
      None => Ok(()),
    }
  }

  /// Apply new bounds. Takes effect from the next rotation decision on.
  pub fn reconfigure(&self, max_files: usize, max_file_size: u64) {
    let mut inner = self.inner.lock();

    inner.max_file_size = max_file_size;
    inner.max_files = max_files;
  }

  /// Append `buf`, rotating as file boundaries are crossed.
  ///
  /// A file at exactly the size cap rotates on the next write, not before.
  pub fn write_all(&self, mut buf: &[u8]) -> io::Result<()> {
    let mut inner = self.inner.lock();

    if inner.file.is_none() {
      return Ok(());
    }

    while !buf.is_empty() {
      if inner.written >= inner.max_file_size {
        inner.rotate()?;
      }

      let room = (inner.max_file_size - inner.written).max(1) as usize;

      let n = buf.len().min(room);

      match inner.file.as_mut() {
        Some(file) => file.write_all(&buf[..n])?,
        None => return Ok(()),
      }

      inner.written += n as u64;

      buf = &buf[n..];
    }

    Ok(())
  }
}

impl Inner {
  fn open(&mut self) -> Result {
    let path = self.path(self.index);

    let file = fs::OpenOptions::new()
      .append(true)
      .create(true)
      .open(&path)?;

    self.written = file.metadata()?.len();
    self.file = Some(file);

    Ok(())
  }

  fn path(&self, index: u64) -> PathBuf {
    self.dir.join(format!("{}.{index}", self.base))
  }

  fn prune(&self) {
    let mut indices = existing_indices(&self.dir, &self.base);

    indices.sort_unstable();

    while indices.len() > self.max_files {
      let lowest = indices.remove(0);

      let path = self.path(lowest);

      if let Err(error) = fs::remove_file(&path) {
        warn!(%error, path = %path.display(), "failed to prune log file");
      }
    }
  }

  fn rotate(&mut self) -> io::Result<()> {
    if let Some(file) = self.file.as_mut() {
      file.flush()?;
    }

    self.index += 1;

    let path = self.path(self.index);

    let file = fs::OpenOptions::new()
      .append(true)
      .create(true)
      .open(path)?;

    self.file = Some(file);
    self.written = 0;

    self.prune();

    Ok(())
  }
}

fn existing_indices(dir: &Path, base: &str) -> Vec<u64> {
  let prefix = format!("{base}.");

  let Ok(entries) = fs::read_dir(dir) else {
    return Vec::new();
  };

  entries
    .filter_map(|entry| entry.ok())
    .filter_map(|entry| {
      entry
        .file_name()
        .to_str()
        .and_then(|name| name.strip_prefix(&prefix))
        .and_then(|suffix| suffix.parse().ok())
    })
    .collect()
}

fn highest_index(dir: &Path, base: &str) -> Option<u64> {
  existing_indices(dir, base).into_iter().max()
}

/// The stdout/stderr sinks for one task, created lazily on first launch.
#[derive(Clone, Debug)]
pub struct RotatorPair {
  pub stderr: Arc<FileRotator>,
  pub stdout: Arc<FileRotator>,
}

impl RotatorPair {
  pub fn create(log_dir: &Path, task: &str, config: &LogConfig) -> Result<Self> {
    let bytes = config.max_file_size_bytes();

    Ok(Self {
      stderr: Arc::new(FileRotator::new(
        log_dir,
        &format!("{task}.stderr"),
        config.max_files,
        bytes,
      )?),
      stdout: Arc::new(FileRotator::new(
        log_dir,
        &format!("{task}.stdout"),
        config.max_files,
        bytes,
      )?),
    })
  }

  pub fn close(&self) -> Vec<Error> {
    let mut errors = Vec::new();

    for rotator in [&self.stdout, &self.stderr] {
      if let Err(error) = rotator.close() {
        errors.push(error);
      }
    }

    errors
  }

  pub fn reconfigure(&self, config: &LogConfig) {
    let bytes = config.max_file_size_bytes();

    self.stdout.reconfigure(config.max_files, bytes);
    self.stderr.reconfigure(config.max_files, bytes);
  }
}
