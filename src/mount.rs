use super::*;

#[derive(Debug, Default, PartialEq)]
pub struct MountOptions {
  /// Allow access to character and block devices.
  pub allow_devices: bool,

  /// Instead of bind mounting a directory, mount a device-less filesystem of
  /// this type at `inside_path`, e.g. `proc`.
  pub filesystem: Option<String>,

  /// Disallow execution of binaries.
  pub no_exec: bool,

  /// Do not bind recursively.
  ///
  /// Without this option, mount points in the outside directory tree are
  /// propagated into the task directory.
  pub no_recursive: bool,

  /// Silently skip the mount when the outside directory does not exist.
  pub optional: bool,

  /// Allow read-write access.
  pub read_write: bool,
}

/// One directory the task directory needs before a filesystem-isolated child
/// can run inside it.
#[derive(Debug, Default, PartialEq)]
pub struct Mount {
  /// Path inside the task directory, relative to its root.
  inside_path: PathBuf,

  /// Host path to bind. Defaults to `/<inside_path>`.
  outside_path: Option<PathBuf>,

  options: MountOptions,
}

impl Mount {
  pub fn new(
    inside_path: impl AsRef<Path>,
    outside_path: Option<&Path>,
    options: MountOptions,
  ) -> Self {
    Self {
      inside_path: inside_path.as_ref().to_path_buf(),
      outside_path: outside_path.map(Path::to_path_buf),
      options,
    }
  }

  pub fn device(inside: impl AsRef<Path>, outside: Option<&Path>) -> Self {
    Self::new(
      inside,
      outside,
      MountOptions {
        allow_devices: true,
        ..Default::default()
      },
    )
  }

  pub fn filesystem(inside: impl AsRef<Path>, fs_type: impl Into<String>) -> Self {
    Self::new(
      inside,
      None,
      MountOptions {
        filesystem: Some(fs_type.into()),
        ..Default::default()
      },
    )
  }

  pub fn optional(inside: impl AsRef<Path>, outside: Option<&Path>) -> Self {
    Self::new(
      inside,
      outside,
      MountOptions {
        optional: true,
        ..Default::default()
      },
    )
  }

  pub fn read_only(inside: impl AsRef<Path>, outside: Option<&Path>) -> Self {
    Self::new(inside, outside, MountOptions::default())
  }

  pub fn read_write(inside: impl AsRef<Path>, outside: Option<&Path>) -> Self {
    Self::new(
      inside,
      outside,
      MountOptions {
        read_write: true,
        ..Default::default()
      },
    )
  }

  /// The host directories a task directory is populated with before a child
  /// is confined to it.
  pub fn task_defaults() -> Vec<Mount> {
    vec![
      Mount::read_only("bin", None),
      Mount::device("dev", None),
      Mount::read_only("etc", None),
      Mount::read_only("lib", None),
      Mount::optional("lib64", None),
      Mount::filesystem("proc", "proc"),
      Mount::optional("sbin", None),
      Mount::read_only("usr", None),
    ]
  }

  /// Perform the mount under `root`.
  ///
  /// Returns `None` when an optional mount's source is missing. On success
  /// the returned handle undoes the mount on `release`.
  pub fn establish(&self, root: &Path) -> Result<Option<MountedDir>> {
    let target = root.join(&self.inside_path);

    if let Some(filesystem) = &self.options.filesystem {
      fs::create_dir_all(&target)?;

      mount(
        Some(filesystem.as_str()),
        &target,
        Some(filesystem.as_str()),
        MsFlags::empty(),
        None::<&str>,
      )
      .map_err(|errno| {
        Error::Mount(format!(
          "failed to mount {filesystem} at {}: {errno}",
          target.display()
        ))
      })?;

      return Ok(Some(MountedDir { target }));
    }

    let source = match &self.outside_path {
      Some(path) => path.clone(),
      None => Path::new("/").join(&self.inside_path),
    };

    if !source.exists() {
      ensure!(
        self.options.optional,
        Error::Mount(format!("source {} does not exist", source.display()))
      );

      return Ok(None);
    }

    fs::create_dir_all(&target)?;

    let mut flags = MsFlags::MS_BIND;

    if !self.options.no_recursive {
      flags |= MsFlags::MS_REC;
    }

    mount(Some(&source), &target, None::<&str>, flags, None::<&str>).map_err(|errno| {
      Error::Mount(format!(
        "failed to bind {} at {}: {errno}",
        source.display(),
        target.display()
      ))
    })?;

    // A bind mount ignores ro/nosuid/nodev on the initial call; they only
    // take effect on a remount.
    let mut remount = MsFlags::MS_REMOUNT | MsFlags::MS_BIND | MsFlags::MS_NOSUID;

    if !self.options.read_write {
      remount |= MsFlags::MS_RDONLY;
    }

    if !self.options.allow_devices {
      remount |= MsFlags::MS_NODEV;
    }

    if self.options.no_exec {
      remount |= MsFlags::MS_NOEXEC;
    }

    mount(None::<&str>, &target, None::<&str>, remount, None::<&str>).map_err(|errno| {
      Error::Mount(format!("failed to remount {}: {errno}", target.display()))
    })?;

    Ok(Some(MountedDir { target }))
  }
}

/// A mount that has been established and must be undone on teardown.
#[derive(Debug)]
pub struct MountedDir {
  target: PathBuf,
}

impl MountedDir {
  pub fn release(&self) -> Result {
    umount2(&self.target, MntFlags::MNT_DETACH).map_err(|errno| {
      Error::Mount(format!("failed to unmount {}: {errno}", self.target.display()))
    })
  }
}
