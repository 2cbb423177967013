use super::*;

static SOCKET_SEQUENCE: AtomicU64 = AtomicU64::new(0);

/// Where a syslog server for the task accepts connections.
///
/// On Windows this is a TCP loopback port inside the context's port range;
/// everywhere else it is a unique Unix-domain socket under the system temp
/// directory.
#[derive(Debug)]
pub enum SyslogListener {
  Tcp {
    address: SocketAddr,
    listener: TcpListener,
  },
  #[cfg(unix)]
  Unix {
    listener: UnixListener,
    path: PathBuf,
  },
}

impl SyslogListener {
  #[cfg(unix)]
  pub fn bind(_port_lower: u16, _port_upper: u16) -> Result<Self> {
    let path = env::temp_dir().join(format!(
      "warden-{}-{}.sock",
      std::process::id(),
      SOCKET_SEQUENCE.fetch_add(1, Ordering::Relaxed)
    ));

    if path.exists() {
      fs::remove_file(&path)?;
    }

    let listener = UnixListener::bind(&path)?;

    Ok(Self::Unix { listener, path })
  }

  #[cfg(not(unix))]
  pub fn bind(port_lower: u16, port_upper: u16) -> Result<Self> {
    for port in port_lower..=port_upper {
      if let Ok(listener) = TcpListener::bind(("127.0.0.1", port)) {
        let address = listener.local_addr()?;

        return Ok(Self::Tcp { address, listener });
      }
    }

    Err(Error::Setup(format!(
      "no free syslog port in [{port_lower}, {port_upper}]"
    )))
  }

  /// The address handed back to the caller.
  pub fn address(&self) -> String {
    match self {
      Self::Tcp { address, .. } => address.to_string(),
      #[cfg(unix)]
      Self::Unix { path, .. } => path.display().to_string(),
    }
  }
}

#[cfg(unix)]
impl Drop for SyslogListener {
  fn drop(&mut self) {
    if let Self::Unix { path, .. } = self {
      let _ = fs::remove_file(path);
    }
  }
}
