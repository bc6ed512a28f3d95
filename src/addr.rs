//! Connection address: TCP host/port or a Unix domain socket path.

use std::fmt;
use std::path::{Path, PathBuf};

#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum ConnectionAddr {
    Tcp { host: String, port: u16 },
    Unix(PathBuf),
}

impl fmt::Display for ConnectionAddr {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Tcp { host, port } => write!(f, "{host}:{port}"),
            Self::Unix(path) => write!(f, "{}", path.display()),
        }
    }
}

impl From<(String, u16)> for ConnectionAddr {
    fn from((host, port): (String, u16)) -> Self {
        Self::Tcp { host, port }
    }
}

impl From<(&str, u16)> for ConnectionAddr {
    fn from((host, port): (&str, u16)) -> Self {
        Self::Tcp { host: host.to_owned(), port }
    }
}

impl From<PathBuf> for ConnectionAddr {
    fn from(path: PathBuf) -> Self {
        Self::Unix(path)
    }
}

impl From<&Path> for ConnectionAddr {
    fn from(path: &Path) -> Self {
        Self::Unix(path.to_path_buf())
    }
}
