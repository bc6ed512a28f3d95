//! Connection/cluster options and the `create_*` factory functions.

use std::time::Duration;

use crate::addr::ConnectionAddr;
use crate::cluster::{Cluster, ClusterOptions};
use crate::connection::{Connection, Encoding};
use crate::error::Result;

/// Options for [`crate::connection::Connection::connect`] / [`create_connection`].
#[derive(Debug, Clone, Default)]
pub struct ConnectionOptions {
    pub db: usize,
    pub password: Option<String>,
    pub encoding: Encoding,
    pub timeout: Option<Duration>,
}

impl ConnectionOptions {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn db(mut self, db: usize) -> Self {
        self.db = db;
        self
    }

    pub fn password(mut self, password: impl Into<String>) -> Self {
        self.password = Some(password.into());
        self
    }

    pub fn encoding(mut self, encoding: Encoding) -> Self {
        self.encoding = encoding;
        self
    }

    pub fn timeout(mut self, timeout: Duration) -> Self {
        self.timeout = Some(timeout);
        self
    }
}

/// Opens a single non-cluster connection.
pub async fn create_connection(addr: impl Into<ConnectionAddr>, options: ConnectionOptions) -> Result<Connection> {
    Connection::connect(addr.into(), options).await
}

/// Builds a cluster dispatcher, discovering topology from whichever seed
/// node answers first. See [`ClusterOptions`] (defined in [`crate::cluster`]
/// and re-exported here) for the redirect-retry budget.
pub async fn create_cluster(seeds: Vec<ConnectionAddr>, options: ClusterOptions) -> Result<Cluster> {
    Cluster::connect(seeds, options).await
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn connection_options_builder() {
        let opts = ConnectionOptions::new().db(2).password("hunter2").encoding(Encoding::Utf8);
        assert_eq!(opts.db, 2);
        assert_eq!(opts.password.as_deref(), Some("hunter2"));
        assert_eq!(opts.encoding, Encoding::Utf8);
    }

    #[test]
    fn cluster_options_default_redirects() {
        assert_eq!(ClusterOptions::default().max_redirects, 16);
    }
}

