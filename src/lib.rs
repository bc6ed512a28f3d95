//! Async Redis client: a RESP connection engine and a cluster-aware command
//! dispatcher built on top of it.
//!
//! This crate never initializes a `tracing` subscriber; wiring one up (or
//! not) is left to the embedding application.

mod addr;
mod args;
mod cluster;
mod config;
mod connection;
mod error;
mod pubsub;
mod resp;

pub use addr::ConnectionAddr;
pub use args::{Arg, IntoArg};
pub use cluster::{Cluster, ClusterOptions};
pub use config::{create_cluster, create_connection, ConnectionOptions};
pub use connection::{Connection, Encoding};
pub use error::{Error, Result};
pub use pubsub::{Channel, PubSubMessage};
pub use resp::Value;
