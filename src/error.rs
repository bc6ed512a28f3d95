use std::net::SocketAddr;

#[derive(Debug, Clone, thiserror::Error)]
pub enum Error {
    #[error("TypeError: {0}")]
    TypeError(String),

    #[error("ValueError: {0}")]
    ValueError(String),

    #[error("connection is closed")]
    ConnectionClosed,

    /// Once raised, the parser stays poisoned and the connection is torn down.
    #[error("ProtocolError: {0}")]
    Protocol(String),

    #[error("{0}")]
    Reply(String),

    #[error("{0}")]
    Redis(String),

    #[error("{0}")]
    Cluster(String),

    #[error("channel is closed")]
    ChannelClosed,

    #[error("DecodeError: {0}")]
    Decode(String),

    #[error(transparent)]
    Io(#[from] std::io::Error),
}

impl Error {
    pub(crate) fn type_error(msg: impl Into<String>) -> Self {
        Self::TypeError(msg.into())
    }

    pub(crate) fn value_error(msg: impl Into<String>) -> Self {
        Self::ValueError(msg.into())
    }

    pub(crate) fn reply(msg: impl Into<String>) -> Self {
        Self::Reply(msg.into())
    }

    pub(crate) fn redis(msg: impl Into<String>) -> Self {
        Self::Redis(msg.into())
    }

    pub(crate) fn cluster(msg: impl Into<String>) -> Self {
        Self::Cluster(msg.into())
    }

    pub(crate) fn decode(msg: impl Into<String>) -> Self {
        Self::Decode(msg.into())
    }

    pub(crate) fn as_redirect(&self) -> Option<Redirect> {
        let Self::Reply(msg) = self else {
            return None;
        };
        parse_redirect(msg)
    }

    pub(crate) fn is_clusterdown(&self) -> bool {
        matches!(self, Self::Reply(msg) if msg.starts_with("CLUSTERDOWN"))
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum RedirectKind {
    Moved,
    Ask,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) struct Redirect {
    pub kind: RedirectKind,
    pub slot: u16,
    pub addr: SocketAddr,
}

fn parse_redirect(msg: &str) -> Option<Redirect> {
    let mut parts = msg.split_whitespace();
    let kind = match parts.next()? {
        "MOVED" => RedirectKind::Moved,
        "ASK" => RedirectKind::Ask,
        _ => return None,
    };
    let slot: u16 = parts.next()?.parse().ok()?;
    let addr: SocketAddr = parts.next()?.parse().ok()?;
    Some(Redirect { kind, slot, addr })
}

pub type Result<T> = std::result::Result<T, Error>;
