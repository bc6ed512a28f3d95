//! Consumer-facing pub/sub channel handle.

use bytes::Bytes;
use std::fmt;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;
use tokio::sync::{mpsc, Mutex};

use crate::error::{Error, Result};

/// A message pushed onto a [`Channel`] by the connection's actor task.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PubSubMessage {
    Channel(Bytes),
    Pattern(Bytes, Bytes),
}

/// A consumer handle for one subscribed channel or pattern.
///
/// `get()` may be called concurrently from multiple tasks; the internal
/// mpsc receiver is guarded by a `tokio::sync::Mutex` so each call dequeues
/// a distinct message rather than racing on the same one.
pub struct Channel {
    name: Bytes,
    is_pattern: bool,
    is_active: Arc<AtomicBool>,
    qsize: Arc<AtomicUsize>,
    receiver: Mutex<mpsc::UnboundedReceiver<PubSubMessage>>,
}

impl Channel {
    pub(crate) fn new(
        name: Bytes,
        is_pattern: bool,
        is_active: Arc<AtomicBool>,
        qsize: Arc<AtomicUsize>,
        receiver: mpsc::UnboundedReceiver<PubSubMessage>,
    ) -> Self {
        Self {
            name,
            is_pattern,
            is_active,
            qsize,
            receiver: Mutex::new(receiver),
        }
    }

    pub fn name(&self) -> &Bytes {
        &self.name
    }

    pub fn is_pattern(&self) -> bool {
        self.is_pattern
    }

    pub fn is_active(&self) -> bool {
        self.is_active.load(Ordering::Acquire)
    }

    /// Current number of buffered, not-yet-consumed messages.
    pub fn qsize(&self) -> usize {
        self.qsize.load(Ordering::Acquire)
    }

    /// Waits for and returns the next message. Returns
    /// [`Error::ChannelClosed`] once the channel has been unsubscribed and
    /// drained, or the connection has closed.
    pub async fn get(&self) -> Result<PubSubMessage> {
        let mut receiver = self.receiver.lock().await;
        match receiver.recv().await {
            Some(msg) => {
                self.qsize.fetch_sub(1, Ordering::AcqRel);
                Ok(msg)
            }
            None => Err(Error::ChannelClosed),
        }
    }
}

impl fmt::Display for Channel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "<Channel name:{}, is_pattern:{}, qsize:{}>",
            String::from_utf8_lossy(&self.name),
            self.is_pattern,
            self.qsize()
        )
    }
}

impl fmt::Debug for Channel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt::Display::fmt(self, f)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn make_channel() -> (Channel, mpsc::UnboundedSender<PubSubMessage>) {
        let (tx, rx) = mpsc::unbounded_channel();
        let channel = Channel::new(
            Bytes::from_static(b"news"),
            false,
            Arc::new(AtomicBool::new(true)),
            Arc::new(AtomicUsize::new(0)),
            rx,
        );
        (channel, tx)
    }

    #[tokio::test]
    async fn delivers_message_and_decrements_qsize() {
        let (channel, tx) = make_channel();
        channel.qsize.fetch_add(1, Ordering::AcqRel);
        tx.send(PubSubMessage::Channel(Bytes::from_static(b"hello"))).unwrap();
        let msg = channel.get().await.unwrap();
        assert_eq!(msg, PubSubMessage::Channel(Bytes::from_static(b"hello")));
        assert_eq!(channel.qsize(), 0);
    }

    #[tokio::test]
    async fn closed_channel_errors() {
        let (channel, tx) = make_channel();
        drop(tx);
        assert!(matches!(channel.get().await, Err(Error::ChannelClosed)));
    }

    #[test]
    fn display_format() {
        let (channel, _tx) = make_channel();
        assert_eq!(
            channel.to_string(),
            "<Channel name:news, is_pattern:false, qsize:0>"
        );
    }

    #[tokio::test]
    async fn concurrent_getters_each_receive_distinct_message() {
        let (channel, tx) = make_channel();
        let channel = Arc::new(channel);
        tx.send(PubSubMessage::Channel(Bytes::from_static(b"a"))).unwrap();
        tx.send(PubSubMessage::Channel(Bytes::from_static(b"b"))).unwrap();
        channel.qsize.fetch_add(2, Ordering::AcqRel);

        let c1 = channel.clone();
        let c2 = channel.clone();
        let (m1, m2) = tokio::join!(
            tokio::spawn(async move { c1.get().await.unwrap() }),
            tokio::spawn(async move { c2.get().await.unwrap() }),
        );
        let mut got = vec![m1.unwrap(), m2.unwrap()];
        got.sort_by_key(|m| match m {
            PubSubMessage::Channel(b) => b.clone(),
            PubSubMessage::Pattern(_, b) => b.clone(),
        });
        assert_eq!(
            got,
            vec![
                PubSubMessage::Channel(Bytes::from_static(b"a")),
                PubSubMessage::Channel(Bytes::from_static(b"b")),
            ]
        );
    }
}
