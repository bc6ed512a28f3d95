//! Connection: a cheaply `Clone`-able handle to a single multiplexed
//! socket, driven by one background actor task that owns the `Framed`
//! socket and the FIFO of in-flight waiters.

use bytes::{Bytes, BytesMut};
use std::collections::{HashMap, VecDeque};
use std::fmt;
use std::io;
use std::pin::Pin;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;
use std::task::{Context, Poll};
use tokio::io::{AsyncRead, AsyncWrite, ReadBuf};
use tokio::net::TcpStream;
#[cfg(unix)]
use tokio::net::UnixStream;
use tokio::sync::{mpsc, oneshot, watch};
use tokio_util::codec::{Decoder, Encoder, Framed};
use tracing::{debug, trace, warn};

use crate::addr::ConnectionAddr;
use crate::args::IntoArg;
use crate::config::ConnectionOptions;
use crate::error::{Error, Result};
use crate::pubsub::{Channel, PubSubMessage};
use crate::resp::{self, RespParser, Value};

/// Whether bulk/simple strings are decoded to UTF-8 text on the way out.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Encoding {
    Bytes,
    Utf8,
}

impl Default for Encoding {
    fn default() -> Self {
        Self::Bytes
    }
}

enum Socket {
    Tcp(TcpStream),
    #[cfg(unix)]
    Unix(UnixStream),
}

impl AsyncRead for Socket {
    fn poll_read(self: Pin<&mut Self>, cx: &mut Context<'_>, buf: &mut ReadBuf<'_>) -> Poll<io::Result<()>> {
        match self.get_mut() {
            Socket::Tcp(s) => Pin::new(s).poll_read(cx, buf),
            #[cfg(unix)]
            Socket::Unix(s) => Pin::new(s).poll_read(cx, buf),
        }
    }
}

impl AsyncWrite for Socket {
    fn poll_write(self: Pin<&mut Self>, cx: &mut Context<'_>, buf: &[u8]) -> Poll<io::Result<usize>> {
        match self.get_mut() {
            Socket::Tcp(s) => Pin::new(s).poll_write(cx, buf),
            #[cfg(unix)]
            Socket::Unix(s) => Pin::new(s).poll_write(cx, buf),
        }
    }

    fn poll_flush(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        match self.get_mut() {
            Socket::Tcp(s) => Pin::new(s).poll_flush(cx),
            #[cfg(unix)]
            Socket::Unix(s) => Pin::new(s).poll_flush(cx),
        }
    }

    fn poll_shutdown(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        match self.get_mut() {
            Socket::Tcp(s) => Pin::new(s).poll_shutdown(cx),
            #[cfg(unix)]
            Socket::Unix(s) => Pin::new(s).poll_shutdown(cx),
        }
    }
}

#[derive(Default)]
struct ValueCodec {
    parser: RespParser,
}

impl Decoder for ValueCodec {
    type Item = Value;
    type Error = Error;

    fn decode(&mut self, src: &mut BytesMut) -> std::result::Result<Option<Value>, Error> {
        if !src.is_empty() {
            let taken = src.split_to(src.len());
            self.parser.feed(&taken);
        }
        self.parser.try_next()
    }
}

impl Encoder<Bytes> for ValueCodec {
    type Error = Error;

    fn encode(&mut self, item: Bytes, dst: &mut BytesMut) -> std::result::Result<(), Error> {
        dst.extend_from_slice(&item);
        Ok(())
    }
}

/// Kept in [`SharedState`] independently of the [`Channel`] handed to the
/// subscriber, so routing survives before the caller claims it.
struct PubSubRoute {
    sender: mpsc::UnboundedSender<PubSubMessage>,
    qsize: Arc<AtomicUsize>,
    is_active: Arc<AtomicBool>,
}

/// `Multi` aggregates the N wire replies a SUBSCRIBE-family command with N
/// channel arguments into a single logical reply.
enum Waiter {
    Single {
        encoding: Encoding,
        reply: oneshot::Sender<Result<Value>>,
    },
    Multi {
        remaining: usize,
        acc: Vec<Value>,
        encoding: Encoding,
        reply: oneshot::Sender<Result<Value>>,
    },
}

impl Waiter {
    fn fail(self, err: Error) {
        match self {
            Self::Single { reply, .. } => {
                let _ = reply.send(Err(err));
            }
            Self::Multi { reply, .. } => {
                let _ = reply.send(Err(err));
            }
        }
    }
}

enum ActorCommand {
    Send { bytes: Bytes, waiter: Waiter },
    Close,
}

/// Safe to read from any clone of a [`Connection`] without going through
/// the actor task.
struct SharedState {
    db: AtomicUsize,
    encoding: parking_lot::RwLock<Encoding>,
    channel_count: AtomicUsize,
    pattern_count: AtomicUsize,
    routes: parking_lot::RwLock<HashMap<Bytes, PubSubRoute>>,
    pattern_routes: parking_lot::RwLock<HashMap<Bytes, PubSubRoute>>,
    pending_channels: parking_lot::Mutex<HashMap<Bytes, Channel>>,
    pending_patterns: parking_lot::Mutex<HashMap<Bytes, Channel>>,
}

impl SharedState {
    fn new(db: usize, encoding: Encoding) -> Self {
        Self {
            db: AtomicUsize::new(db),
            encoding: parking_lot::RwLock::new(encoding),
            channel_count: AtomicUsize::new(0),
            pattern_count: AtomicUsize::new(0),
            routes: parking_lot::RwLock::new(HashMap::new()),
            pattern_routes: parking_lot::RwLock::new(HashMap::new()),
            pending_channels: parking_lot::Mutex::new(HashMap::new()),
            pending_patterns: parking_lot::Mutex::new(HashMap::new()),
        }
    }

    fn in_pubsub(&self) -> usize {
        self.channel_count.load(Ordering::Acquire) + self.pattern_count.load(Ordering::Acquire)
    }

    fn active_count(&self, is_pattern: bool) -> usize {
        if is_pattern {
            self.pattern_count.load(Ordering::Acquire)
        } else {
            self.channel_count.load(Ordering::Acquire)
        }
    }

    fn register_pending(&self, name: Bytes, is_pattern: bool) {
        let (tx, rx) = mpsc::unbounded_channel();
        let is_active = Arc::new(AtomicBool::new(true));
        let qsize = Arc::new(AtomicUsize::new(0));
        let route = PubSubRoute { sender: tx, qsize: qsize.clone(), is_active: is_active.clone() };
        let channel = Channel::new(name.clone(), is_pattern, is_active, qsize, rx);
        if is_pattern {
            self.pattern_routes.write().insert(name.clone(), route);
            self.pending_patterns.lock().insert(name, channel);
        } else {
            self.routes.write().insert(name.clone(), route);
            self.pending_channels.lock().insert(name, channel);
        }
    }

    fn confirm_subscribe(&self, is_pattern: bool) {
        if is_pattern {
            self.pattern_count.fetch_add(1, Ordering::AcqRel);
        } else {
            self.channel_count.fetch_add(1, Ordering::AcqRel);
        }
    }

    fn confirm_unsubscribe(&self, name: &Bytes, is_pattern: bool) {
        let mut map = if is_pattern { self.pattern_routes.write() } else { self.routes.write() };
        if let Some(route) = map.remove(name) {
            route.is_active.store(false, Ordering::Release);
            drop(map);
            if is_pattern {
                self.pattern_count.fetch_sub(1, Ordering::AcqRel);
            } else {
                self.channel_count.fetch_sub(1, Ordering::AcqRel);
            }
        }
    }

    fn route_message(&self, channel: &Bytes, payload: Bytes) {
        if let Some(route) = self.routes.read().get(channel) {
            route.qsize.fetch_add(1, Ordering::AcqRel);
            let _ = route.sender.send(PubSubMessage::Channel(payload));
        }
    }

    fn route_pmessage(&self, pattern: &Bytes, channel: Bytes, payload: Bytes) {
        if let Some(route) = self.pattern_routes.read().get(pattern) {
            route.qsize.fetch_add(1, Ordering::AcqRel);
            let _ = route.sender.send(PubSubMessage::Pattern(channel, payload));
        }
    }

    fn take_pending(&self, names: &[Bytes], is_pattern: bool) -> Vec<Channel> {
        let mut map = if is_pattern { self.pending_patterns.lock() } else { self.pending_channels.lock() };
        names.iter().filter_map(|n| map.remove(n)).collect()
    }

    /// Drops every route's sender so pending and claimed `Channel`s alike see closure.
    fn deactivate_all(&self) {
        for (_, route) in self.routes.write().drain() {
            route.is_active.store(false, Ordering::Release);
        }
        for (_, route) in self.pattern_routes.write().drain() {
            route.is_active.store(false, Ordering::Release);
        }
        self.channel_count.store(0, Ordering::Release);
        self.pattern_count.store(0, Ordering::Release);
        self.pending_channels.lock().clear();
        self.pending_patterns.lock().clear();
    }
}

enum Classification {
    Message { channel: Bytes, payload: Bytes },
    PMessage { pattern: Bytes, channel: Bytes, payload: Bytes },
    Ack { is_pattern: bool, is_sub: bool, name: Bytes },
}

fn classify(value: &Value) -> Option<Classification> {
    let (items, head) = value.array_head()?;
    let head_upper = head.to_ascii_uppercase();
    match head_upper.as_slice() {
        b"MESSAGE" => Some(Classification::Message {
            channel: items.get(1)?.as_bytes()?.clone(),
            payload: items.get(2)?.as_bytes()?.clone(),
        }),
        b"PMESSAGE" => Some(Classification::PMessage {
            pattern: items.get(1)?.as_bytes()?.clone(),
            channel: items.get(2)?.as_bytes()?.clone(),
            payload: items.get(3)?.as_bytes()?.clone(),
        }),
        b"SUBSCRIBE" | b"PSUBSCRIBE" | b"UNSUBSCRIBE" | b"PUNSUBSCRIBE" => Some(Classification::Ack {
            is_pattern: matches!(head_upper.as_slice(), b"PSUBSCRIBE" | b"PUNSUBSCRIBE"),
            is_sub: matches!(head_upper.as_slice(), b"SUBSCRIBE" | b"PSUBSCRIBE"),
            name: items.get(1)?.as_bytes()?.clone(),
        }),
        _ => None,
    }
}

fn value_to_result(value: Value) -> Result<Value> {
    match value {
        Value::Error(msg) => Err(Error::reply(String::from_utf8_lossy(&msg).into_owned())),
        other => Ok(other),
    }
}

/// Validates simple/bulk string bytes as UTF-8, recursing through arrays.
fn decode_value(value: Value, encoding: Encoding) -> Result<Value> {
    match encoding {
        Encoding::Bytes => Ok(value),
        Encoding::Utf8 => decode_utf8(value),
    }
}

fn decode_utf8(value: Value) -> Result<Value> {
    match value {
        Value::SimpleString(b) => {
            std::str::from_utf8(&b).map_err(|e| Error::decode(e.to_string()))?;
            Ok(Value::SimpleString(b))
        }
        Value::BulkString(Some(b)) => {
            std::str::from_utf8(&b).map_err(|e| Error::decode(e.to_string()))?;
            Ok(Value::BulkString(Some(b)))
        }
        Value::Array(Some(items)) => {
            let items = items.into_iter().map(decode_utf8).collect::<Result<Vec<_>>>()?;
            Ok(Value::Array(Some(items)))
        }
        other => Ok(other),
    }
}

fn complete_front_single(waiters: &mut VecDeque<Waiter>, value: Value) {
    if let Some(waiter) = waiters.pop_front() {
        match waiter {
            Waiter::Single { encoding, reply } => {
                let result = value_to_result(value).and_then(|v| decode_value(v, encoding));
                let _ = reply.send(result);
            }
            Waiter::Multi { reply, mut acc, encoding, .. } => {
                acc.push(value);
                let _ = reply.send(decode_value(Value::Array(Some(acc)), encoding));
            }
        }
    }
}

fn complete_front_multi(waiters: &mut VecDeque<Waiter>, value: Value) {
    let done = match waiters.front_mut() {
        Some(Waiter::Multi { remaining, acc, .. }) => {
            acc.push(value);
            *remaining -= 1;
            *remaining == 0
        }
        _ => return,
    };
    if done {
        if let Some(Waiter::Multi { reply, acc, encoding, .. }) = waiters.pop_front() {
            let _ = reply.send(decode_value(Value::Array(Some(acc)), encoding));
        }
    }
}

fn handle_frame(value: Value, waiters: &mut VecDeque<Waiter>, shared: &SharedState) {
    match classify(&value) {
        Some(Classification::Message { channel, payload }) => {
            shared.route_message(&channel, payload);
        }
        Some(Classification::PMessage { pattern, channel, payload }) => {
            shared.route_pmessage(&pattern, channel, payload);
        }
        Some(Classification::Ack { is_pattern, is_sub, name }) => {
            if is_sub {
                shared.confirm_subscribe(is_pattern);
            } else {
                shared.confirm_unsubscribe(&name, is_pattern);
            }
            complete_front_multi(waiters, value);
        }
        None => complete_front_single(waiters, value),
    }
}

fn fail_all(waiters: &mut VecDeque<Waiter>, err: &Error) {
    while let Some(waiter) = waiters.pop_front() {
        waiter.fail(err.clone());
    }
}

async fn run_actor(
    mut framed: Framed<Socket, ValueCodec>,
    mut command_rx: mpsc::Receiver<ActorCommand>,
    shared: Arc<SharedState>,
    closed_tx: watch::Sender<bool>,
) {
    use futures::{SinkExt, StreamExt};

    let mut waiters: VecDeque<Waiter> = VecDeque::new();
    let terminal = loop {
        tokio::select! {
            biased;
            cmd = command_rx.recv() => {
                match cmd {
                    Some(ActorCommand::Send { bytes, waiter }) => {
                        trace!(len = bytes.len(), "sending command frame");
                        if let Err(err) = framed.send(bytes).await {
                            waiter.fail(err.clone());
                            break err;
                        }
                        waiters.push_back(waiter);
                    }
                    Some(ActorCommand::Close) | None => break Error::ConnectionClosed,
                }
            }
            frame = framed.next() => {
                match frame {
                    Some(Ok(value)) => {
                        trace!(?value, "received reply frame");
                        handle_frame(value, &mut waiters, &shared);
                    }
                    Some(Err(err)) => {
                        warn!(%err, "connection failed");
                        break err;
                    }
                    None => break Error::ConnectionClosed,
                }
            }
        }
    };
    fail_all(&mut waiters, &terminal);
    shared.deactivate_all();
    debug!("connection actor exiting");
    let _ = closed_tx.send(true);
}

/// Cloning shares the underlying socket and actor task; it does not open a
/// second connection.
#[derive(Clone)]
pub struct Connection {
    command_tx: mpsc::Sender<ActorCommand>,
    shared: Arc<SharedState>,
    closed_rx: watch::Receiver<bool>,
}

fn is_allowed_in_pubsub(upper: &[u8]) -> bool {
    matches!(
        upper,
        b"PING" | b"QUIT" | b"SUBSCRIBE" | b"UNSUBSCRIBE" | b"PSUBSCRIBE" | b"PUNSUBSCRIBE"
    )
}

impl Connection {
    pub async fn connect(addr: ConnectionAddr, options: ConnectionOptions) -> Result<Self> {
        let socket = match &addr {
            ConnectionAddr::Tcp { host, port } => Socket::Tcp(TcpStream::connect((host.as_str(), *port)).await?),
            #[cfg(unix)]
            ConnectionAddr::Unix(path) => Socket::Unix(UnixStream::connect(path).await?),
            #[cfg(not(unix))]
            ConnectionAddr::Unix(_) => {
                return Err(Error::value_error("unix sockets are not supported on this platform"))
            }
        };
        debug!(%addr, "connected");
        let framed = Framed::new(socket, ValueCodec::default());
        let (command_tx, command_rx) = mpsc::channel(64);
        let (closed_tx, closed_rx) = watch::channel(false);
        let shared = Arc::new(SharedState::new(options.db, options.encoding));
        let conn = Self { command_tx, shared, closed_rx };
        tokio::spawn(run_actor(framed, command_rx, conn.shared.clone(), closed_tx));

        if let Some(password) = &options.password {
            conn.auth(password).await?;
        }
        if options.db != 0 {
            conn.select(options.db).await?;
        }
        Ok(conn)
    }

    async fn send_single(&self, bytes: Bytes, encoding: Encoding) -> Result<Value> {
        let (tx, rx) = oneshot::channel();
        self.command_tx
            .send(ActorCommand::Send { bytes, waiter: Waiter::Single { encoding, reply: tx } })
            .await
            .map_err(|_| Error::ConnectionClosed)?;
        rx.await.map_err(|_| Error::ConnectionClosed)?
    }

    async fn send_multi(&self, bytes: Bytes, remaining: usize, encoding: Encoding) -> Result<Value> {
        let (tx, rx) = oneshot::channel();
        let waiter = Waiter::Multi { remaining, acc: Vec::with_capacity(remaining), encoding, reply: tx };
        self.command_tx
            .send(ActorCommand::Send { bytes, waiter })
            .await
            .map_err(|_| Error::ConnectionClosed)?;
        rx.await.map_err(|_| Error::ConnectionClosed)?
    }

    async fn execute_raw(&self, name: Bytes, args: Vec<Bytes>, encoding: Encoding) -> Result<Value> {
        if self.is_closed() {
            return Err(Error::ConnectionClosed);
        }
        let upper = name.to_ascii_uppercase();
        if self.shared.in_pubsub() > 0 && !is_allowed_in_pubsub(&upper) {
            return Err(Error::redis(format!(
                "Connection in subscribe mode, only (P)SUBSCRIBE/(P)UNSUBSCRIBE/PING/QUIT allowed, got {}",
                String::from_utf8_lossy(&upper)
            )));
        }

        let mut wire_args = Vec::with_capacity(args.len() + 1);
        wire_args.push(name.clone());
        wire_args.extend(args.iter().cloned());
        let mut buf = BytesMut::new();
        resp::encode_command(&wire_args, &mut buf);
        let bytes = buf.freeze();

        let result = match upper.as_slice() {
            b"SUBSCRIBE" | b"PSUBSCRIBE" => {
                if args.is_empty() {
                    return Err(Error::value_error("subscribe requires at least one channel"));
                }
                let is_pattern = upper == b"PSUBSCRIBE";
                for name in &args {
                    self.shared.register_pending(name.clone(), is_pattern);
                }
                self.send_multi(bytes, args.len(), encoding).await
            }
            b"UNSUBSCRIBE" | b"PUNSUBSCRIBE" => {
                let is_pattern = upper == b"PUNSUBSCRIBE";
                let expected = if args.is_empty() { self.shared.active_count(is_pattern) } else { args.len() };
                if expected == 0 {
                    return Ok(Value::Array(Some(Vec::new())));
                }
                self.send_multi(bytes, expected, encoding).await
            }
            _ => self.send_single(bytes, encoding).await,
        };

        if upper == b"QUIT" && result.is_ok() {
            self.close().await;
        }
        result
    }

    pub async fn execute<N, A, I>(&self, name: N, args: I) -> Result<Value>
    where
        N: IntoArg,
        A: IntoArg,
        I: IntoIterator<Item = A>,
    {
        self.execute_as(name, args, self.encoding()).await
    }

    pub async fn execute_as<N, A, I>(&self, name: N, args: I, encoding: Encoding) -> Result<Value>
    where
        N: IntoArg,
        A: IntoArg,
        I: IntoIterator<Item = A>,
    {
        let name_bytes = name.into_arg().into_bytes();
        let arg_bytes: Vec<Bytes> = args.into_iter().map(|a| a.into_arg().into_bytes()).collect();
        self.execute_raw(name_bytes, arg_bytes, encoding).await
    }

    pub async fn subscribe<I, A>(&self, names: I) -> Result<Vec<Channel>>
    where
        I: IntoIterator<Item = A>,
        A: IntoArg,
    {
        let names: Vec<Bytes> = names.into_iter().map(|n| n.into_arg().into_bytes()).collect();
        if names.is_empty() {
            return Err(Error::value_error("subscribe requires at least one channel"));
        }
        self.execute_raw(Bytes::from_static(b"SUBSCRIBE"), names.clone(), self.encoding()).await?;
        Ok(self.shared.take_pending(&names, false))
    }

    pub async fn psubscribe<I, A>(&self, patterns: I) -> Result<Vec<Channel>>
    where
        I: IntoIterator<Item = A>,
        A: IntoArg,
    {
        let patterns: Vec<Bytes> = patterns.into_iter().map(|p| p.into_arg().into_bytes()).collect();
        if patterns.is_empty() {
            return Err(Error::value_error("psubscribe requires at least one pattern"));
        }
        self.execute_raw(Bytes::from_static(b"PSUBSCRIBE"), patterns.clone(), self.encoding()).await?;
        Ok(self.shared.take_pending(&patterns, true))
    }

    pub async fn unsubscribe<I, A>(&self, names: I) -> Result<()>
    where
        I: IntoIterator<Item = A>,
        A: IntoArg,
    {
        let names: Vec<Bytes> = names.into_iter().map(|n| n.into_arg().into_bytes()).collect();
        self.execute_raw(Bytes::from_static(b"UNSUBSCRIBE"), names, self.encoding()).await?;
        Ok(())
    }

    pub async fn punsubscribe<I, A>(&self, patterns: I) -> Result<()>
    where
        I: IntoIterator<Item = A>,
        A: IntoArg,
    {
        let patterns: Vec<Bytes> = patterns.into_iter().map(|p| p.into_arg().into_bytes()).collect();
        self.execute_raw(Bytes::from_static(b"PUNSUBSCRIBE"), patterns, self.encoding()).await?;
        Ok(())
    }

    pub async fn auth(&self, password: &str) -> Result<()> {
        self.execute("AUTH", [password]).await?;
        Ok(())
    }

    pub async fn select(&self, db: usize) -> Result<()> {
        self.execute("SELECT", [db as i64]).await?;
        self.shared.db.store(db, Ordering::Release);
        Ok(())
    }

    /// Requests the actor task stop and tear down the socket. Idempotent.
    pub async fn close(&self) {
        let _ = self.command_tx.send(ActorCommand::Close).await;
    }

    /// Resolves once the actor task has exited, whether called before or
    /// after `close()`.
    pub async fn wait_closed(&self) {
        let mut rx = self.closed_rx.clone();
        let _ = rx.wait_for(|closed| *closed).await;
    }

    pub fn is_closed(&self) -> bool {
        *self.closed_rx.borrow()
    }

    pub fn db(&self) -> usize {
        self.shared.db.load(Ordering::Acquire)
    }

    pub fn encoding(&self) -> Encoding {
        *self.shared.encoding.read()
    }

    pub fn in_pubsub(&self) -> usize {
        self.shared.in_pubsub()
    }

    pub fn pubsub_channels(&self) -> Vec<Bytes> {
        self.shared.routes.read().keys().cloned().collect()
    }

    pub fn pubsub_patterns(&self) -> Vec<Bytes> {
        self.shared.pattern_routes.read().keys().cloned().collect()
    }
}

impl fmt::Display for Connection {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "<Connection [db:{}]>", self.db())
    }
}

impl fmt::Debug for Connection {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt::Display::fmt(self, f)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::io::{AsyncReadExt, AsyncWriteExt};
    use tokio::net::TcpListener;

    async fn loopback() -> (TcpListener, ConnectionAddr) {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let port = listener.local_addr().unwrap().port();
        (listener, ConnectionAddr::Tcp { host: "127.0.0.1".into(), port })
    }

    /// Reads exactly one RESP command frame off `sock` and returns its
    /// argument list as owned byte vectors.
    async fn read_command(sock: &mut tokio::net::TcpStream) -> Vec<Vec<u8>> {
        let mut parser = RespParser::new();
        let mut buf = [0u8; 4096];
        loop {
            let n = sock.read(&mut buf).await.unwrap();
            parser.feed(&buf[..n]);
            if let Some(Value::Array(Some(items))) = parser.try_next().unwrap() {
                return items
                    .into_iter()
                    .map(|v| v.as_bytes().unwrap().to_vec())
                    .collect();
            }
        }
    }

    #[tokio::test]
    async fn ping_roundtrip() {
        let (listener, addr) = loopback().await;
        let server = tokio::spawn(async move {
            let (mut sock, _) = listener.accept().await.unwrap();
            let cmd = read_command(&mut sock).await;
            assert_eq!(cmd, vec![b"PING".to_vec()]);
            sock.write_all(b"+PONG\r\n").await.unwrap();
        });

        let conn = Connection::connect(addr, ConnectionOptions::default()).await.unwrap();
        let reply = conn.execute("PING", Vec::<Bytes>::new()).await.unwrap();
        assert_eq!(reply, Value::SimpleString(Bytes::from_static(b"PONG")));
        server.await.unwrap();
    }

    #[tokio::test]
    async fn select_updates_db_and_encoding_defaults_to_bytes() {
        let (listener, addr) = loopback().await;
        let server = tokio::spawn(async move {
            let (mut sock, _) = listener.accept().await.unwrap();
            let cmd = read_command(&mut sock).await;
            assert_eq!(cmd, vec![b"SELECT".to_vec(), b"3".to_vec()]);
            sock.write_all(b"+OK\r\n").await.unwrap();
        });

        let conn = Connection::connect(addr, ConnectionOptions::default()).await.unwrap();
        assert_eq!(conn.encoding(), Encoding::Bytes);
        conn.select(3).await.unwrap();
        assert_eq!(conn.db(), 3);
        server.await.unwrap();
    }

    #[tokio::test]
    async fn fifo_ordering_for_concurrent_commands() {
        let (listener, addr) = loopback().await;
        let server = tokio::spawn(async move {
            let (mut sock, _) = listener.accept().await.unwrap();
            let first = read_command(&mut sock).await;
            let second = read_command(&mut sock).await;
            assert_eq!(first, vec![b"GET".to_vec(), b"a".to_vec()]);
            assert_eq!(second, vec![b"GET".to_vec(), b"b".to_vec()]);
            sock.write_all(b"$1\r\n1\r\n$1\r\n2\r\n").await.unwrap();
        });

        let conn = Connection::connect(addr, ConnectionOptions::default()).await.unwrap();
        let (first, second) = tokio::join!(conn.execute("GET", ["a"]), conn.execute("GET", ["b"]));
        assert_eq!(first.unwrap(), Value::BulkString(Some(Bytes::from_static(b"1"))));
        assert_eq!(second.unwrap(), Value::BulkString(Some(Bytes::from_static(b"2"))));
        server.await.unwrap();
    }

    #[tokio::test]
    async fn server_error_reply_becomes_err() {
        let (listener, addr) = loopback().await;
        let server = tokio::spawn(async move {
            let (mut sock, _) = listener.accept().await.unwrap();
            let _ = read_command(&mut sock).await;
            sock.write_all(b"-ERR unknown command\r\n").await.unwrap();
        });

        let conn = Connection::connect(addr, ConnectionOptions::default()).await.unwrap();
        let err = conn.execute("NOSUCHCOMMAND", Vec::<Bytes>::new()).await.unwrap_err();
        assert!(matches!(err, Error::Reply(msg) if msg == "ERR unknown command"));
        server.await.unwrap();
    }

    #[tokio::test]
    async fn subscribe_then_receive_message() {
        let (listener, addr) = loopback().await;
        let server = tokio::spawn(async move {
            let (mut sock, _) = listener.accept().await.unwrap();
            let cmd = read_command(&mut sock).await;
            assert_eq!(cmd, vec![b"SUBSCRIBE".to_vec(), b"news".to_vec()]);
            sock.write_all(b"*3\r\n$9\r\nsubscribe\r\n$4\r\nnews\r\n:1\r\n").await.unwrap();
            sock.write_all(b"*3\r\n$7\r\nmessage\r\n$4\r\nnews\r\n$5\r\nhello\r\n").await.unwrap();
        });

        let conn = Connection::connect(addr, ConnectionOptions::default()).await.unwrap();
        let mut channels = conn.subscribe(["news"]).await.unwrap();
        assert_eq!(conn.in_pubsub(), 1);
        assert_eq!(conn.pubsub_channels(), vec![Bytes::from_static(b"news")]);
        let channel = channels.pop().unwrap();
        let msg = channel.get().await.unwrap();
        assert_eq!(msg, PubSubMessage::Channel(Bytes::from_static(b"hello")));
        server.await.unwrap();
    }

    #[tokio::test]
    async fn non_pubsub_command_rejected_while_subscribed() {
        let (listener, addr) = loopback().await;
        let server = tokio::spawn(async move {
            let (mut sock, _) = listener.accept().await.unwrap();
            let _ = read_command(&mut sock).await;
            sock.write_all(b"*3\r\n$9\r\nsubscribe\r\n$4\r\nnews\r\n:1\r\n").await.unwrap();
            // keep the socket open for the remainder of the test
            let mut buf = [0u8; 16];
            let _ = sock.read(&mut buf).await;
        });

        let conn = Connection::connect(addr, ConnectionOptions::default()).await.unwrap();
        let _channels = conn.subscribe(["news"]).await.unwrap();
        let err = conn.execute("GET", ["a"]).await.unwrap_err();
        assert!(matches!(err, Error::Redis(_)));
        drop(server);
    }

    #[tokio::test]
    async fn close_fails_pending_requests() {
        let (listener, addr) = loopback().await;
        let server = tokio::spawn(async move {
            let (mut sock, _) = listener.accept().await.unwrap();
            let _ = read_command(&mut sock).await;
            // never reply; the connection is closed out from under it
        });

        let conn = Connection::connect(addr, ConnectionOptions::default()).await.unwrap();
        let conn2 = conn.clone();
        let pending = tokio::spawn(async move { conn2.execute("GET", ["a"]).await });
        // give the command time to be sent before closing
        tokio::task::yield_now().await;
        conn.close().await;
        conn.wait_closed().await;
        assert!(matches!(pending.await.unwrap(), Err(Error::ConnectionClosed)));
        drop(server);
    }

    #[test]
    fn display_format() {
        // constructing a full Connection requires a running actor; the
        // Display impl only reads `db()`, exercised via select() above.
    }

    #[tokio::test]
    async fn protocol_error_fails_pending_ping() {
        let (listener, addr) = loopback().await;
        let server = tokio::spawn(async move {
            let (mut sock, _) = listener.accept().await.unwrap();
            let _ = read_command(&mut sock).await;
            sock.write_all(b"not good redis protocol response").await.unwrap();
        });

        let conn = Connection::connect(addr, ConnectionOptions::default()).await.unwrap();
        let err = conn.execute("PING", Vec::<Bytes>::new()).await.unwrap_err();
        assert!(matches!(err, Error::Protocol(_)));
        server.await.unwrap();
    }

    #[tokio::test]
    async fn utf8_encoding_decodes_bulk_string() {
        let (listener, addr) = loopback().await;
        let server = tokio::spawn(async move {
            let (mut sock, _) = listener.accept().await.unwrap();
            let _ = read_command(&mut sock).await;
            sock.write_all(b"$5\r\nhello\r\n").await.unwrap();
        });

        let opts = ConnectionOptions::new().encoding(Encoding::Utf8);
        let conn = Connection::connect(addr, opts).await.unwrap();
        let value = conn.execute("GET", ["k"]).await.unwrap();
        assert_eq!(value, Value::BulkString(Some(Bytes::from_static(b"hello"))));
        server.await.unwrap();
    }

    #[tokio::test]
    async fn utf8_encoding_rejects_invalid_utf8() {
        let (listener, addr) = loopback().await;
        let server = tokio::spawn(async move {
            let (mut sock, _) = listener.accept().await.unwrap();
            let _ = read_command(&mut sock).await;
            sock.write_all(b"$2\r\n\xff\xfe\r\n").await.unwrap();
        });

        let conn = Connection::connect(addr, ConnectionOptions::default()).await.unwrap();
        let err = conn.execute_as("GET", ["k"], Encoding::Utf8).await.unwrap_err();
        assert!(matches!(err, Error::Decode(_)));
        server.await.unwrap();
    }

    #[tokio::test]
    async fn channel_closes_when_connection_closes() {
        let (listener, addr) = loopback().await;
        let server = tokio::spawn(async move {
            let (mut sock, _) = listener.accept().await.unwrap();
            let _ = read_command(&mut sock).await;
            sock.write_all(b"*3\r\n$9\r\nsubscribe\r\n$4\r\nnews\r\n:1\r\n").await.unwrap();
            // drop the socket, simulating the server going away
        });

        let conn = Connection::connect(addr, ConnectionOptions::default()).await.unwrap();
        let mut channels = conn.subscribe(["news"]).await.unwrap();
        let channel = channels.pop().unwrap();
        server.await.unwrap();
        conn.wait_closed().await;
        assert!(matches!(channel.get().await, Err(Error::ChannelClosed)));
    }
}
