//! Cluster-aware command dispatcher: `CLUSTER SLOTS` discovery, table-driven
//! key routing, and `MOVED`/`ASK`/`CLUSTERDOWN` redirect handling.

pub mod slot;

use bytes::Bytes;
use std::collections::{HashMap, HashSet};
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Mutex as AsyncMutex;
use tracing::{debug, warn};

use crate::addr::ConnectionAddr;
use crate::args::IntoArg;
use crate::config::ConnectionOptions;
use crate::connection::Connection;
use crate::error::{Error, RedirectKind, Result};
use crate::resp::Value;
use slot::{key_slot, SLOT_COUNT};

#[derive(Debug, Clone)]
pub struct ClusterOptions {
    pub connection: ConnectionOptions,
    /// Maximum number of redirect/retry hops per command before the error
    /// is surfaced to the caller.
    pub max_redirects: u32,
}

impl Default for ClusterOptions {
    fn default() -> Self {
        Self { connection: ConnectionOptions::default(), max_redirects: 16 }
    }
}

type SlotTable = Arc<Vec<Option<SocketAddr>>>;

fn empty_slot_table() -> SlotTable {
    Arc::new(vec![None; SLOT_COUNT as usize])
}

/// Which command arguments are keys, for routing purposes.
enum KeySpec {
    None,
    First,
    All,
    /// Destination key plus source keys, e.g. `RENAME`/`*STORE`; all must
    /// share a slot.
    Store,
    /// `EVAL script numkeys key [key ...] arg [arg ...]`.
    NumKeys,
}

fn key_spec(upper: &[u8]) -> KeySpec {
    match upper {
        b"PING" | b"INFO" | b"CLUSTER" | b"CLIENT" | b"CONFIG" | b"ECHO" | b"COMMAND" | b"DBSIZE"
        | b"TIME" | b"LASTSAVE" | b"SHUTDOWN" => KeySpec::None,
        b"MGET" | b"MSET" | b"MSETNX" | b"DEL" | b"UNLINK" | b"EXISTS" | b"TOUCH" | b"WATCH"
        | b"PFCOUNT" | b"PFMERGE" => KeySpec::All,
        b"RENAME" | b"RENAMENX" | b"SINTERSTORE" | b"SUNIONSTORE" | b"SDIFFSTORE" | b"ZINTERSTORE"
        | b"ZUNIONSTORE" | b"ZDIFFSTORE" | b"COPY" | b"SMOVE" | b"LMOVE" | b"RPOPLPUSH" => KeySpec::Store,
        b"EVAL" | b"EVALSHA" | b"EVAL_RO" | b"EVALSHA_RO" | b"FCALL" | b"FCALL_RO" => KeySpec::NumKeys,
        _ => KeySpec::First,
    }
}

/// Resolves the cluster slot a command routes to, or `None` for a
/// keyless/admin command. Errors if the keys involved hash to more than
/// one slot.
fn route_slot(upper: &[u8], args: &[Bytes]) -> Result<Option<u16>> {
    match key_spec(upper) {
        KeySpec::None => Ok(None),
        KeySpec::First => Ok(args.first().map(|k| key_slot(k))),
        KeySpec::All | KeySpec::Store => same_slot(args.iter()),
        KeySpec::NumKeys => {
            let numkeys: usize =
                args.get(1).and_then(|n| std::str::from_utf8(n).ok()).and_then(|n| n.parse().ok()).unwrap_or(0);
            same_slot(args.iter().skip(2).take(numkeys))
        }
    }
}

fn same_slot<'a>(keys: impl Iterator<Item = &'a Bytes>) -> Result<Option<u16>> {
    let mut slot = None;
    for key in keys {
        let s = key_slot(key);
        match slot {
            None => slot = Some(s),
            Some(prev) if prev != s => {
                return Err(Error::cluster("CROSSSLOT keys don't hash to the same slot"))
            }
            _ => {}
        }
    }
    Ok(slot)
}

fn parse_cluster_slots(value: &Value) -> Result<(Vec<Option<SocketAddr>>, HashSet<SocketAddr>)> {
    let Value::Array(Some(entries)) = value else {
        return Err(Error::Protocol("CLUSTER SLOTS did not return an array".into()));
    };
    let mut table = vec![None; SLOT_COUNT as usize];
    let mut addrs = HashSet::new();
    for entry in entries {
        let Value::Array(Some(fields)) = entry else { continue };
        if fields.len() < 3 {
            continue;
        }
        let (Some(start), Some(end)) = (fields[0].as_int(), fields[1].as_int()) else { continue };
        // fields[2] is the master [ip, port, node-id?]; replicas (if any) follow.
        let Value::Array(Some(master)) = &fields[2] else { continue };
        if master.len() < 2 {
            continue;
        }
        let (Some(ip), Some(port)) = (master[0].as_bytes(), master[1].as_int()) else { continue };
        let ip = String::from_utf8_lossy(ip);
        let addr: SocketAddr = format!("{ip}:{port}")
            .parse()
            .map_err(|_| Error::Protocol("invalid node address in CLUSTER SLOTS".into()))?;
        addrs.insert(addr);
        for slot in start as usize..=(end as usize).min(table.len().saturating_sub(1)) {
            table[slot] = Some(addr);
        }
    }
    Ok((table, addrs))
}

async fn backoff(attempt: u32) {
    let delay = Duration::from_millis(50 * 2u64.saturating_pow(attempt.min(6)));
    tokio::time::sleep(delay).await;
}

/// Routes commands across a Redis Cluster deployment, holding one
/// multiplexed [`Connection`] per discovered master node.
pub struct Cluster {
    seeds: Vec<ConnectionAddr>,
    options: ClusterOptions,
    nodes: AsyncMutex<HashMap<SocketAddr, Connection>>,
    slots: parking_lot::RwLock<SlotTable>,
    refresh_lock: AsyncMutex<()>,
}

impl Cluster {
    pub async fn connect(seeds: Vec<ConnectionAddr>, options: ClusterOptions) -> Result<Self> {
        if seeds.is_empty() {
            return Err(Error::value_error("at least one seed address is required"));
        }
        let cluster = Self {
            seeds,
            options,
            nodes: AsyncMutex::new(HashMap::new()),
            slots: parking_lot::RwLock::new(empty_slot_table()),
            refresh_lock: AsyncMutex::new(()),
        };
        cluster.refresh_slots().await?;
        Ok(cluster)
    }

    fn connection_options(&self) -> ConnectionOptions {
        self.options.connection.clone()
    }

    async fn connect_node(&self, addr: SocketAddr) -> Result<Connection> {
        let conn_addr = ConnectionAddr::Tcp { host: addr.ip().to_string(), port: addr.port() };
        Connection::connect(conn_addr, self.connection_options()).await
    }

    /// Returns the pooled connection for `addr`, opening it lazily on
    /// first use.
    async fn node(&self, addr: SocketAddr) -> Result<Connection> {
        let mut nodes = self.nodes.lock().await;
        if let Some(conn) = nodes.get(&addr) {
            if !conn.is_closed() {
                return Ok(conn.clone());
            }
        }
        let conn = self.connect_node(addr).await?;
        nodes.insert(addr, conn.clone());
        Ok(conn)
    }

    /// Any currently reachable node, used for keyless/admin commands.
    async fn any_node(&self) -> Result<Connection> {
        {
            let nodes = self.nodes.lock().await;
            if let Some((_, conn)) = nodes.iter().find(|(_, c)| !c.is_closed()) {
                return Ok(conn.clone());
            }
        }
        let candidate = {
            let slots = self.slots.read();
            slots.iter().find_map(|s| *s)
        };
        if let Some(addr) = candidate {
            return self.node(addr).await;
        }
        self.connect_seed().await
    }

    async fn connect_seed(&self) -> Result<Connection> {
        let mut last_err = Error::cluster("no reachable seed node");
        for seed in &self.seeds {
            match Connection::connect(seed.clone(), self.connection_options()).await {
                Ok(conn) => return Ok(conn),
                Err(err) => {
                    warn!(%seed, %err, "seed connect failed");
                    last_err = err;
                }
            }
        }
        Err(last_err)
    }

    /// Fetches `CLUSTER SLOTS` from whichever seed answers first and
    /// rebuilds the slot table and node pool. Concurrent callers coalesce
    /// onto the same in-flight refresh via `refresh_lock`.
    async fn refresh_slots(&self) -> Result<()> {
        let _guard = self.refresh_lock.lock().await;
        debug!("refreshing cluster slot table");
        let conn = self.connect_seed().await?;
        let reply = conn.execute("CLUSTER", ["SLOTS"]).await?;
        let (table, addrs) = parse_cluster_slots(&reply)?;
        *self.slots.write() = Arc::new(table);

        let mut nodes = self.nodes.lock().await;
        nodes.retain(|addr, _| addrs.contains(addr));
        Ok(())
    }

    fn addr_for_slot(&self, slot: u16) -> Option<SocketAddr> {
        self.slots.read().get(slot as usize).copied().flatten()
    }

    /// A `MOVED` reply is authoritative on its own; don't let a stale
    /// concurrent `CLUSTER SLOTS` refresh clobber it.
    fn set_slot(&self, slot: u16, addr: SocketAddr) {
        let mut guard = self.slots.write();
        Arc::make_mut(&mut guard)[slot as usize] = Some(addr);
    }

    async fn execute_raw(&self, name: Bytes, args: Vec<Bytes>) -> Result<Value> {
        let upper = name.to_ascii_uppercase();
        let Some(slot) = route_slot(&upper, &args)? else {
            return self.any_node().await?.execute(name, args).await;
        };

        let mut addr = self
            .addr_for_slot(slot)
            .ok_or_else(|| Error::cluster("CLUSTERDOWN slot not covered by any known node"))?;
        let mut asking = false;

        for attempt in 0..=self.options.max_redirects {
            let conn = self.node(addr).await?;
            if asking {
                conn.execute("ASKING", Vec::<Bytes>::new()).await?;
                asking = false;
            }
            match conn.execute(name.clone(), args.clone()).await {
                Ok(value) => return Ok(value),
                Err(err) => {
                    if let Some(redirect) = err.as_redirect() {
                        match redirect.kind {
                            RedirectKind::Moved => {
                                let _ = self.refresh_slots().await;
                                self.set_slot(redirect.slot, redirect.addr);
                                addr = redirect.addr;
                            }
                            RedirectKind::Ask => {
                                addr = redirect.addr;
                                asking = true;
                            }
                        }
                        continue;
                    }
                    if err.is_clusterdown() && attempt < self.options.max_redirects {
                        backoff(attempt).await;
                        continue;
                    }
                    return Err(err);
                }
            }
        }
        Err(Error::cluster("exceeded maximum redirect attempts"))
    }

    /// Sends a command, transparently following `MOVED`/`ASK` redirects and
    /// retrying `CLUSTERDOWN` with backoff, up to `max_redirects` hops.
    pub async fn execute<N, A, I>(&self, name: N, args: I) -> Result<Value>
    where
        N: IntoArg,
        A: IntoArg,
        I: IntoIterator<Item = A>,
    {
        let name_bytes = name.into_arg().into_bytes();
        let arg_bytes: Vec<Bytes> = args.into_iter().map(|a| a.into_arg().into_bytes()).collect();
        self.execute_raw(name_bytes, arg_bytes).await
    }

    pub async fn eval<I>(&self, script: impl IntoArg, keys: Vec<Bytes>, args: I) -> Result<Value>
    where
        I: IntoIterator<Item = Bytes>,
    {
        let mut wire_args = Vec::with_capacity(keys.len() + 2);
        wire_args.push(script.into_arg().into_bytes());
        wire_args.push(Bytes::from(keys.len().to_string()));
        wire_args.extend(keys);
        wire_args.extend(args);
        self.execute("EVAL", wire_args).await
    }

    pub async fn get(&self, key: impl IntoArg) -> Result<Value> {
        self.execute("GET", [key]).await
    }

    pub async fn delete<I, A>(&self, keys: I) -> Result<Value>
    where
        I: IntoIterator<Item = A>,
        A: IntoArg,
    {
        self.execute("DEL", keys).await
    }

    pub async fn script_load(&self, _script: &str) -> Result<Value> {
        Err(Error::cluster("not yet implemented"))
    }

    pub async fn script_exists(&self, _sha: &str) -> Result<Value> {
        Err(Error::cluster("not yet implemented"))
    }

    pub async fn script_flush(&self) -> Result<Value> {
        Err(Error::cluster("not yet implemented"))
    }

    pub async fn script_kill(&self) -> Result<Value> {
        Err(Error::cluster("not yet implemented"))
    }

    /// Closes every pooled node connection and forgets the discovered slot
    /// table; the next routed command triggers fresh discovery from the
    /// original seeds.
    pub async fn clear(&self) -> Result<()> {
        let mut nodes = self.nodes.lock().await;
        for (_, conn) in nodes.drain() {
            conn.close().await;
        }
        *self.slots.write() = empty_slot_table();
        Ok(())
    }
}
