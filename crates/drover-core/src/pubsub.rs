//! Abstract pub/sub bus, topic matching, and the bus bindings.
//!
//! The core never talks to a concrete broker; it consumes the [`PubSub`]
//! capability set and provides everything that is broker-independent:
//! segment-wise topic matching with `+`/`#` wildcards, the subscription
//! table implementations route through, the packet transport that maps a
//! controller's `cmd`/`msg` topic pair onto [`PacketRead`]/[`PacketWrite`],
//! retained-metadata discovery, and the registrar/connector bindings.
//!
//! Implementations must deliver each message exactly once per matching
//! subscription and re-subscribe every filter after a reconnect
//! ([`SubscriptionTable::filters`] is the snapshot to replay).

use std::{
    collections::HashMap,
    io,
    sync::{Arc, Mutex},
    time::Duration,
};

use async_trait::async_trait;
use bytes::Bytes;
use tokio::sync::mpsc;
use tracing::debug;

use drover_proto::Registry;

use crate::{
    conn::Conn,
    error::RunError,
    meta::{ControllerInfo, ControllerMeta, ControllerRef},
    registrar::Registrar,
    runner::{RunContext, Runnable},
    scheduler::{Loop, LoopAdder},
    transport::{PacketRead, PacketWrite},
};

/// Callback invoked per delivered message, with the topic relative to
/// the bus's prefix.
pub type TopicHandler = Arc<dyn Fn(&str, &[u8]) + Send + Sync>;

/// Identifies one subscription on a bus.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct SubId(pub u64);

/// The capability set a broker client must provide.
#[async_trait]
pub trait PubSub: Send + Sync + 'static {
    /// Publishes to a topic. `retain` asks the broker to replay the
    /// payload to future subscribers; an empty retained payload clears
    /// the slot.
    async fn publish(&self, topic: &str, payload: Bytes, qos: u8, retain: bool)
        -> io::Result<()>;

    /// Subscribes a handler to a topic filter (wildcards allowed).
    async fn subscribe(&self, filter: &str, handler: TopicHandler) -> io::Result<SubId>;

    /// Removes a subscription.
    async fn unsubscribe(&self, id: SubId) -> io::Result<()>;

    /// Disconnects from the broker.
    async fn close(&self) -> io::Result<()>;
}

/// Matches a concrete topic against a filter.
///
/// Comparison is segment by segment: `+` accepts any single segment and
/// a trailing `#` accepts the rest. A filter with fewer segments than
/// the topic (and no `#`) matches as a prefix.
pub fn topic_matches(topic: &str, filter: &str) -> bool {
    let topic: Vec<&str> = topic.split('/').collect();
    let filter: Vec<&str> = filter.split('/').collect();
    if filter.len() > topic.len() {
        return false;
    }
    for (i, part) in filter.iter().enumerate() {
        if *part == "+" {
            continue;
        }
        if *part == "#" && i + 1 == filter.len() {
            break;
        }
        if *part != topic[i] {
            return false;
        }
    }
    true
}

/// True if the filter contains any wildcard.
pub fn is_wildcard(filter: &str) -> bool {
    filter.split('/').any(|part| part == "+") || filter.ends_with('#')
}

struct TableEntry {
    filter: String,
    handler: TopicHandler,
}

#[derive(Default)]
struct TableInner {
    exact: HashMap<String, Vec<SubId>>,
    wildcard: HashMap<String, Vec<SubId>>,
    entries: HashMap<SubId, TableEntry>,
    next_id: u64,
}

/// Subscription bookkeeping shared by bus implementations: an exact-match
/// table and a wildcard table, dispatched in that order.
#[derive(Default)]
pub struct SubscriptionTable {
    inner: Mutex<TableInner>,
}

impl SubscriptionTable {
    /// An empty table.
    pub fn new() -> Self {
        Self::default()
    }

    /// Registers a handler. The `bool` is true when this filter is new
    /// and the broker-side subscription must be established.
    pub fn insert(&self, filter: &str, handler: TopicHandler) -> (SubId, bool) {
        let mut inner = self.inner.lock().expect("lock poisoned");
        inner.next_id += 1;
        let id = SubId(inner.next_id);
        inner.entries.insert(id, TableEntry { filter: filter.to_string(), handler });
        let table = if is_wildcard(filter) { &mut inner.wildcard } else { &mut inner.exact };
        let ids = table.entry(filter.to_string()).or_default();
        ids.push(id);
        (id, ids.len() == 1)
    }

    /// Drops a subscription. The `String`/`bool` pair names the filter
    /// and whether the broker-side subscription can be released.
    pub fn remove(&self, id: SubId) -> Option<(String, bool)> {
        let mut inner = self.inner.lock().expect("lock poisoned");
        let entry = inner.entries.remove(&id)?;
        let table =
            if is_wildcard(&entry.filter) { &mut inner.wildcard } else { &mut inner.exact };
        let mut released = false;
        if let Some(ids) = table.get_mut(&entry.filter) {
            ids.retain(|sub| *sub != id);
            released = ids.is_empty();
        }
        if released {
            table.remove(&entry.filter);
        }
        Some((entry.filter, released))
    }

    /// Delivers a message to every matching subscription; returns how
    /// many handlers ran.
    pub fn dispatch(&self, topic: &str, payload: &[u8]) -> usize {
        let handlers: Vec<TopicHandler> = {
            let inner = self.inner.lock().expect("lock poisoned");
            let mut ids: Vec<SubId> = Vec::new();
            if let Some(exact) = inner.exact.get(topic) {
                ids.extend(exact);
            }
            for (filter, subs) in &inner.wildcard {
                if topic_matches(topic, filter) {
                    ids.extend(subs);
                }
            }
            ids.iter()
                .filter_map(|id| inner.entries.get(id))
                .map(|entry| entry.handler.clone())
                .collect()
        };
        for handler in &handlers {
            handler(topic, payload);
        }
        handlers.len()
    }

    /// Snapshot of every active filter, for resubscribe-on-reconnect.
    pub fn filters(&self) -> Vec<String> {
        let inner = self.inner.lock().expect("lock poisoned");
        inner.exact.keys().chain(inner.wildcard.keys()).cloned().collect()
    }
}

/// Packet reader backed by a bus subscription.
pub struct BusPacketReader {
    rx: mpsc::UnboundedReceiver<Bytes>,
    bus: Arc<dyn PubSub>,
    sub: SubId,
}

#[async_trait]
impl PacketRead for BusPacketReader {
    async fn read_packet(&mut self) -> io::Result<Bytes> {
        self.rx
            .recv()
            .await
            .ok_or_else(|| io::Error::new(io::ErrorKind::UnexpectedEof, "bus closed"))
    }
}

impl Drop for BusPacketReader {
    fn drop(&mut self) {
        if let Ok(handle) = tokio::runtime::Handle::try_current() {
            let bus = self.bus.clone();
            let sub = self.sub;
            handle.spawn(async move {
                let _ = bus.unsubscribe(sub).await;
            });
        }
    }
}

/// Packet writer publishing to a fixed topic.
pub struct BusPacketWriter {
    bus: Arc<dyn PubSub>,
    topic: String,
}

#[async_trait]
impl PacketWrite for BusPacketWriter {
    async fn write_packet(&mut self, packet: Bytes) -> io::Result<()> {
        self.bus.publish(&self.topic, packet, 0, false).await
    }
}

/// Binds a subscribe/publish topic pair as a packet transport.
pub async fn bus_transport(
    bus: Arc<dyn PubSub>,
    sub_topic: &str,
    pub_topic: &str,
) -> io::Result<(BusPacketReader, BusPacketWriter)> {
    let (tx, rx) = mpsc::unbounded_channel();
    let sub = bus
        .subscribe(
            sub_topic,
            Arc::new(move |_topic, payload| {
                let _ = tx.send(Bytes::copy_from_slice(payload));
            }),
        )
        .await?;
    Ok((
        BusPacketReader { rx, bus: bus.clone(), sub },
        BusPacketWriter { bus, topic: pub_topic.to_string() },
    ))
}

/// Default discovery window.
pub const DEFAULT_DISCOVER_TIMEOUT: Duration = Duration::from_millis(500);

/// Collects controllers advertising retained metadata, for one bounded
/// window.
pub async fn discover(bus: &Arc<dyn PubSub>, window: Duration) -> io::Result<Vec<ControllerInfo>> {
    let (tx, mut rx) = mpsc::unbounded_channel();
    let sub = bus
        .subscribe(
            "+/+/meta",
            Arc::new(move |topic, payload| {
                let parts: Vec<&str> = topic.split('/').collect();
                if parts.len() != 3 {
                    return;
                }
                let meta = serde_json::from_slice(payload).unwrap_or_else(|err| {
                    debug!(topic, error = %err, "unparsable controller meta");
                    ControllerMeta::default()
                });
                let _ = tx.send(ControllerInfo {
                    reference: ControllerRef::new(parts[0], parts[1]),
                    meta,
                });
            }),
        )
        .await?;
    tokio::time::sleep(window).await;
    let _ = bus.unsubscribe(sub).await;
    rx.close();
    let mut found = Vec::new();
    while let Ok(info) = rx.try_recv() {
        found.push(info);
    }
    Ok(found)
}

/// Operator-side entry point: discovery plus connection over a bus.
pub struct BusConnector {
    bus: Arc<dyn PubSub>,
    registry: Arc<Registry>,
    discover_timeout: Duration,
    command_expiration: Duration,
}

impl BusConnector {
    /// Creates a connector over a connected bus.
    pub fn new(bus: Arc<dyn PubSub>, registry: Arc<Registry>) -> Self {
        Self {
            bus,
            registry,
            discover_timeout: DEFAULT_DISCOVER_TIMEOUT,
            command_expiration: crate::conn::DEFAULT_COMMAND_EXPIRATION,
        }
    }

    /// Overrides the discovery window.
    pub fn with_discover_timeout(mut self, timeout: Duration) -> Self {
        self.discover_timeout = timeout;
        self
    }

    /// Overrides the command expiration for connections made here.
    pub fn with_command_expiration(mut self, expiration: Duration) -> Self {
        self.command_expiration = expiration;
        self
    }

    /// Enumerates registered controllers.
    pub async fn discover(&self) -> io::Result<Vec<ControllerInfo>> {
        discover(&self.bus, self.discover_timeout).await
    }

    /// Connects to a controller: subscribe its `msg` topic, publish on
    /// its `cmd` topic.
    pub async fn connect(&self, reference: &ControllerRef) -> io::Result<Conn> {
        let (reader, writer) =
            bus_transport(self.bus.clone(), &reference.msg_topic(), &reference.cmd_topic())
                .await?;
        Ok(Conn::with_expiration(
            Box::new(reader),
            Box::new(writer),
            self.registry.clone(),
            self.command_expiration,
        ))
    }
}

/// Controller-side binding: a [`Registrar`] over the bus plus the
/// retained-metadata lifecycle.
///
/// While running, the controller's metadata sits retained on
/// `<name>/meta`; on shutdown an empty retained publish tombstones it.
/// Brokers with last-will support should carry the same tombstone in the
/// will slot for unclean exits.
pub struct BusRegistrar {
    bus: Arc<dyn PubSub>,
    info: ControllerInfo,
    registrar: Registrar,
    lifecycle: Option<MetaLifecycle>,
}

impl BusRegistrar {
    /// Binds a controller to the bus: commands in on `<name>/cmd`,
    /// replies and events out on `<name>/msg`.
    pub async fn new(
        bus: Arc<dyn PubSub>,
        info: ControllerInfo,
        registry: Arc<Registry>,
    ) -> io::Result<Self> {
        let reference = &info.reference;
        let (reader, writer) =
            bus_transport(bus.clone(), &reference.cmd_topic(), &reference.msg_topic()).await?;
        let registrar = Registrar::new(Box::new(reader), Box::new(writer), registry);
        let lifecycle = MetaLifecycle {
            bus: bus.clone(),
            topic: reference.meta_topic(),
            meta_json: serde_json::to_vec(&info.meta)
                .map_err(|err| io::Error::new(io::ErrorKind::InvalidData, err))?,
        };
        Ok(Self { bus, info, registrar, lifecycle: Some(lifecycle) })
    }

    /// Who this registrar serves.
    pub fn info(&self) -> &ControllerInfo {
        &self.info
    }

    /// The bus this registrar publishes on.
    pub fn bus(&self) -> &Arc<dyn PubSub> {
        &self.bus
    }

    /// Sends an event to connected operators.
    pub fn send_event(
        &self,
        msg: &dyn drover_proto::messages::WireMessage,
    ) -> Result<(), RunError> {
        self.registrar.send_event(msg)
    }
}

impl LoopAdder for BusRegistrar {
    fn add_to_loop(&mut self, lp: &mut Loop) {
        self.registrar.add_to_loop(lp);
        if let Some(lifecycle) = self.lifecycle.take() {
            lp.add_runnable(lifecycle);
        }
    }
}

struct MetaLifecycle {
    bus: Arc<dyn PubSub>,
    topic: String,
    meta_json: Vec<u8>,
}

#[async_trait]
impl Runnable for MetaLifecycle {
    async fn run(self: Box<Self>, ctx: RunContext) -> Result<(), RunError> {
        self.bus
            .publish(&self.topic, Bytes::from(self.meta_json.clone()), 1, true)
            .await
            .map_err(RunError::Io)?;
        ctx.cancelled().await;
        // Tombstone: clear the retained slot so discoverers stop seeing us.
        let _ = self.bus.publish(&self.topic, Bytes::new(), 1, true).await;
        Err(RunError::Cancelled)
    }

    fn name(&self) -> &str {
        "controller-meta"
    }
}
