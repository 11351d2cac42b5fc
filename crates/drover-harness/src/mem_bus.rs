//! In-memory pub/sub broker.
//!
//! Implements the core bus contract with production semantics scaled
//! down to one process: retained messages replay to new subscribers, an
//! empty retained publish clears the slot, and routing goes through the
//! core's subscription table (exact plus wildcard). Delivery is
//! synchronous inside `publish`, which keeps scenarios deterministic.

use std::{
    collections::HashMap,
    io,
    sync::{Arc, Mutex},
};

use async_trait::async_trait;
use bytes::Bytes;

use drover_core::pubsub::{PubSub, SubId, SubscriptionTable, TopicHandler, topic_matches};

struct BusCore {
    table: SubscriptionTable,
    retained: Mutex<HashMap<String, Bytes>>,
    closed: Mutex<bool>,
}

/// The in-memory broker. Cloning shares the broker, as cloning a real
/// broker client shares the connection.
#[derive(Clone)]
pub struct MemBus {
    core: Arc<BusCore>,
}

impl MemBus {
    /// A fresh broker with no subscriptions and nothing retained.
    pub fn new() -> Self {
        Self {
            core: Arc::new(BusCore {
                table: SubscriptionTable::new(),
                retained: Mutex::new(HashMap::new()),
                closed: Mutex::new(false),
            }),
        }
    }

    /// The retained payload on a topic, if any.
    pub fn retained(&self, topic: &str) -> Option<Bytes> {
        self.core.retained.lock().expect("lock poisoned").get(topic).cloned()
    }

    fn ensure_open(&self) -> io::Result<()> {
        if *self.core.closed.lock().expect("lock poisoned") {
            Err(io::Error::new(io::ErrorKind::NotConnected, "bus closed"))
        } else {
            Ok(())
        }
    }
}

impl Default for MemBus {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl PubSub for MemBus {
    async fn publish(
        &self,
        topic: &str,
        payload: Bytes,
        _qos: u8,
        retain: bool,
    ) -> io::Result<()> {
        self.ensure_open()?;
        if retain {
            let mut retained = self.core.retained.lock().expect("lock poisoned");
            if payload.is_empty() {
                retained.remove(topic);
            } else {
                retained.insert(topic.to_string(), payload.clone());
            }
        }
        self.core.table.dispatch(topic, &payload);
        Ok(())
    }

    async fn subscribe(&self, filter: &str, handler: TopicHandler) -> io::Result<SubId> {
        self.ensure_open()?;
        let replay: Vec<(String, Bytes)> = {
            let retained = self.core.retained.lock().expect("lock poisoned");
            retained
                .iter()
                .filter(|(topic, _)| topic_matches(topic, filter))
                .map(|(topic, payload)| (topic.clone(), payload.clone()))
                .collect()
        };
        let (id, _) = self.core.table.insert(filter, handler.clone());
        for (topic, payload) in replay {
            handler(&topic, &payload);
        }
        Ok(id)
    }

    async fn unsubscribe(&self, id: SubId) -> io::Result<()> {
        self.core.table.remove(id);
        Ok(())
    }

    async fn close(&self) -> io::Result<()> {
        *self.core.closed.lock().expect("lock poisoned") = true;
        Ok(())
    }
}
