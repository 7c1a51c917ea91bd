//! Bounded in-memory ledger of command acknowledgments.

use crate::command::{CommandAck, CommandId};
use std::collections::{BTreeMap, HashMap};
use tokio::sync::RwLock;

#[derive(Debug, Default)]
struct Entries {
    next_seq: u64,
    /// Insertion order; the highest sequence is the most recent.
    order: BTreeMap<u64, CommandId>,
    acks: HashMap<CommandId, (u64, CommandAck)>,
}

/// One entry per command id. Recording a newer ack for an id replaces the
/// previous one and moves it to the front; the oldest entries are evicted
/// once `capacity` is reached.
#[derive(Debug)]
pub struct CommandLedger {
    capacity: usize,
    entries: RwLock<Entries>,
}

impl CommandLedger {
    pub fn new(capacity: usize) -> Self {
        Self { capacity: capacity.max(1), entries: RwLock::new(Entries::default()) }
    }

    pub async fn record(&self, ack: CommandAck) {
        let mut entries = self.entries.write().await;
        let seq = entries.next_seq;
        entries.next_seq += 1;
        if let Some((old_seq, _)) = entries.acks.remove(&ack.id) {
            entries.order.remove(&old_seq);
        }
        entries.order.insert(seq, ack.id);
        entries.acks.insert(ack.id, (seq, ack));
        while entries.acks.len() > self.capacity {
            let Some((_, evicted)) = entries.order.pop_first() else { break };
            entries.acks.remove(&evicted);
            tracing::trace!(command_id = %evicted, "Evicted from history");
        }
    }

    /// Drop an entry, used when a command is refused after its Pending ack
    /// was recorded.
    pub async fn remove(&self, id: &CommandId) -> Option<CommandAck> {
        let mut entries = self.entries.write().await;
        let (seq, ack) = entries.acks.remove(id)?;
        entries.order.remove(&seq);
        Some(ack)
    }

    pub async fn get(&self, id: &CommandId) -> Option<CommandAck> {
        self.entries.read().await.acks.get(id).map(|(_, ack)| ack.clone())
    }

    /// Up to `limit` acks, most recent first.
    pub async fn recent(&self, limit: usize) -> Vec<CommandAck> {
        let entries = self.entries.read().await;
        entries
            .order
            .values()
            .rev()
            .take(limit)
            .filter_map(|id| entries.acks.get(id).map(|(_, ack)| ack.clone()))
            .collect()
    }

    pub async fn len(&self) -> usize {
        self.entries.read().await.acks.len()
    }
}
