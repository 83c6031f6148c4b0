//! Lifecycle notifications for indexers, relay and RPC
//!
//! Every listener gets its own unbounded channel, so events arrive in
//! emission order and a slow listener never blocks block processing.

use crate::types::{display_hash, Block, Hash, PubKeyHash, Transaction};
use std::sync::Mutex;
use tokio::sync::mpsc::{unbounded_channel, UnboundedReceiver, UnboundedSender};

/// Key of a per-key transaction event.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum EventKey {
    TxHash(Hash),
    PubKeyHash(PubKeyHash),
}

impl std::fmt::Display for EventKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            EventKey::TxHash(hash) => write!(f, "{}", display_hash(hash)),
            EventKey::PubKeyHash(hash) => write!(f, "{}", hex::encode(hash)),
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub enum ChainEvent {
    /// A block passed verification and is about to be persisted.
    BlockAdd(Block),
    /// A block was persisted.
    BlockSave(Block),
    TxAdd {
        txid: Hash,
        tx: Transaction,
        block: Hash,
    },
    TxAddKeyed {
        key: EventKey,
        txid: Hash,
        block: Hash,
    },
    TxSave {
        txid: Hash,
        block: Hash,
    },
    /// A transaction left the active chain during a reorganization.
    TxRevoke {
        txid: Hash,
        tx: Transaction,
        block: Hash,
    },
    TxRevokeKeyed {
        key: EventKey,
        txid: Hash,
        block: Hash,
    },
    /// The ingestion queue drained.
    QueueDone,
    /// Genesis is in place; carries the loaded top block.
    InitComplete(Block),
}

impl ChainEvent {
    pub fn name(&self) -> String {
        match self {
            ChainEvent::BlockAdd(_) => "blockAdd".into(),
            ChainEvent::BlockSave(_) => "blockSave".into(),
            ChainEvent::TxAdd { .. } => "txAdd".into(),
            ChainEvent::TxAddKeyed { key, .. } => format!("txAdd:{}", key),
            ChainEvent::TxSave { .. } => "txSave".into(),
            ChainEvent::TxRevoke { .. } => "txRevoke".into(),
            ChainEvent::TxRevokeKeyed { key, .. } => format!("txRevoke:{}", key),
            ChainEvent::QueueDone => "queueDone".into(),
            ChainEvent::InitComplete(_) => "initComplete".into(),
        }
    }
}

/// Listener registry.
#[derive(Default)]
pub struct EventBus {
    listeners: Mutex<Vec<UnboundedSender<ChainEvent>>>,
}

impl EventBus {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a listener. Dropping the receiver unregisters it.
    pub fn subscribe(&self) -> UnboundedReceiver<ChainEvent> {
        let (tx, rx) = unbounded_channel();
        if let Ok(mut listeners) = self.listeners.lock() {
            listeners.push(tx);
        }
        rx
    }

    pub fn emit(&self, event: ChainEvent) {
        tracing::trace!(event = %event.name(), "Emit");
        if let Ok(mut listeners) = self.listeners.lock() {
            listeners.retain(|listener| listener.send(event.clone()).is_ok());
        }
    }

    pub fn listener_count(&self) -> usize {
        self.listeners.lock().map(|l| l.len()).unwrap_or(0)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_events_arrive_in_order() {
        let bus = EventBus::new();
        let mut rx = bus.subscribe();

        bus.emit(ChainEvent::TxSave { txid: [1; 32], block: [2; 32] });
        bus.emit(ChainEvent::QueueDone);

        assert!(matches!(rx.try_recv().unwrap(), ChainEvent::TxSave { .. }));
        assert_eq!(rx.try_recv().unwrap(), ChainEvent::QueueDone);
        assert!(rx.try_recv().is_err());
    }

    #[test]
    fn test_dropped_listener_is_pruned() {
        let bus = EventBus::new();
        let rx = bus.subscribe();
        let _kept = bus.subscribe();
        assert_eq!(bus.listener_count(), 2);

        drop(rx);
        bus.emit(ChainEvent::QueueDone);
        assert_eq!(bus.listener_count(), 1);
    }

    #[test]
    fn test_keyed_event_names() {
        let event = ChainEvent::TxAddKeyed {
            key: EventKey::PubKeyHash([0xab; 20]),
            txid: [0; 32],
            block: [0; 32],
        };
        assert_eq!(event.name(), format!("txAdd:{}", "ab".repeat(20)));
        assert_eq!(ChainEvent::QueueDone.name(), "queueDone");
    }
}
