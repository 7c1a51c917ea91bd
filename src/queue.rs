//! FIFO command queue: many producers, one consumer (the supervisor).

use crate::command::{Command, CommandId};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use thiserror::Error;
use tokio::sync::mpsc;

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum QueueError {
    #[error("Command queue is full ({0} pending)")]
    Full(usize),
    #[error("Command queue is closed")]
    Closed,
}

#[derive(Debug, Default)]
struct QueueShared {
    depth: AtomicUsize,
    current: Mutex<Option<Command>>,
}

/// Producer side; cheap to clone.
#[derive(Debug, Clone)]
pub struct QueueSender {
    tx: mpsc::UnboundedSender<Command>,
    capacity: Option<usize>,
    shared: Arc<QueueShared>,
}

/// Consumer side, owned by the supervisor task.
#[derive(Debug)]
pub struct QueueReceiver {
    rx: mpsc::UnboundedReceiver<Command>,
    shared: Arc<QueueShared>,
}

pub fn command_queue(capacity: Option<usize>) -> (QueueSender, QueueReceiver) {
    let (tx, rx) = mpsc::unbounded_channel();
    let shared = Arc::new(QueueShared::default());
    (QueueSender { tx, capacity, shared: shared.clone() }, QueueReceiver { rx, shared })
}

impl QueueSender {
    pub fn enqueue(&self, command: Command) -> Result<CommandId, QueueError> {
        let id = command.id;
        let depth = self.shared.depth.fetch_add(1, Ordering::SeqCst);
        if let Some(capacity) = self.capacity {
            if depth >= capacity {
                self.shared.depth.fetch_sub(1, Ordering::SeqCst);
                return Err(QueueError::Full(depth));
            }
        }
        if self.tx.send(command).is_err() {
            self.shared.depth.fetch_sub(1, Ordering::SeqCst);
            return Err(QueueError::Closed);
        }
        Ok(id)
    }

    /// Commands waiting behind the one in flight.
    pub fn len(&self) -> usize {
        self.shared.depth.load(Ordering::SeqCst)
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn peek_current(&self) -> Option<Command> {
        self.shared.current.lock().unwrap_or_else(|poisoned| poisoned.into_inner()).clone()
    }
}

impl QueueReceiver {
    /// Wait for the next command. `None` once every sender is gone.
    pub async fn dequeue_next(&mut self) -> Option<Command> {
        let command = self.rx.recv().await?;
        self.shared.depth.fetch_sub(1, Ordering::SeqCst);
        Some(command)
    }

    /// Take the next command without waiting.
    pub fn try_dequeue(&mut self) -> Option<Command> {
        let command = self.rx.try_recv().ok()?;
        self.shared.depth.fetch_sub(1, Ordering::SeqCst);
        Some(command)
    }

    /// Publish the in-flight command to producers; `None` once it is finalized.
    pub fn set_current(&self, command: Option<Command>) {
        *self.shared.current.lock().unwrap_or_else(|poisoned| poisoned.into_inner()) = command;
    }
}
