//! Update bus carrying mailbox changes from the store to live sessions
//!
//! The bus is a bounded broadcast channel. Publishing never waits: when a
//! subscriber falls behind by more than the capacity, its oldest pending
//! updates are dropped and it is told how many it missed.

use tokio::sync::broadcast;
use tracing::debug;

/// A change to one mailbox of one user
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Update {
    pub username: String,
    pub mailbox: String,
    pub kind: UpdateKind,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum UpdateKind {
    /// The mailbox now holds `messages` messages
    MailboxStatus { messages: u32, uid_next: u32 },
    /// A message's flags changed
    MessageFlags { seq: u32, uid: u32, flags: Vec<String> },
    /// The message at `seq` was removed
    Expunge { seq: u32 },
}

/// What a subscriber receives
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Delivery {
    Update(Update),
    /// The subscriber fell behind and this many updates were dropped
    Lagged(u64),
}

/// Bounded, drop-oldest broadcast of [`Update`]s
#[derive(Debug, Clone)]
pub struct UpdateBus {
    sender: broadcast::Sender<Update>,
}

impl UpdateBus {
    /// Create a bus buffering at most `capacity` updates per subscriber
    pub fn new(capacity: usize) -> Self {
        let (sender, _) = broadcast::channel(capacity.max(1));
        Self { sender }
    }

    /// Publish an update. Returns the number of subscribers it reached;
    /// with none the update is discarded.
    pub fn publish(&self, update: Update) -> usize {
        match self.sender.send(update) {
            Ok(receivers) => receivers,
            Err(broadcast::error::SendError(update)) => {
                debug!(mailbox = %update.mailbox, "No update subscribers, discarding");
                0
            }
        }
    }

    pub fn subscribe(&self) -> UpdateReceiver {
        UpdateReceiver {
            receiver: self.sender.subscribe(),
        }
    }
}

/// One subscriber's view of the bus
#[derive(Debug)]
pub struct UpdateReceiver {
    receiver: broadcast::Receiver<Update>,
}

impl UpdateReceiver {
    /// Wait for the next delivery. Returns `None` once the bus is gone.
    pub async fn recv(&mut self) -> Option<Delivery> {
        match self.receiver.recv().await {
            Ok(update) => Some(Delivery::Update(update)),
            Err(broadcast::error::RecvError::Lagged(n)) => Some(Delivery::Lagged(n)),
            Err(broadcast::error::RecvError::Closed) => None,
        }
    }

    /// Take the next delivery if one is already queued
    pub fn try_recv(&mut self) -> Option<Delivery> {
        match self.receiver.try_recv() {
            Ok(update) => Some(Delivery::Update(update)),
            Err(broadcast::error::TryRecvError::Lagged(n)) => Some(Delivery::Lagged(n)),
            Err(_) => None,
        }
    }
}
