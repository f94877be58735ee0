//! In-memory reference store
//!
//! Every entity guards its own state with a `tokio::sync::RwLock`. Locks are
//! acquired in a fixed order: the backend's user map, then a user's mailbox
//! map, then mailbox states. When two mailboxes must be held at once they
//! are locked in ascending `id` order.

mod backend;
mod mailbox;
mod user;

pub use backend::MemoryBackend;
pub use mailbox::MemoryMailbox;
pub use user::MemoryUser;

use crate::models::INBOX;
use crate::updates::UpdateBus;
use std::sync::atomic::{AtomicU32, AtomicU64, Ordering};

/// State shared by every entity of one backend
#[derive(Debug)]
struct Shared {
    updates: UpdateBus,
    next_mailbox_id: AtomicU64,
    next_uid_validity: AtomicU32,
}

impl Shared {
    fn new(update_buffer: usize) -> Self {
        let seed = chrono::Utc::now().timestamp().clamp(1, u32::MAX as i64) as u32;
        Self {
            updates: UpdateBus::new(update_buffer),
            next_mailbox_id: AtomicU64::new(1),
            next_uid_validity: AtomicU32::new(seed),
        }
    }

    fn mailbox_id(&self) -> u64 {
        self.next_mailbox_id.fetch_add(1, Ordering::Relaxed)
    }

    /// Next UIDVALIDITY. Zero is not a valid value, so the counter wraps
    /// to 1.
    fn uid_validity(&self) -> u32 {
        let previous = self
            .next_uid_validity
            .fetch_update(Ordering::Relaxed, Ordering::Relaxed, |v| {
                Some(next_validity(v))
            });
        match previous {
            Ok(v) | Err(v) => v.max(1),
        }
    }
}

fn next_validity(current: u32) -> u32 {
    current.checked_add(1).unwrap_or(1)
}

/// INBOX is matched case-insensitively; every other name is case-sensitive.
fn canonical_name(name: &str) -> String {
    if name.eq_ignore_ascii_case(INBOX) {
        INBOX.to_string()
    } else {
        name.to_string()
    }
}
