//! Store contract driven by the IMAP protocol layer
//!
//! A [`Backend`] authenticates users and owns the [`UpdateBus`]. A [`User`]
//! owns its mailboxes, and a [`Mailbox`] owns its messages. Handles are
//! shared as `Arc<dyn ...>` and hold no borrowed state.

use crate::models::{
    CopyUids, FlagChange, FlagsOp, MailboxInfo, MailboxStatus, MessageEntry, StatusItem,
};
use crate::updates::UpdateBus;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use cormorant_common::types::{SearchCriteria, SequenceSet};
use cormorant_common::Result;
use std::sync::Arc;

/// Backend trait
#[async_trait]
pub trait Backend: Send + Sync {
    /// Authenticate and return the user. Unknown users and wrong passwords
    /// fail with the same [`cormorant_common::Error::InvalidCredentials`].
    async fn login(&self, username: &str, password: &str) -> Result<Arc<dyn User>>;

    /// Bus receiving every change made through this backend
    fn updates(&self) -> &UpdateBus;
}

/// User trait
#[async_trait]
pub trait User: Send + Sync {
    fn username(&self) -> &str;

    /// All mailboxes, or only subscribed ones. Order is unspecified.
    async fn list_mailboxes(&self, subscribed: bool) -> Result<Vec<Arc<dyn Mailbox>>>;

    async fn get_mailbox(&self, name: &str) -> Result<Arc<dyn Mailbox>>;

    async fn create_mailbox(&self, name: &str) -> Result<()>;

    /// Fails for INBOX and for unknown names
    async fn delete_mailbox(&self, name: &str) -> Result<()>;

    /// Move the messages of `existing` under `new_name`. Renaming INBOX
    /// leaves an empty INBOX behind.
    async fn rename_mailbox(&self, existing: &str, new_name: &str) -> Result<()>;

    async fn logout(&self) -> Result<()>;
}

/// Mailbox trait
///
/// `uid` selects whether a [`SequenceSet`] addresses messages by UID or by
/// sequence number.
#[async_trait]
pub trait Mailbox: Send + Sync {
    fn name(&self) -> &str;

    async fn info(&self) -> Result<MailboxInfo>;

    async fn status(&self, items: &[StatusItem]) -> Result<MailboxStatus>;

    async fn set_subscribed(&self, subscribed: bool) -> Result<()>;

    async fn check(&self) -> Result<()>;

    async fn list_messages(&self, uid: bool, set: &SequenceSet) -> Result<Vec<MessageEntry>>;

    /// Matching sequence numbers, or UIDs when `uid` is set
    async fn search_messages(&self, uid: bool, criteria: &SearchCriteria) -> Result<Vec<u32>>;

    /// Append a message and return its UID. `date` defaults to now.
    async fn create_message(
        &self,
        flags: Vec<String>,
        date: Option<DateTime<Utc>>,
        body: Vec<u8>,
    ) -> Result<u32>;

    async fn update_messages_flags(
        &self,
        uid: bool,
        set: &SequenceSet,
        op: FlagsOp,
        flags: &[String],
    ) -> Result<Vec<FlagChange>>;

    async fn copy_messages(&self, uid: bool, set: &SequenceSet, dest: &str) -> Result<CopyUids>;

    async fn move_messages(&self, uid: bool, set: &SequenceSet, dest: &str) -> Result<CopyUids>;

    /// Remove every message flagged `\Deleted`. Returns the removed sequence
    /// numbers in the order they were removed (highest first).
    async fn expunge(&self) -> Result<Vec<u32>>;
}
