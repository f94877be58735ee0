//! In-memory mailbox

use super::{MemoryUser, Shared};
use crate::flags;
use crate::models::{
    CopyUids, FlagChange, FlagsOp, MailboxInfo, MailboxStatus, Message, MessageEntry, StatusItem,
    DELIMITER,
};
use crate::repository::Mailbox;
use crate::search::{self, SearchContext};
use crate::updates::{Update, UpdateKind};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use cormorant_common::types::flags::{DELETED, NONJUNK, RECENT, SEEN, SYSTEM};
use cormorant_common::types::{SearchCriteria, SequenceSet};
use cormorant_common::{Error, Result};
use std::sync::{Arc, Weak};
use tokio::sync::RwLock;
use tracing::debug;

/// Lock-guarded part of a mailbox
#[derive(Debug)]
pub(super) struct MailboxState {
    pub(super) attributes: Vec<String>,
    pub(super) subscribed: bool,
    pub(super) messages: Vec<Message>,
    pub(super) uid_validity: u32,
    /// Next UID to assign; only ever grows
    pub(super) uid_next: u32,
    /// Set once the mailbox is renamed away or deleted. Handles obtained
    /// before that must not accept writes.
    pub(super) retired: bool,
}

impl MailboxState {
    pub(super) fn new(uid_validity: u32) -> Self {
        Self {
            attributes: Vec::new(),
            subscribed: false,
            messages: Vec::new(),
            uid_validity,
            uid_next: 1,
            retired: false,
        }
    }

    fn ensure_live(&self, name: &str) -> Result<()> {
        if self.retired {
            return Err(Error::NotFound(format!("No such mailbox: {}", name)));
        }
        Ok(())
    }

    /// Append a message under the next UID
    pub(super) fn push(&mut self, flags: Vec<String>, date: DateTime<Utc>, body: Vec<u8>) -> u32 {
        let uid = self.uid_next;
        self.uid_next = uid.saturating_add(1);
        self.messages.push(Message {
            uid,
            date,
            size: body.len() as u32,
            flags,
            body,
        });
        uid
    }

    fn max_uid(&self) -> u32 {
        self.messages.last().map(|m| m.uid).unwrap_or(0)
    }

    /// Indexes of the messages addressed by `set`
    fn select(&self, uid: bool, set: &SequenceSet) -> Vec<usize> {
        let max_seq = self.messages.len() as u32;
        let max_uid = self.max_uid();
        self.messages
            .iter()
            .enumerate()
            .filter(|(i, msg)| {
                if uid {
                    set.contains(msg.uid, max_uid)
                } else {
                    set.contains(*i as u32 + 1, max_seq)
                }
            })
            .map(|(i, _)| i)
            .collect()
    }

    fn ensure_uid_space(&self, needed: usize) -> Result<()> {
        if (self.uid_next as u64) + (needed as u64) > u32::MAX as u64 {
            return Err(Error::Internal("UID space exhausted".to_string()));
        }
        Ok(())
    }
}

/// A mailbox of one user
pub struct MemoryMailbox {
    /// Backend-unique, fixes the lock order between mailboxes
    id: u64,
    name: String,
    username: String,
    user: Weak<MemoryUser>,
    shared: Arc<Shared>,
    pub(super) state: RwLock<MailboxState>,
}

impl MemoryMailbox {
    pub(super) fn new(
        shared: &Arc<Shared>,
        user: Weak<MemoryUser>,
        username: &str,
        name: &str,
        state: MailboxState,
    ) -> Self {
        Self {
            id: shared.mailbox_id(),
            name: name.to_string(),
            username: username.to_string(),
            user,
            shared: shared.clone(),
            state: RwLock::new(state),
        }
    }

    pub(super) async fn is_subscribed(&self) -> bool {
        self.state.read().await.subscribed
    }

    /// Publish a change to this mailbox. Called with the state lock held so
    /// updates leave in the order the changes were made.
    pub(super) fn publish(&self, kind: UpdateKind) {
        self.shared.updates.publish(Update {
            username: self.username.clone(),
            mailbox: self.name.clone(),
            kind,
        });
    }

    async fn destination(&self, name: &str) -> Result<Arc<MemoryMailbox>> {
        let user = self
            .user
            .upgrade()
            .ok_or_else(|| Error::Internal("Mailbox owner is gone".to_string()))?;
        user.lookup(name)
            .await
            .ok_or_else(|| Error::NotFound(format!("No such mailbox: {}", name)))
    }

    /// Append copies of `snapshot` to this mailbox, whose state is `state`
    fn append_copies(&self, state: &mut MailboxState, snapshot: Vec<Message>) -> Result<CopyUids> {
        state.ensure_uid_space(snapshot.len())?;

        let mut uids = CopyUids {
            uid_validity: state.uid_validity,
            ..Default::default()
        };
        for msg in snapshot {
            uids.source.push(msg.uid);
            uids.dest.push(state.push(msg.flags, msg.date, msg.body));
        }

        if !uids.dest.is_empty() {
            self.publish(UpdateKind::MailboxStatus {
                messages: state.messages.len() as u32,
                uid_next: state.uid_next,
            });
        }
        Ok(uids)
    }

    /// Remove messages matching `pred`, highest index first
    fn expunge_where<F>(&self, state: &mut MailboxState, pred: F) -> Vec<u32>
    where
        F: Fn(&Message) -> bool,
    {
        let mut removed = Vec::new();
        for i in (0..state.messages.len()).rev() {
            if pred(&state.messages[i]) {
                state.messages.remove(i);
                let seq = i as u32 + 1;
                removed.push(seq);
                self.publish(UpdateKind::Expunge { seq });
            }
        }
        removed
    }

    /// Mark the moved originals deleted, then run a full expunge pass
    fn remove_moved(&self, state: &mut MailboxState, moved: &[u32]) {
        let deleted = [DELETED.to_string()];
        for msg in state.messages.iter_mut().filter(|m| moved.contains(&m.uid)) {
            msg.flags = flags::merge(std::mem::take(&mut msg.flags), FlagsOp::Add, &deleted);
        }
        self.expunge_where(state, |m| m.has_flag(DELETED));
    }

    async fn transfer(
        &self,
        uid: bool,
        set: &SequenceSet,
        dest_name: &str,
        remove: bool,
    ) -> Result<CopyUids> {
        let dest = self.destination(dest_name).await?;
        self.transfer_to(&dest, uid, set, remove).await
    }

    /// The registry lock is already released here, so `dest` may have been
    /// renamed or deleted since it was looked up.
    async fn transfer_to(
        &self,
        dest: &MemoryMailbox,
        uid: bool,
        set: &SequenceSet,
        remove: bool,
    ) -> Result<CopyUids> {
        if dest.id == self.id {
            let mut state = self.state.write().await;
            state.ensure_live(&self.name)?;
            let snapshot = selected_messages(&state, uid, set);
            let uids = self.append_copies(&mut state, snapshot)?;
            if remove {
                self.remove_moved(&mut state, &uids.source);
            }
            return Ok(uids);
        }

        let (mut source, mut target) = if self.id < dest.id {
            let source = self.state.write().await;
            let target = dest.state.write().await;
            (source, target)
        } else {
            let target = dest.state.write().await;
            let source = self.state.write().await;
            (source, target)
        };

        target.ensure_live(&dest.name)?;
        source.ensure_live(&self.name)?;

        // Both locks are held, so the snapshot cannot change under us.
        let snapshot = selected_messages(&source, uid, set);
        let uids = dest.append_copies(&mut target, snapshot)?;
        if remove {
            self.remove_moved(&mut source, &uids.source);
        }
        debug!(
            from = %self.name,
            to = %dest.name,
            count = uids.dest.len(),
            moved = remove,
            "Messages transferred"
        );
        Ok(uids)
    }
}

/// Flags announced in `FLAGS`; `PERMANENTFLAGS` adds `\*`
fn advertised_flags() -> impl Iterator<Item = String> {
    SYSTEM
        .into_iter()
        .chain(std::iter::once(NONJUNK))
        .map(str::to_string)
}

fn selected_messages(state: &MailboxState, uid: bool, set: &SequenceSet) -> Vec<Message> {
    state
        .select(uid, set)
        .into_iter()
        .map(|i| state.messages[i].clone())
        .collect()
}

#[async_trait]
impl Mailbox for MemoryMailbox {
    fn name(&self) -> &str {
        &self.name
    }

    async fn info(&self) -> Result<MailboxInfo> {
        let state = self.state.read().await;
        Ok(MailboxInfo {
            attributes: state.attributes.clone(),
            delimiter: DELIMITER.to_string(),
            name: self.name.clone(),
        })
    }

    async fn status(&self, items: &[StatusItem]) -> Result<MailboxStatus> {
        let state = self.state.read().await;

        let mut status = MailboxStatus {
            name: self.name.clone(),
            flags: advertised_flags().collect(),
            permanent_flags: advertised_flags()
                .chain(std::iter::once("\\*".to_string()))
                .collect(),
            first_unseen: state
                .messages
                .iter()
                .position(|m| !m.has_flag(SEEN))
                .map(|i| i as u32 + 1)
                .unwrap_or(0),
            ..Default::default()
        };

        for item in items {
            match item {
                StatusItem::Messages => status.messages = Some(state.messages.len() as u32),
                StatusItem::Recent => {
                    status.recent =
                        Some(state.messages.iter().filter(|m| m.has_flag(RECENT)).count() as u32)
                }
                StatusItem::UidNext => status.uid_next = Some(state.uid_next),
                StatusItem::UidValidity => status.uid_validity = Some(state.uid_validity),
                StatusItem::Unseen => {
                    status.unseen =
                        Some(state.messages.iter().filter(|m| !m.has_flag(SEEN)).count() as u32)
                }
            }
        }

        Ok(status)
    }

    async fn set_subscribed(&self, subscribed: bool) -> Result<()> {
        self.state.write().await.subscribed = subscribed;
        Ok(())
    }

    async fn check(&self) -> Result<()> {
        Ok(())
    }

    async fn list_messages(&self, uid: bool, set: &SequenceSet) -> Result<Vec<MessageEntry>> {
        let state = self.state.read().await;
        Ok(state
            .select(uid, set)
            .into_iter()
            .map(|i| MessageEntry {
                seq: i as u32 + 1,
                message: state.messages[i].clone(),
            })
            .collect())
    }

    async fn search_messages(&self, uid: bool, criteria: &SearchCriteria) -> Result<Vec<u32>> {
        let state = self.state.read().await;
        let max_seq = state.messages.len() as u32;
        let max_uid = state.max_uid();

        Ok(state
            .messages
            .iter()
            .enumerate()
            .filter_map(|(i, msg)| {
                let seq = i as u32 + 1;
                let ctx = SearchContext {
                    seq,
                    max_seq,
                    max_uid,
                };
                search::matches(msg, ctx, criteria).then_some(if uid { msg.uid } else { seq })
            })
            .collect())
    }

    async fn create_message(
        &self,
        flags: Vec<String>,
        date: Option<DateTime<Utc>>,
        body: Vec<u8>,
    ) -> Result<u32> {
        let mut state = self.state.write().await;
        state.ensure_live(&self.name)?;
        state.ensure_uid_space(1)?;

        let flags = flags::merge(Vec::new(), FlagsOp::Set, &flags);
        let uid = state.push(flags, date.unwrap_or_else(Utc::now), body);

        self.publish(UpdateKind::MailboxStatus {
            messages: state.messages.len() as u32,
            uid_next: state.uid_next,
        });
        Ok(uid)
    }

    async fn update_messages_flags(
        &self,
        uid: bool,
        set: &SequenceSet,
        op: FlagsOp,
        flags: &[String],
    ) -> Result<Vec<FlagChange>> {
        let mut state = self.state.write().await;
        state.ensure_live(&self.name)?;
        let mut changes = Vec::new();

        for i in state.select(uid, set) {
            let msg = &mut state.messages[i];
            msg.flags = flags::merge(std::mem::take(&mut msg.flags), op, flags);

            let change = FlagChange {
                seq: i as u32 + 1,
                uid: msg.uid,
                flags: msg.flags.clone(),
            };
            self.publish(UpdateKind::MessageFlags {
                seq: change.seq,
                uid: change.uid,
                flags: change.flags.clone(),
            });
            changes.push(change);
        }

        Ok(changes)
    }

    async fn copy_messages(&self, uid: bool, set: &SequenceSet, dest: &str) -> Result<CopyUids> {
        self.transfer(uid, set, dest, false).await
    }

    async fn move_messages(&self, uid: bool, set: &SequenceSet, dest: &str) -> Result<CopyUids> {
        self.transfer(uid, set, dest, true).await
    }

    async fn expunge(&self) -> Result<Vec<u32>> {
        let mut state = self.state.write().await;
        state.ensure_live(&self.name)?;
        Ok(self.expunge_where(&mut state, |m| m.has_flag(DELETED)))
    }
}
