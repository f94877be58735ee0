//! IMAP Session management
//!
//! Manages the state of an IMAP connection including authentication
//! and selected mailbox state.

use super::response::ImapResponse;
use chrono::{DateTime, Utc};
use cormorant_common::types::{compact_numbers, SequenceSet};
use cormorant_storage::{Mailbox, MessageEntry, User};
use std::sync::Arc;
use uuid::Uuid;

/// IMAP session state
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionState {
    /// Not authenticated
    NotAuthenticated,
    /// Authenticated but no mailbox selected
    Authenticated,
    /// Mailbox selected (read-write or read-only)
    Selected,
    /// Session is closing
    Logout,
}

/// A message as the client last saw it
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct KnownMessage {
    pub uid: u32,
    pub flags: Vec<String>,
}

impl From<&MessageEntry> for KnownMessage {
    fn from(entry: &MessageEntry) -> Self {
        Self {
            uid: entry.message.uid,
            flags: entry.message.flags.clone(),
        }
    }
}

/// Selected mailbox information
///
/// `known` is the client's view of the mailbox, in UID order. Sequence
/// numbers sent to and received from the client are positions in this
/// list, not in the store, so they stay valid until the session itself
/// reports EXPUNGE.
#[derive(Clone)]
pub struct SelectedMailbox {
    pub mailbox: Arc<dyn Mailbox>,
    /// Opened with EXAMINE
    pub read_only: bool,
    pub known: Vec<KnownMessage>,
}

impl SelectedMailbox {
    pub fn name(&self) -> &str {
        self.mailbox.name()
    }

    /// Message count last reported to the client
    pub fn exists(&self) -> u32 {
        self.known.len() as u32
    }

    /// Sequence number of `uid` in the client's view
    pub fn seq_of(&self, uid: u32) -> Option<u32> {
        self.known
            .binary_search_by_key(&uid, |m| m.uid)
            .ok()
            .map(|i| i as u32 + 1)
    }

    /// Translate a client set into a UID set for the store. `None` when a
    /// sequence set addresses no known message.
    pub fn uid_set(&self, uid: bool, set: &SequenceSet) -> Option<SequenceSet> {
        if uid {
            return Some(set.clone());
        }
        let max = self.exists();
        let uids: Vec<u32> = self
            .known
            .iter()
            .enumerate()
            .filter(|(i, _)| set.contains(*i as u32 + 1, max))
            .map(|(_, m)| m.uid)
            .collect();
        SequenceSet::parse(&compact_numbers(&uids))
    }

    /// Record flags the client is being told about by the current command.
    /// Returns the message's sequence number if the client knows it.
    pub fn record_flags(&mut self, uid: u32, flags: &[String]) -> Option<u32> {
        let i = self.known.binary_search_by_key(&uid, |m| m.uid).ok()?;
        self.known[i].flags = flags.to_vec();
        Some(i as u32 + 1)
    }

    /// Bring the view up to date with `current`, the full message list of
    /// the mailbox, and return the untagged responses that tell the client.
    ///
    /// Removed messages are expunged highest first so lower sequence
    /// numbers stay valid while the responses are read. EXISTS is only sent
    /// when the count grows, after all EXPUNGEs.
    pub fn reconcile(&mut self, current: &[MessageEntry], with_uid: bool) -> Vec<String> {
        let mut lines = Vec::new();

        for i in (0..self.known.len()).rev() {
            let uid = self.known[i].uid;
            if current
                .binary_search_by_key(&uid, |e| e.message.uid)
                .is_err()
            {
                self.known.remove(i);
                lines.push(ImapResponse::expunge(i as u32 + 1));
            }
        }

        let mut grown = false;
        for entry in current {
            let uid = entry.message.uid;
            match self.known.binary_search_by_key(&uid, |m| m.uid) {
                Ok(i) => {
                    let known = &mut self.known[i];
                    if known.flags != entry.message.flags {
                        known.flags = entry.message.flags.clone();
                        lines.push(ImapResponse::fetch_flags(
                            i as u32 + 1,
                            with_uid.then_some(uid),
                            &known.flags,
                        ));
                    }
                }
                // UIDs only grow, so an unknown message is newer than
                // every known one
                Err(_) => {
                    self.known.push(KnownMessage::from(entry));
                    grown = true;
                }
            }
        }
        if grown {
            lines.push(ImapResponse::exists(self.exists()));
        }

        lines
    }
}

/// IMAP session
pub struct ImapSession {
    /// Session ID
    pub id: Uuid,
    /// Current state
    pub state: SessionState,
    /// Whether the transport is TLS-protected
    pub tls_active: bool,
    /// Authenticated user
    pub user: Option<Arc<dyn User>>,
    /// Selected mailbox
    pub selected: Option<SelectedMailbox>,
    /// Session creation time
    pub created_at: DateTime<Utc>,
    /// Last activity time
    pub last_activity: DateTime<Utc>,
}

impl ImapSession {
    /// Create a new session
    pub fn new() -> Self {
        let now = Utc::now();
        Self {
            id: Uuid::new_v4(),
            state: SessionState::NotAuthenticated,
            tls_active: false,
            user: None,
            selected: None,
            created_at: now,
            last_activity: now,
        }
    }

    /// Check if session is authenticated
    pub fn is_authenticated(&self) -> bool {
        matches!(
            self.state,
            SessionState::Authenticated | SessionState::Selected
        )
    }

    /// Check if a mailbox is selected
    pub fn is_selected(&self) -> bool {
        self.state == SessionState::Selected
    }

    /// Check if the selected mailbox is read-only
    pub fn is_readonly(&self) -> bool {
        self.selected.as_ref().map(|s| s.read_only).unwrap_or(false)
    }

    /// Bind the session to an authenticated user
    pub fn authenticate(&mut self, user: Arc<dyn User>) {
        self.user = Some(user);
        self.state = SessionState::Authenticated;
        self.update_activity();
    }

    /// Authenticated username
    pub fn username(&self) -> Option<&str> {
        self.user.as_ref().map(|u| u.username())
    }

    /// Select a mailbox, replacing any current selection
    pub fn select(&mut self, mailbox: Arc<dyn Mailbox>, read_only: bool, known: Vec<KnownMessage>) {
        self.selected = Some(SelectedMailbox {
            mailbox,
            read_only,
            known,
        });
        self.state = SessionState::Selected;
    }

    /// Close the selected mailbox
    pub fn close_mailbox(&mut self) {
        self.selected = None;
        if self.state == SessionState::Selected {
            self.state = SessionState::Authenticated;
        }
    }

    /// Logout
    pub fn logout(&mut self) {
        self.state = SessionState::Logout;
        self.selected = None;
    }

    /// Update last activity time
    pub fn update_activity(&mut self) {
        self.last_activity = Utc::now();
    }
}

impl Default for ImapSession {
    fn default() -> Self {
        Self::new()
    }
}
