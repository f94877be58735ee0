//! Store models

use chrono::{DateTime, Utc};
use cormorant_common::types::flags;

/// Mailbox hierarchy delimiter
pub const DELIMITER: &str = "/";

/// Name of the permanent root mailbox
pub const INBOX: &str = "INBOX";

/// RFC 6154 special-use attributes
pub mod special_use {
    pub const SENT: &str = "\\Sent";
    pub const DRAFTS: &str = "\\Drafts";
    pub const TRASH: &str = "\\Trash";
}

/// Message model
#[derive(Debug, Clone, PartialEq)]
pub struct Message {
    pub uid: u32,
    pub date: DateTime<Utc>,
    pub size: u32,
    pub flags: Vec<String>,
    pub body: Vec<u8>,
}

impl Message {
    pub fn has_flag(&self, flag: &str) -> bool {
        flags::contains(&self.flags, flag)
    }

    /// Header block of the raw message, including the blank separator line
    pub fn header(&self) -> &[u8] {
        &self.body[..self.header_len()]
    }

    /// Body text following the header block
    pub fn text(&self) -> &[u8] {
        &self.body[self.header_len()..]
    }

    fn header_len(&self) -> usize {
        let crlf = self
            .body
            .windows(4)
            .position(|w| w == b"\r\n\r\n")
            .map(|p| p + 4);
        let lf = self.body.windows(2).position(|w| w == b"\n\n").map(|p| p + 2);
        match (crlf, lf) {
            (Some(a), Some(b)) => a.min(b),
            (Some(a), None) | (None, Some(a)) => a,
            (None, None) => self.body.len(),
        }
    }
}

/// A message together with its current sequence number
#[derive(Debug, Clone, PartialEq)]
pub struct MessageEntry {
    pub seq: u32,
    pub message: Message,
}

/// Flag operation for STORE
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FlagsOp {
    /// Replace flags
    Set,
    /// Add flags
    Add,
    /// Remove flags
    Remove,
}

/// New flags of a message after a flag update
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FlagChange {
    pub seq: u32,
    pub uid: u32,
    pub flags: Vec<String>,
}

/// UID mapping produced by COPY and MOVE
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct CopyUids {
    /// UIDVALIDITY of the destination mailbox
    pub uid_validity: u32,
    pub source: Vec<u32>,
    pub dest: Vec<u32>,
}

/// Mailbox information for LIST
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MailboxInfo {
    pub attributes: Vec<String>,
    pub delimiter: String,
    pub name: String,
}

/// STATUS data items
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StatusItem {
    Messages,
    Recent,
    UidNext,
    UidValidity,
    Unseen,
}

impl StatusItem {
    pub fn parse(s: &str) -> Option<Self> {
        match s.to_uppercase().as_str() {
            "MESSAGES" => Some(StatusItem::Messages),
            "RECENT" => Some(StatusItem::Recent),
            "UIDNEXT" => Some(StatusItem::UidNext),
            "UIDVALIDITY" => Some(StatusItem::UidValidity),
            "UNSEEN" => Some(StatusItem::Unseen),
            _ => None,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            StatusItem::Messages => "MESSAGES",
            StatusItem::Recent => "RECENT",
            StatusItem::UidNext => "UIDNEXT",
            StatusItem::UidValidity => "UIDVALIDITY",
            StatusItem::Unseen => "UNSEEN",
        }
    }
}

/// Mailbox status. Only the requested items are populated; `flags`,
/// `permanent_flags` and `first_unseen` are always filled in.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct MailboxStatus {
    pub name: String,
    pub flags: Vec<String>,
    pub permanent_flags: Vec<String>,
    /// Sequence number of the first message without `\Seen`, 0 if none
    pub first_unseen: u32,
    pub messages: Option<u32>,
    pub recent: Option<u32>,
    pub uid_next: Option<u32>,
    pub uid_validity: Option<u32>,
    pub unseen: Option<u32>,
}

impl MailboxStatus {
    /// Requested items as (name, value) pairs, in request order
    pub fn items(&self, requested: &[StatusItem]) -> Vec<(&'static str, u32)> {
        requested
            .iter()
            .filter_map(|item| {
                let value = match item {
                    StatusItem::Messages => self.messages,
                    StatusItem::Recent => self.recent,
                    StatusItem::UidNext => self.uid_next,
                    StatusItem::UidValidity => self.uid_validity,
                    StatusItem::Unseen => self.unseen,
                }?;
                Some((item.as_str(), value))
            })
            .collect()
    }
}
