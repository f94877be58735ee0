//! IMAP Command definitions
//!
//! Defines the IMAP commands supported by this server.

use chrono::{DateTime, Utc};
use cormorant_common::types::{SearchCriteria, SequenceSet};
use cormorant_storage::{FlagsOp, StatusItem};

/// IMAP command tag (client-provided identifier)
pub type Tag = String;

/// Part of a message addressed by a `BODY[...]` item
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Section {
    /// `BODY[]`, the whole message
    Full,
    /// `BODY[HEADER]`
    Header,
    /// `BODY[TEXT]`
    Text,
}

impl Section {
    fn parse(s: &str) -> Option<Self> {
        match s {
            "" => Some(Section::Full),
            "HEADER" => Some(Section::Header),
            "TEXT" => Some(Section::Text),
            _ => None,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Section::Full => "",
            Section::Header => "HEADER",
            Section::Text => "TEXT",
        }
    }
}

/// FETCH data items
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum FetchItem {
    /// Message flags
    Flags,
    /// Internal date
    InternalDate,
    /// RFC822.SIZE
    Rfc822Size,
    /// RFC822, same as BODY[]
    Rfc822,
    /// RFC822.HEADER, same as BODY.PEEK[HEADER]
    Rfc822Header,
    /// RFC822.TEXT, same as BODY[TEXT]
    Rfc822Text,
    /// UID
    Uid,
    /// Body section; `peek` leaves `\Seen` alone
    Body { section: Section, peek: bool },
    /// Macro for FLAGS INTERNALDATE RFC822.SIZE (ENVELOPE is not produced)
    All,
    /// Macro for FLAGS INTERNALDATE RFC822.SIZE
    Fast,
    /// Macro for FLAGS INTERNALDATE RFC822.SIZE (ENVELOPE and BODY are not produced)
    Full,
}

impl FetchItem {
    /// Parse a single fetch item
    pub fn parse(s: &str) -> Option<Self> {
        let s = s.trim().to_uppercase();
        match s.as_str() {
            "FLAGS" => Some(FetchItem::Flags),
            "INTERNALDATE" => Some(FetchItem::InternalDate),
            "RFC822.SIZE" => Some(FetchItem::Rfc822Size),
            "RFC822" => Some(FetchItem::Rfc822),
            "RFC822.HEADER" => Some(FetchItem::Rfc822Header),
            "RFC822.TEXT" => Some(FetchItem::Rfc822Text),
            "UID" => Some(FetchItem::Uid),
            "ALL" => Some(FetchItem::All),
            "FAST" => Some(FetchItem::Fast),
            "FULL" => Some(FetchItem::Full),
            _ if s.starts_with("BODY.PEEK[") => {
                let section = s.strip_prefix("BODY.PEEK[")?.strip_suffix(']')?;
                Some(FetchItem::Body {
                    section: Section::parse(section)?,
                    peek: true,
                })
            }
            _ if s.starts_with("BODY[") => {
                let section = s.strip_prefix("BODY[")?.strip_suffix(']')?;
                Some(FetchItem::Body {
                    section: Section::parse(section)?,
                    peek: false,
                })
            }
            _ => None,
        }
    }

    /// Expand macros into the items they stand for
    pub fn expand(items: &[FetchItem]) -> Vec<FetchItem> {
        let mut expanded = Vec::with_capacity(items.len());
        for item in items {
            match item {
                FetchItem::All | FetchItem::Fast | FetchItem::Full => {
                    expanded.extend([FetchItem::Flags, FetchItem::InternalDate, FetchItem::Rfc822Size])
                }
                other => expanded.push(other.clone()),
            }
        }
        expanded
    }

    /// Whether fetching this item marks the message `\Seen`
    pub fn sets_seen(&self) -> bool {
        matches!(
            self,
            FetchItem::Rfc822 | FetchItem::Rfc822Text | FetchItem::Body { peek: false, .. }
        )
    }
}

/// Store flags specification
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StoreFlags {
    pub operation: FlagsOp,
    pub silent: bool,
    pub flags: Vec<String>,
}

/// IMAP Command
#[derive(Debug, Clone, PartialEq)]
pub enum ImapCommand {
    // Any state commands
    Capability,
    Noop,
    Logout,
    StartTls,

    // Not authenticated state
    Login {
        username: String,
        password: String,
    },
    Authenticate {
        mechanism: String,
        initial_response: Option<String>,
    },

    // Authenticated state
    Select {
        mailbox: String,
    },
    Examine {
        mailbox: String,
    },
    Create {
        mailbox: String,
    },
    Delete {
        mailbox: String,
    },
    Rename {
        old_mailbox: String,
        new_mailbox: String,
    },
    Subscribe {
        mailbox: String,
    },
    Unsubscribe {
        mailbox: String,
    },
    List {
        reference: String,
        pattern: String,
    },
    Lsub {
        reference: String,
        pattern: String,
    },
    Status {
        mailbox: String,
        items: Vec<StatusItem>,
    },
    Append {
        mailbox: String,
        flags: Vec<String>,
        date: Option<DateTime<Utc>>,
        message: Vec<u8>,
    },
    Idle,
    Namespace,

    // Selected state
    Check,
    Close,
    Unselect,
    Expunge,
    Fetch {
        sequence: SequenceSet,
        items: Vec<FetchItem>,
        uid: bool,
    },
    Search {
        criteria: SearchCriteria,
        uid: bool,
    },
    Store {
        sequence: SequenceSet,
        flags: StoreFlags,
        uid: bool,
    },
    Copy {
        sequence: SequenceSet,
        mailbox: String,
        uid: bool,
    },
    Move {
        sequence: SequenceSet,
        mailbox: String,
        uid: bool,
    },
}

impl ImapCommand {
    /// Command name for logging
    pub fn name(&self) -> &'static str {
        match self {
            ImapCommand::Capability => "CAPABILITY",
            ImapCommand::Noop => "NOOP",
            ImapCommand::Logout => "LOGOUT",
            ImapCommand::StartTls => "STARTTLS",
            ImapCommand::Login { .. } => "LOGIN",
            ImapCommand::Authenticate { .. } => "AUTHENTICATE",
            ImapCommand::Select { .. } => "SELECT",
            ImapCommand::Examine { .. } => "EXAMINE",
            ImapCommand::Create { .. } => "CREATE",
            ImapCommand::Delete { .. } => "DELETE",
            ImapCommand::Rename { .. } => "RENAME",
            ImapCommand::Subscribe { .. } => "SUBSCRIBE",
            ImapCommand::Unsubscribe { .. } => "UNSUBSCRIBE",
            ImapCommand::List { .. } => "LIST",
            ImapCommand::Lsub { .. } => "LSUB",
            ImapCommand::Status { .. } => "STATUS",
            ImapCommand::Append { .. } => "APPEND",
            ImapCommand::Idle => "IDLE",
            ImapCommand::Namespace => "NAMESPACE",
            ImapCommand::Check => "CHECK",
            ImapCommand::Close => "CLOSE",
            ImapCommand::Unselect => "UNSELECT",
            ImapCommand::Expunge => "EXPUNGE",
            ImapCommand::Fetch { .. } => "FETCH",
            ImapCommand::Search { .. } => "SEARCH",
            ImapCommand::Store { .. } => "STORE",
            ImapCommand::Copy { .. } => "COPY",
            ImapCommand::Move { .. } => "MOVE",
        }
    }
}

/// Parsed IMAP command with tag
#[derive(Debug, Clone, PartialEq)]
pub struct TaggedCommand {
    pub tag: Tag,
    pub command: ImapCommand,
}
