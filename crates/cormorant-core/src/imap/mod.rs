//! IMAP4rev1 Server Module
//!
//! Supported commands:
//! - CAPABILITY, NOOP, LOGOUT, STARTTLS
//! - LOGIN, AUTHENTICATE (PLAIN, with SASL-IR)
//! - LIST, LSUB, SELECT, EXAMINE, STATUS, NAMESPACE
//! - CREATE, DELETE, RENAME, SUBSCRIBE, UNSUBSCRIBE (mailbox management)
//! - FETCH, SEARCH, STORE, COPY, MOVE, EXPUNGE, APPEND (message operations)
//! - CHECK, CLOSE, UNSELECT, IDLE
//!
//! All message commands also come in UID form.

pub mod command;
pub mod handler;
pub mod parser;
pub mod response;
pub mod server;
pub mod session;
pub mod stream;

pub use handler::{ImapHandler, SessionConfig};
pub use server::ImapServer;
pub use session::{ImapSession, SessionState};
