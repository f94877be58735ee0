//! Cormorant Core - IMAP4rev1 protocol engine
//!
//! This crate provides the IMAP session state machine, the wire parser and
//! response rendering, SASL authentication and the STARTTLS upgrade.

pub mod auth;
pub mod imap;
pub mod tls;

pub use auth::{SaslMechanism, SaslRegistry};
pub use imap::{ImapHandler, ImapServer, SessionConfig};
pub use tls::create_tls_acceptor;
