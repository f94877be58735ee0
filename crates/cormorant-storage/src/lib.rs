//! Cormorant Storage - Mailbox store contract and reference store
//!
//! This crate defines the store contract the IMAP layer drives, the flag
//! merge rules, the update bus, and an in-memory implementation of the
//! contract.

pub mod flags;
pub mod memory;
pub mod models;
pub mod repository;
pub mod search;
pub mod updates;

pub use memory::MemoryBackend;
pub use models::*;
pub use repository::*;
pub use updates::{Delivery, Update, UpdateBus, UpdateKind, UpdateReceiver};
