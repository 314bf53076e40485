//! Local persistence
//!
//! A small JSON key-value store for node-local state: address book
//! records, the node identity key and certificate revocation state.

pub mod kv;

pub use kv::{KvStore, StorageError, STORE_FILE};
