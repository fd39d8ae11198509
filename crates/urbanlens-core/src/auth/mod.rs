//! Authentication module for bearer token storage.
//!
//! This module provides:
//! - `TokenStore`: the interface the transport reads tokens from and clears on 401/403
//! - `MemoryTokenStore`: process-local store, for tests and embedding
//! - `FileTokenStore`: session persisted to `session.json` in the cache directory
//! - `KeyringTokenStore`: token kept in the OS keychain

pub mod credentials;
pub mod session;
pub mod token;

pub use credentials::KeyringTokenStore;
pub use session::{FileTokenStore, SessionData};
pub use token::{MemoryTokenStore, TokenStore};
