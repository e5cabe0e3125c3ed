//! Session management for the Gatehouse gateway.
//!
//! A session binds a set of verified claims to a signed token whose `jti` is
//! the session id, with an absolute expiry and a last-activity timestamp.

pub mod manager;
pub mod session;
pub mod store;

pub use manager::SessionManager;
pub use session::Session;
pub use store::{MemorySessionStore, SessionStore};
