//! Transports that carry a backup session.

pub mod server;

pub use server::{PeerProcess, ServerSession, SessionTarget};
