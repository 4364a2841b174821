//! Streaming Upload Module
//!
//! Implements the client-streamed upload protocol:
//! 1. First message declares the total blob size
//! 2. Content chunks follow, hashed and staged in arrival order
//! 3. On end of stream with the exact declared byte count, the content is
//!    stored by digest and a fresh blob id is minted
//!
//! Any violation, disconnect or idle timeout aborts the session and leaves
//! nothing behind.

pub mod session;
pub mod tracker;
pub mod types;

pub use session::UploadSession;
pub use tracker::{SessionTicket, SessionTracker};
pub use types::*;
