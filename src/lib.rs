//! vacationd: an LMTP out-of-office auto-responder.

pub mod config;
pub mod delivery;
pub mod error;
pub mod lmtp;
pub mod message;
pub mod policy;
pub mod ratelimit;
pub mod reply;
pub mod responder;
pub mod session;
pub mod store;
