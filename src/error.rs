//! Error types for vacationd.
//!
//! One enum per concern. Policy vetoes are not errors and live in
//! [`crate::policy::SkipReason`].

use std::time::Duration;

/// Configuration-related errors.
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("Missing required configuration: {key}. {hint}")]
    MissingRequired { key: String, hint: String },

    #[error("Invalid configuration value for {key}: {message}")]
    InvalidValue { key: String, message: String },
}

/// Database-related errors.
#[derive(Debug, thiserror::Error)]
pub enum DatabaseError {
    #[error("Connection error: {0}")]
    Pool(String),

    #[error("Query failed: {0}")]
    Query(String),

    #[error("Migration failed: {0}")]
    Migration(String),
}

/// Rejections of individual envelope commands. The session survives these.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum EnvelopeError {
    #[error("invalid from address")]
    InvalidSender,

    #[error("invalid rcpt address")]
    InvalidRecipient,

    #[error("invalid rcpt domain: {domain}")]
    WrongDomain { domain: String },

    #[error("bad sequence of commands: {0}")]
    BadSequence(&'static str),
}

/// Failures reading or parsing an inbound message.
#[derive(Debug, thiserror::Error)]
pub enum MessageError {
    #[error("IO error while reading message: {0}")]
    Io(#[from] std::io::Error),

    #[error("malformed message header: {0}")]
    Malformed(String),

    #[error("message header exceeds {limit} bytes")]
    HeadersTooLarge { limit: usize },
}

/// Failures building a reply or asking the generator for its content.
#[derive(Debug, thiserror::Error)]
pub enum ReplyError {
    #[error("invalid reply address {address:?}: {reason}")]
    InvalidAddress { address: String, reason: String },

    #[error("failed to compose reply: {0}")]
    Compose(String),

    #[error("vacation store lookup failed: {0}")]
    Store(#[from] DatabaseError),
}

/// Outbound relay failures.
#[derive(Debug, thiserror::Error)]
pub enum DeliveryError {
    #[error("SMTP relay {relay} rejected or failed the reply: {reason}")]
    SendFailed { relay: String, reason: String },
}

/// Why a single recipient could not be handled.
#[derive(Debug, thiserror::Error)]
pub enum RecipientError {
    #[error(transparent)]
    Reply(#[from] ReplyError),

    #[error(transparent)]
    Delivery(#[from] DeliveryError),

    #[error("message processing deadline of {0:?} exceeded")]
    Timeout(Duration),
}

/// Session-level failures that abort the whole transaction.
#[derive(Debug, thiserror::Error)]
pub enum SessionError {
    #[error(transparent)]
    Envelope(#[from] EnvelopeError),

    #[error(transparent)]
    Message(#[from] MessageError),
}
