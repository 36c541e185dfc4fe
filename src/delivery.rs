//! Outbound delivery of composed replies.

use std::time::Duration;

use async_trait::async_trait;
use lettre::{AsyncSmtpTransport, AsyncTransport, Message, Tokio1Executor};

use crate::error::DeliveryError;

/// Sends a composed reply. One attempt, no retry.
#[async_trait]
pub trait Delivery: Send + Sync {
    async fn deliver(&self, msg: Message) -> Result<(), DeliveryError>;
}

/// Plain SMTP relay, one connection per reply.
pub struct SmtpRelay {
    relay: String,
    transport: AsyncSmtpTransport<Tokio1Executor>,
}

impl SmtpRelay {
    /// `timeout` bounds each network operation of a single send.
    pub fn new(host: &str, port: u16, timeout: Duration) -> Self {
        let transport = AsyncSmtpTransport::<Tokio1Executor>::builder_dangerous(host)
            .port(port)
            .timeout(Some(timeout))
            .build();

        Self {
            relay: format!("{host}:{port}"),
            transport,
        }
    }

    pub fn relay(&self) -> &str {
        &self.relay
    }
}

#[async_trait]
impl Delivery for SmtpRelay {
    async fn deliver(&self, msg: Message) -> Result<(), DeliveryError> {
        let response = self
            .transport
            .send(msg)
            .await
            .map_err(|e| DeliveryError::SendFailed {
                relay: self.relay.clone(),
                reason: e.to_string(),
            })?;

        tracing::debug!(
            relay = %self.relay,
            code = %response.code(),
            "Relay accepted reply"
        );
        Ok(())
    }
}
