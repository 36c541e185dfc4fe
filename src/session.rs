//! Per-connection delivery session.
//!
//! Validates envelope commands as they arrive and, once the message data is
//! complete, hands the transaction to the [`Responder`].

use std::sync::LazyLock;

use regex::Regex;
use tokio::io::AsyncRead;
use tracing::debug;

use crate::error::{EnvelopeError, SessionError};
use crate::message::InboundMessage;
use crate::responder::{RecipientStatus, Responder};

static SENDER_SHAPE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"^[^@]+@[^@]+$").expect("sender pattern is valid"));

/// `local#sub@domain`, where `local@sub` is the mailbox being replied for.
static RECIPIENT_TAG: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"^([^#]+)#([^@]+)@([^@]+)$").expect("recipient pattern is valid"));

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionState {
    Idle,
    HaveSender,
    HaveRecipients,
    Processing,
}

/// An accepted recipient: the address as given on the wire and the mailbox
/// it stands for.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Recipient {
    pub tag: String,
    pub real: String,
}

pub struct Session {
    domain: String,
    responder: Responder,
    state: SessionState,
    sender: String,
    recipients: Vec<Recipient>,
}

impl Session {
    pub fn new(domain: impl Into<String>, responder: Responder) -> Self {
        Self {
            domain: domain.into(),
            responder,
            state: SessionState::Idle,
            sender: String::new(),
            recipients: Vec::new(),
        }
    }

    pub fn state(&self) -> SessionState {
        self.state
    }

    pub fn sender(&self) -> &str {
        &self.sender
    }

    pub fn recipients(&self) -> &[Recipient] {
        &self.recipients
    }

    /// Start a transaction. An empty sender is a bounce and is accepted.
    pub fn set_sender(&mut self, from: &str) -> Result<(), EnvelopeError> {
        if self.state != SessionState::Idle {
            return Err(EnvelopeError::BadSequence("sender already specified"));
        }
        if !from.is_empty() && !SENDER_SHAPE.is_match(from) {
            return Err(EnvelopeError::InvalidSender);
        }

        self.sender = from.to_string();
        self.state = SessionState::HaveSender;
        Ok(())
    }

    /// Accept one recipient tag. Rejections leave earlier recipients alone.
    pub fn add_recipient(&mut self, tag: &str) -> Result<&Recipient, EnvelopeError> {
        if !matches!(
            self.state,
            SessionState::HaveSender | SessionState::HaveRecipients
        ) {
            return Err(EnvelopeError::BadSequence("need MAIL before RCPT"));
        }

        let caps = RECIPIENT_TAG
            .captures(tag)
            .ok_or(EnvelopeError::InvalidRecipient)?;
        if &caps[3] != self.domain {
            return Err(EnvelopeError::WrongDomain {
                domain: caps[3].to_string(),
            });
        }
        let real = format!("{}@{}", &caps[1], &caps[2]);

        self.state = SessionState::HaveRecipients;
        let idx = match self.recipients.iter().position(|r| r.tag == tag) {
            Some(idx) => {
                self.recipients[idx].real = real;
                idx
            }
            None => {
                self.recipients.push(Recipient {
                    tag: tag.to_string(),
                    real,
                });
                self.recipients.len() - 1
            }
        };
        Ok(&self.recipients[idx])
    }

    /// Read the message from `data` and process it for every accepted
    /// recipient. The stream is always drained. The session is back in
    /// `Idle` afterwards, whatever the result.
    pub async fn data_end<R>(
        &mut self,
        data: R,
    ) -> Result<Vec<(String, RecipientStatus)>, SessionError>
    where
        R: AsyncRead + Unpin,
    {
        if self.state != SessionState::HaveRecipients {
            return Err(EnvelopeError::BadSequence("need RCPT before DATA").into());
        }
        self.state = SessionState::Processing;

        let result = self.process(data).await;
        self.reset();
        result
    }

    async fn process<R>(&self, data: R) -> Result<Vec<(String, RecipientStatus)>, SessionError>
    where
        R: AsyncRead + Unpin,
    {
        let msg = InboundMessage::read_from(data).await?;
        debug!(
            sender = %self.sender,
            recipients = self.recipients.len(),
            message_id = %msg.header("Message-ID"),
            "Message received"
        );

        let recipients: Vec<(String, String)> = self
            .recipients
            .iter()
            .map(|r| (r.tag.clone(), r.real.clone()))
            .collect();
        Ok(self
            .responder
            .handle_message(&msg, &self.sender, &recipients)
            .await)
    }

    /// Abandon the current transaction.
    pub fn reset(&mut self) {
        self.state = SessionState::Idle;
        self.sender.clear();
        self.recipients.clear();
    }
}
