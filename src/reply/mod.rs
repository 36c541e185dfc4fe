//! Auto-reply construction.
//!
//! [`ReplyBuilder`] produces a threaded reply skeleton for one recipient and
//! hands it to the configured [`ReplyGenerator`] for content. Without a
//! generator the skeleton goes out with a fixed body.

pub mod headers;

use std::sync::Arc;
use std::time::SystemTime;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use lettre::Message;
use lettre::message::Mailbox;
use lettre::message::header::ContentType;
use uuid::Uuid;

use self::headers::{AutoSubmitted, XAutoResponseSuppress};
use crate::error::ReplyError;
use crate::message::InboundMessage;
use crate::policy::{RECIPIENT_HEADERS, extract_address};

pub const SUBJECT_PREFIX: &str = "Auto: ";
pub const DEFAULT_BODY: &str = "Reader of mailbox is out-of-office / on vacation";

/// An outgoing auto-reply, before it is rendered to a wire message.
///
/// Generators may rewrite `subject` and `body`; the addressing and threading
/// fields are fixed by the builder.
#[derive(Debug, Clone)]
pub struct Reply {
    pub from: Mailbox,
    pub to: Mailbox,
    pub subject: String,
    pub date: DateTime<Utc>,
    pub message_id: String,
    pub in_reply_to: Option<String>,
    pub references: Option<String>,
    pub body: String,
}

impl Reply {
    /// Skeleton reply from `recipient` back to `sender`.
    pub fn skeleton(
        msg: &InboundMessage,
        sender: &str,
        recipient: &str,
        domain: &str,
    ) -> Result<Self, ReplyError> {
        let from = parse_mailbox(&extract_address(msg, recipient, RECIPIENT_HEADERS))?;
        let to = parse_mailbox(&extract_address(msg, sender, &["From"]))?;

        let original_id = msg.header("Message-ID");
        let in_reply_to = (!original_id.is_empty()).then(|| original_id.to_string());

        let prior = match msg.header("References") {
            "" => msg.header("In-Reply-To"),
            references => references,
        };
        let references = [prior, original_id]
            .into_iter()
            .filter(|part| !part.is_empty())
            .collect::<Vec<_>>()
            .join(" ");

        Ok(Self {
            from,
            to,
            subject: format!("{SUBJECT_PREFIX}{}", msg.header("Subject")),
            date: Utc::now(),
            message_id: format!("<{}@{domain}>", Uuid::new_v4()),
            in_reply_to,
            references: (!references.is_empty()).then_some(references),
            body: DEFAULT_BODY.to_string(),
        })
    }

    /// Render to a sendable message, stamping the loop-suppression headers.
    pub fn to_message(&self) -> Result<Message, ReplyError> {
        let mut builder = Message::builder()
            .from(self.from.clone())
            .to(self.to.clone())
            .subject(self.subject.clone())
            .date(SystemTime::from(self.date))
            .message_id(Some(self.message_id.clone()))
            .header(AutoSubmitted::auto_replied())
            .header(XAutoResponseSuppress::all())
            .header(ContentType::TEXT_PLAIN);

        if let Some(in_reply_to) = &self.in_reply_to {
            builder = builder.in_reply_to(in_reply_to.clone());
        }
        if let Some(references) = &self.references {
            builder = builder.references(references.clone());
        }

        builder
            .body(self.body.clone())
            .map_err(|e| ReplyError::Compose(e.to_string()))
    }
}

fn parse_mailbox(address: &str) -> Result<Mailbox, ReplyError> {
    address
        .parse()
        .map_err(|e: lettre::address::AddressError| ReplyError::InvalidAddress {
            address: address.to_string(),
            reason: e.to_string(),
        })
}

/// Source of reply content.
///
/// `Ok(None)` means no reply should be sent for this recipient; it is not an
/// error. Implementations are shared across sessions.
#[async_trait]
pub trait ReplyGenerator: Send + Sync {
    async fn generate(
        &self,
        msg: &InboundMessage,
        sender: &str,
        recipient: &str,
        reply: Reply,
    ) -> Result<Option<Reply>, ReplyError>;
}

/// Builds replies for one auto-reply domain.
#[derive(Clone)]
pub struct ReplyBuilder {
    domain: String,
    generator: Option<Arc<dyn ReplyGenerator>>,
}

impl ReplyBuilder {
    pub fn new(domain: impl Into<String>, generator: Option<Arc<dyn ReplyGenerator>>) -> Self {
        Self {
            domain: domain.into(),
            generator,
        }
    }

    /// Build the reply `recipient` sends to `sender`, or `None` if the
    /// generator declines. Generator failures propagate unchanged.
    pub async fn build(
        &self,
        msg: &InboundMessage,
        sender: &str,
        recipient: &str,
    ) -> Result<Option<Reply>, ReplyError> {
        let reply = Reply::skeleton(msg, sender, recipient, &self.domain)?;

        match &self.generator {
            Some(generator) => generator.generate(msg, sender, recipient, reply).await,
            None => Ok(Some(reply)),
        }
    }
}
