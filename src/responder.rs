//! Per-message auto-reply decisions.
//!
//! Message-wide vetoes run once; each recipient then goes through the
//! addressed-to check, the rate limiter, reply generation and delivery in
//! acceptance order. All of it shares one processing deadline.

use std::sync::Arc;
use std::time::Duration;

use tokio::time::Instant;
use tracing::{info, warn};

use crate::delivery::Delivery;
use crate::error::RecipientError;
use crate::message::InboundMessage;
use crate::policy::{self, SkipReason};
use crate::ratelimit::RateLimiter;
use crate::reply::ReplyBuilder;

/// Bound on all work done for one message after its data arrives.
pub const PROCESSING_DEADLINE: Duration = Duration::from_secs(15);

/// What happened for one recipient when nothing went wrong.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Outcome {
    Sent,
    Skipped(SkipReason),
}

pub type RecipientStatus = Result<Outcome, RecipientError>;

/// Decides on and sends auto-replies. Cheap to clone; one per listener.
#[derive(Clone)]
pub struct Responder {
    limiter: RateLimiter,
    builder: ReplyBuilder,
    delivery: Arc<dyn Delivery>,
    deadline: Duration,
}

impl Responder {
    pub fn new(limiter: RateLimiter, builder: ReplyBuilder, delivery: Arc<dyn Delivery>) -> Self {
        Self {
            limiter,
            builder,
            delivery,
            deadline: PROCESSING_DEADLINE,
        }
    }

    pub fn with_deadline(mut self, deadline: Duration) -> Self {
        self.deadline = deadline;
        self
    }

    /// Process one message for every `(tag, real address)` recipient, in
    /// order. Returns one status per recipient, keyed by tag.
    pub async fn handle_message(
        &self,
        msg: &InboundMessage,
        sender: &str,
        recipients: &[(String, String)],
    ) -> Vec<(String, RecipientStatus)> {
        let deadline = Instant::now() + self.deadline;

        if let Some(reason) = policy::message_veto(msg, sender) {
            info!(sender = %sender, reason = %reason, "Not replying to message");
            return recipients
                .iter()
                .map(|(tag, _)| (tag.clone(), Ok(Outcome::Skipped(reason))))
                .collect();
        }

        let mut statuses = Vec::with_capacity(recipients.len());
        for (tag, real) in recipients {
            let status = if Instant::now() >= deadline {
                Err(RecipientError::Timeout(self.deadline))
            } else {
                tokio::time::timeout_at(deadline, self.handle_recipient(msg, sender, real))
                    .await
                    .unwrap_or(Err(RecipientError::Timeout(self.deadline)))
            };

            match &status {
                Ok(Outcome::Sent) => {
                    info!(sender = %sender, recipient = %real, "Auto-reply sent");
                }
                Ok(Outcome::Skipped(reason)) => {
                    info!(sender = %sender, recipient = %real, reason = %reason, "Not replying");
                }
                Err(e) => {
                    warn!(sender = %sender, recipient = %real, error = %e, "Auto-reply failed");
                }
            }
            statuses.push((tag.clone(), status));
        }
        statuses
    }

    async fn handle_recipient(
        &self,
        msg: &InboundMessage,
        sender: &str,
        recipient: &str,
    ) -> RecipientStatus {
        if !policy::is_message_addressed_to(msg, recipient) {
            return Ok(Outcome::Skipped(SkipReason::NotAddressedTo));
        }

        if !self.limiter.ratelimit(recipient, sender).await {
            return Ok(Outcome::Skipped(SkipReason::RateLimited));
        }

        let Some(reply) = self.builder.build(msg, sender, recipient).await? else {
            return Ok(Outcome::Skipped(SkipReason::NoActiveVacation));
        };

        self.delivery.deliver(reply.to_message()?).await?;
        Ok(Outcome::Sent)
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Mutex;

    use async_trait::async_trait;
    use lettre::Message;
    use tokio::sync::watch;

    use super::*;
    use crate::error::{DeliveryError, ReplyError};
    use crate::ratelimit::spawn_expiry_worker;
    use crate::reply::{Reply, ReplyGenerator};

    const WINDOW: Duration = Duration::from_secs(3600);

    #[derive(Default)]
    struct Recorder {
        sent: Mutex<Vec<Message>>,
    }

    #[async_trait]
    impl Delivery for Recorder {
        async fn deliver(&self, msg: Message) -> Result<(), DeliveryError> {
            self.sent.lock().unwrap().push(msg);
            Ok(())
        }
    }

    struct Stalls;

    #[async_trait]
    impl Delivery for Stalls {
        async fn deliver(&self, _msg: Message) -> Result<(), DeliveryError> {
            std::future::pending().await
        }
    }

    struct Refuses;

    #[async_trait]
    impl Delivery for Refuses {
        async fn deliver(&self, _msg: Message) -> Result<(), DeliveryError> {
            Err(DeliveryError::SendFailed {
                relay: "relay:25".into(),
                reason: "554 no".into(),
            })
        }
    }

    struct NoVacation;

    #[async_trait]
    impl ReplyGenerator for NoVacation {
        async fn generate(
            &self,
            _msg: &InboundMessage,
            _sender: &str,
            _recipient: &str,
            _reply: Reply,
        ) -> Result<Option<Reply>, ReplyError> {
            Ok(None)
        }
    }

    struct FailsFor(&'static str);

    #[async_trait]
    impl ReplyGenerator for FailsFor {
        async fn generate(
            &self,
            _msg: &InboundMessage,
            _sender: &str,
            recipient: &str,
            reply: Reply,
        ) -> Result<Option<Reply>, ReplyError> {
            if recipient == self.0 {
                return Err(ReplyError::Compose("lookup failed".into()));
            }
            Ok(Some(reply))
        }
    }

    struct Harness {
        responder: Responder,
        limiter: RateLimiter,
        _shutdown: watch::Sender<bool>,
    }

    fn harness(
        delivery: Arc<dyn Delivery>,
        generator: Option<Arc<dyn ReplyGenerator>>,
    ) -> Harness {
        let (limiter, worker) = RateLimiter::new(WINDOW);
        let (shutdown, rx) = watch::channel(false);
        spawn_expiry_worker(worker, rx);
        let builder = ReplyBuilder::new("autoreply.example", generator);
        Harness {
            responder: Responder::new(limiter.clone(), builder, delivery),
            limiter,
            _shutdown: shutdown,
        }
    }

    fn msg(headers: &str) -> InboundMessage {
        InboundMessage::parse_headers(headers.as_bytes()).unwrap()
    }

    fn rcpt(tag: &str, real: &str) -> (String, String) {
        (tag.to_string(), real.to_string())
    }

    const PLAIN: &str = "From: alice@x.com\r\nTo: bob@y.com, carol@y.com\r\nSubject: hi\r\n";

    // ── Happy path ──────────────────────────────────────────────────

    #[tokio::test(start_paused = true)]
    async fn sends_one_reply_per_addressed_recipient() {
        let recorder = Arc::new(Recorder::default());
        let h = harness(recorder.clone(), None);

        let statuses = h
            .responder
            .handle_message(
                &msg(PLAIN),
                "alice@x.com",
                &[
                    rcpt("bob#y.com@autoreply.example", "bob@y.com"),
                    rcpt("dave#y.com@autoreply.example", "dave@y.com"),
                ],
            )
            .await;

        assert_eq!(statuses.len(), 2);
        assert_eq!(statuses[0].0, "bob#y.com@autoreply.example");
        assert!(matches!(statuses[0].1, Ok(Outcome::Sent)));
        assert!(matches!(
            statuses[1].1,
            Ok(Outcome::Skipped(SkipReason::NotAddressedTo))
        ));
        assert_eq!(recorder.sent.lock().unwrap().len(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn second_message_is_rate_limited() {
        let recorder = Arc::new(Recorder::default());
        let h = harness(recorder.clone(), None);
        let recipients = [rcpt("bob#y.com@autoreply.example", "bob@y.com")];

        h.responder.handle_message(&msg(PLAIN), "alice@x.com", &recipients).await;
        let statuses = h
            .responder
            .handle_message(&msg(PLAIN), "alice@x.com", &recipients)
            .await;

        assert!(matches!(
            statuses[0].1,
            Ok(Outcome::Skipped(SkipReason::RateLimited))
        ));
        assert_eq!(recorder.sent.lock().unwrap().len(), 1);
        assert!(h.limiter.is_throttled("bob@y.com", "alice@x.com"));
    }

    // ── Vetoes ──────────────────────────────────────────────────────

    #[tokio::test(start_paused = true)]
    async fn message_veto_leaves_limiter_untouched() {
        let recorder = Arc::new(Recorder::default());
        let h = harness(recorder.clone(), None);

        let list = format!("{PLAIN}List-Unsubscribe: <mailto:u@x.com>\r\n");
        let statuses = h
            .responder
            .handle_message(
                &msg(&list),
                "alice@x.com",
                &[rcpt("bob#y.com@autoreply.example", "bob@y.com")],
            )
            .await;

        assert!(matches!(
            statuses[0].1,
            Ok(Outcome::Skipped(SkipReason::MailingList))
        ));
        assert_eq!(h.limiter.throttled(), 0);
        assert!(recorder.sent.lock().unwrap().is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn generator_none_still_consumes_permit() {
        let recorder = Arc::new(Recorder::default());
        let h = harness(recorder.clone(), Some(Arc::new(NoVacation)));

        let statuses = h
            .responder
            .handle_message(
                &msg(PLAIN),
                "alice@x.com",
                &[rcpt("bob#y.com@autoreply.example", "bob@y.com")],
            )
            .await;

        assert!(matches!(
            statuses[0].1,
            Ok(Outcome::Skipped(SkipReason::NoActiveVacation))
        ));
        assert!(recorder.sent.lock().unwrap().is_empty());
        assert!(h.limiter.is_throttled("bob@y.com", "alice@x.com"));
    }

    // ── Failures ────────────────────────────────────────────────────

    #[tokio::test(start_paused = true)]
    async fn delivery_failure_does_not_abort_siblings() {
        let h = harness(Arc::new(Refuses), None);

        let statuses = h
            .responder
            .handle_message(
                &msg(PLAIN),
                "alice@x.com",
                &[
                    rcpt("bob#y.com@autoreply.example", "bob@y.com"),
                    rcpt("carol#y.com@autoreply.example", "carol@y.com"),
                ],
            )
            .await;

        assert_eq!(statuses.len(), 2);
        for (_, status) in &statuses {
            assert!(matches!(status, Err(RecipientError::Delivery(_))));
        }
    }

    #[tokio::test(start_paused = true)]
    async fn generator_failure_does_not_abort_siblings() {
        let recorder = Arc::new(Recorder::default());
        let h = harness(recorder.clone(), Some(Arc::new(FailsFor("bob@y.com"))));

        let statuses = h
            .responder
            .handle_message(
                &msg(PLAIN),
                "alice@x.com",
                &[
                    rcpt("bob#y.com@autoreply.example", "bob@y.com"),
                    rcpt("carol#y.com@autoreply.example", "carol@y.com"),
                ],
            )
            .await;

        assert!(matches!(statuses[0].1, Err(RecipientError::Reply(_))));
        assert_eq!(statuses[1].0, "carol#y.com@autoreply.example");
        assert!(matches!(statuses[1].1, Ok(Outcome::Sent)));
        assert_eq!(recorder.sent.lock().unwrap().len(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn deadline_times_out_remaining_recipients() {
        let h = harness(Arc::new(Stalls), None);
        let responder = h.responder.clone().with_deadline(Duration::from_secs(2));

        let statuses = responder
            .handle_message(
                &msg(PLAIN),
                "alice@x.com",
                &[
                    rcpt("bob#y.com@autoreply.example", "bob@y.com"),
                    rcpt("carol#y.com@autoreply.example", "carol@y.com"),
                ],
            )
            .await;

        assert!(matches!(statuses[0].1, Err(RecipientError::Timeout(d)) if d == Duration::from_secs(2)));
        assert!(matches!(statuses[1].1, Err(RecipientError::Timeout(_))));
        // The second recipient never reached the limiter.
        assert!(!h.limiter.is_throttled("carol@y.com", "alice@x.com"));
    }
}
