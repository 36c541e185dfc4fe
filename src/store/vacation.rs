//! Vacation records and the store-backed reply generator.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use libsql::params;
use tracing::debug;

use super::VacationStore;
use crate::error::{DatabaseError, ReplyError};
use crate::message::InboundMessage;
use crate::reply::{Reply, ReplyGenerator};

/// Timestamp layout of the `activefrom`/`activeuntil` columns, always UTC.
const TIMESTAMP_FORMAT: &str = "%Y-%m-%d %H:%M:%S";

fn format_timestamp(at: DateTime<Utc>) -> String {
    at.format(TIMESTAMP_FORMAT).to_string()
}

/// A mailbox's vacation settings as stored.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct VacationMessage {
    pub email: String,
    pub subject: String,
    pub body: String,
    pub domain: String,
    pub active: bool,
    pub active_from: DateTime<Utc>,
    pub active_until: DateTime<Utc>,
}

/// Subject and body of a vacation message in effect right now. Empty fields
/// mean "keep the default".
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ActiveVacation {
    pub subject: String,
    pub body: String,
}

impl VacationStore {
    /// Insert or replace the vacation settings for `vacation.email`.
    pub async fn set_vacation(&self, vacation: &VacationMessage) -> Result<(), DatabaseError> {
        self.conn()
            .execute(
                "INSERT INTO vacation (email, subject, body, domain, active, activefrom, activeuntil)
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7)
                 ON CONFLICT(email) DO UPDATE SET
                    subject = excluded.subject,
                    body = excluded.body,
                    domain = excluded.domain,
                    active = excluded.active,
                    activefrom = excluded.activefrom,
                    activeuntil = excluded.activeuntil,
                    modified = datetime('now')",
                params![
                    vacation.email.as_str(),
                    vacation.subject.as_str(),
                    vacation.body.as_str(),
                    vacation.domain.as_str(),
                    i64::from(vacation.active),
                    format_timestamp(vacation.active_from),
                    format_timestamp(vacation.active_until),
                ],
            )
            .await
            .map_err(|e| DatabaseError::Query(format!("set_vacation: {e}")))?;
        Ok(())
    }

    /// The vacation message for `email` that is active at `now`, if any.
    pub async fn active_vacation(
        &self,
        email: &str,
        now: DateTime<Utc>,
    ) -> Result<Option<ActiveVacation>, DatabaseError> {
        let now = format_timestamp(now);
        let mut rows = self
            .conn()
            .query(
                "SELECT subject, body FROM vacation
                 WHERE active = 1 AND email = ?1 AND activefrom <= ?2 AND activeuntil >= ?2",
                params![email, now],
            )
            .await
            .map_err(|e| DatabaseError::Query(format!("active_vacation: {e}")))?;

        let Some(row) = rows
            .next()
            .await
            .map_err(|e| DatabaseError::Query(format!("active_vacation: {e}")))?
        else {
            return Ok(None);
        };

        Ok(Some(ActiveVacation {
            subject: row.get::<String>(0).unwrap_or_default(),
            body: row.get::<String>(1).unwrap_or_default(),
        }))
    }
}

#[async_trait]
impl ReplyGenerator for VacationStore {
    async fn generate(
        &self,
        _msg: &InboundMessage,
        _sender: &str,
        recipient: &str,
        mut reply: Reply,
    ) -> Result<Option<Reply>, ReplyError> {
        let Some(vacation) = self.active_vacation(recipient, Utc::now()).await? else {
            debug!(recipient = %recipient, "No active vacation message");
            return Ok(None);
        };

        if !vacation.subject.is_empty() {
            reply.subject = vacation.subject;
        }
        if !vacation.body.is_empty() {
            reply.body = vacation.body;
        }
        Ok(Some(reply))
    }
}

#[cfg(test)]
mod tests {
    use chrono::{Duration, NaiveDateTime};

    use super::*;
    use crate::reply::DEFAULT_BODY;

    fn parse_timestamp(s: &str) -> Option<DateTime<Utc>> {
        NaiveDateTime::parse_from_str(s, TIMESTAMP_FORMAT)
            .ok()
            .map(|ndt| ndt.and_utc())
    }

    fn vacation(email: &str, subject: &str, body: &str) -> VacationMessage {
        let now = Utc::now();
        VacationMessage {
            email: email.to_string(),
            subject: subject.to_string(),
            body: body.to_string(),
            domain: "y.com".to_string(),
            active: true,
            active_from: now - Duration::days(1),
            active_until: now + Duration::days(1),
        }
    }

    fn skeleton() -> Reply {
        let msg = InboundMessage::parse_headers(b"Subject: Lunch\r\n").unwrap();
        Reply::skeleton(&msg, "alice@x.com", "bob@y.com", "autoreply.example").unwrap()
    }

    async fn generate(store: &VacationStore, recipient: &str) -> Option<Reply> {
        let msg = InboundMessage::default();
        store
            .generate(&msg, "alice@x.com", recipient, skeleton())
            .await
            .unwrap()
    }

    // ── Lookup ──────────────────────────────────────────────────────

    #[tokio::test]
    async fn active_window_predicate() {
        let store = VacationStore::new_memory().await.unwrap();
        let v = vacation("bob@y.com", "Away", "Back Monday");
        store.set_vacation(&v).await.unwrap();

        let now = Utc::now();
        assert_eq!(
            store.active_vacation("bob@y.com", now).await.unwrap(),
            Some(ActiveVacation {
                subject: "Away".into(),
                body: "Back Monday".into()
            })
        );
        assert!(store
            .active_vacation("bob@y.com", now + Duration::days(2))
            .await
            .unwrap()
            .is_none());
        assert!(store
            .active_vacation("bob@y.com", now - Duration::days(2))
            .await
            .unwrap()
            .is_none());
        assert!(store.active_vacation("carol@y.com", now).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn window_bounds_are_inclusive() {
        let store = VacationStore::new_memory().await.unwrap();
        let mut v = vacation("bob@y.com", "", "");
        v.active_from = parse_timestamp("2026-01-01 00:00:00").unwrap();
        v.active_until = parse_timestamp("2026-01-31 23:59:59").unwrap();
        store.set_vacation(&v).await.unwrap();

        for at in ["2026-01-01 00:00:00", "2026-01-31 23:59:59"] {
            let at = parse_timestamp(at).unwrap();
            assert!(store.active_vacation("bob@y.com", at).await.unwrap().is_some());
        }
    }

    #[tokio::test]
    async fn inactive_flag_hides_record() {
        let store = VacationStore::new_memory().await.unwrap();
        let mut v = vacation("bob@y.com", "Away", "");
        v.active = false;
        store.set_vacation(&v).await.unwrap();

        assert!(store
            .active_vacation("bob@y.com", Utc::now())
            .await
            .unwrap()
            .is_none());
    }

    #[tokio::test]
    async fn set_vacation_replaces_existing() {
        let store = VacationStore::new_memory().await.unwrap();
        store
            .set_vacation(&vacation("bob@y.com", "First", ""))
            .await
            .unwrap();
        store
            .set_vacation(&vacation("bob@y.com", "Second", ""))
            .await
            .unwrap();

        let active = store
            .active_vacation("bob@y.com", Utc::now())
            .await
            .unwrap()
            .unwrap();
        assert_eq!(active.subject, "Second");
    }

    #[tokio::test]
    async fn persists_in_local_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("vacation.db");

        {
            let store = VacationStore::new_local(&path).await.unwrap();
            store
                .set_vacation(&vacation("bob@y.com", "Away", ""))
                .await
                .unwrap();
        }

        let store = VacationStore::new_local(&path).await.unwrap();
        assert!(store
            .active_vacation("bob@y.com", Utc::now())
            .await
            .unwrap()
            .is_some());
    }

    // ── Generator ───────────────────────────────────────────────────

    #[tokio::test]
    async fn generator_overlays_subject_and_body() {
        let store = VacationStore::new_memory().await.unwrap();
        store
            .set_vacation(&vacation("bob@y.com", "Out until May", "Back in May."))
            .await
            .unwrap();

        let reply = generate(&store, "bob@y.com").await.unwrap();
        assert_eq!(reply.subject, "Out until May");
        assert_eq!(reply.body, "Back in May.");
    }

    #[tokio::test]
    async fn generator_keeps_skeleton_for_empty_fields() {
        let store = VacationStore::new_memory().await.unwrap();
        store
            .set_vacation(&vacation("bob@y.com", "", ""))
            .await
            .unwrap();

        let reply = generate(&store, "bob@y.com").await.unwrap();
        assert_eq!(reply.subject, "Auto: Lunch");
        assert_eq!(reply.body, DEFAULT_BODY);
    }

    #[tokio::test]
    async fn generator_declines_without_record() {
        let store = VacationStore::new_memory().await.unwrap();
        assert!(generate(&store, "bob@y.com").await.is_none());
    }

    #[test]
    fn timestamp_format() {
        let at = parse_timestamp("2026-03-04 05:06:07").unwrap();
        assert_eq!(format_timestamp(at), "2026-03-04 05:06:07");
        assert!(parse_timestamp("2026-03-04T05:06:07Z").is_none());
    }
}
