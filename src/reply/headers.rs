//! Loop-suppression headers stamped on every generated reply.

use lettre::message::header::{Header, HeaderName, HeaderValue};

use crate::policy::{
    AUTO_SUBMITTED, AUTO_SUBMITTED_AUTO_REPLIED, X_AUTO_RESPONSE_SUPPRESS,
    X_AUTO_RESPONSE_SUPPRESS_ALL,
};

type BoxError = Box<dyn std::error::Error + Send + Sync>;

/// `Auto-Submitted` (RFC 3834).
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AutoSubmitted(String);

impl AutoSubmitted {
    pub fn auto_replied() -> Self {
        Self(AUTO_SUBMITTED_AUTO_REPLIED.to_string())
    }
}

impl Header for AutoSubmitted {
    fn name() -> HeaderName {
        HeaderName::new_from_ascii_str(AUTO_SUBMITTED)
    }

    fn parse(s: &str) -> Result<Self, BoxError> {
        Ok(Self(s.trim().to_string()))
    }

    fn display(&self) -> HeaderValue {
        HeaderValue::new(Self::name(), self.0.clone())
    }
}

/// Microsoft's `X-Auto-Response-Suppress`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct XAutoResponseSuppress(String);

impl XAutoResponseSuppress {
    pub fn all() -> Self {
        Self(X_AUTO_RESPONSE_SUPPRESS_ALL.to_string())
    }
}

impl Header for XAutoResponseSuppress {
    fn name() -> HeaderName {
        HeaderName::new_from_ascii_str(X_AUTO_RESPONSE_SUPPRESS)
    }

    fn parse(s: &str) -> Result<Self, BoxError> {
        Ok(Self(s.trim().to_string()))
    }

    fn display(&self) -> HeaderValue {
        HeaderValue::new(Self::name(), self.0.clone())
    }
}
