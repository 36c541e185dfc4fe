//! Loop-prevention checks run before any auto-reply is considered.
//!
//! Each check is an independent veto over the parsed header block or the
//! envelope sender. Matching is deliberately case-sensitive on header values
//! and addresses: mailbox local parts are not safely case-insensitive.

use std::fmt;
use std::sync::LazyLock;

use regex::Regex;

use crate::message::InboundMessage;

pub const AUTO_SUBMITTED: &str = "Auto-Submitted";
pub const AUTO_SUBMITTED_NO: &str = "no";
pub const AUTO_SUBMITTED_AUTO_REPLIED: &str = "auto-replied";
pub const X_AUTO_RESPONSE_SUPPRESS: &str = "X-Auto-Response-Suppress";
pub const X_AUTO_RESPONSE_SUPPRESS_ALL: &str = "All";
pub const X_AUTO_RESPONSE_SUPPRESS_OOF: &str = "OOF";

/// Headers whose presence marks mailing-list traffic.
pub const LIST_HEADERS: &[&str] = &[
    "List-Help",
    "List-Unsubscribe",
    "List-Subscribe",
    "List-Post",
    "List-Owner",
    "List-Archive",
];

/// Headers that can name the mailbox we are replying for.
pub const RECIPIENT_HEADERS: &[&str] = &["To", "Cc", "Bcc", "Resent-To", "Resent-Cc", "Resent-Bcc"];

/// Senders that are never answered: list owners, service mailboxes, bounces.
static DENIED_SENDER: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"(^owner-|-service|^MAILER-DAEMON)@").expect("denied sender pattern is valid")
});

/// Why no reply was sent. None of these is an error.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SkipReason {
    AutoSubmitted,
    SenderNotPermitted,
    MailingList,
    NotAddressedTo,
    RateLimited,
    NoActiveVacation,
}

impl SkipReason {
    pub fn label(&self) -> &'static str {
        match self {
            Self::AutoSubmitted => "auto-submitted",
            Self::SenderNotPermitted => "sender not permitted",
            Self::MailingList => "mailing list",
            Self::NotAddressedTo => "not addressed to us",
            Self::RateLimited => "rate-limited",
            Self::NoActiveVacation => "empty response from replygenerator",
        }
    }
}

impl fmt::Display for SkipReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.label())
    }
}

/// RFC 3834 `Auto-Submitted` other than `no`, or an Exchange-style
/// suppression request for all or out-of-office responses.
pub fn is_auto_submitted(msg: &InboundMessage) -> bool {
    let auto_submitted = msg.header(AUTO_SUBMITTED);
    if !auto_submitted.is_empty() && auto_submitted != AUTO_SUBMITTED_NO {
        return true;
    }

    matches!(
        msg.header(X_AUTO_RESPONSE_SUPPRESS),
        X_AUTO_RESPONSE_SUPPRESS_ALL | X_AUTO_RESPONSE_SUPPRESS_OOF
    )
}

/// Whether an envelope sender may receive an automatic reply at all.
pub fn is_permitted_sender(from: &str) -> bool {
    !from.is_empty() && !DENIED_SENDER.is_match(from)
}

/// False for anything that looks like it came through a mailing list.
pub fn is_response_appropriate(msg: &InboundMessage) -> bool {
    LIST_HEADERS
        .iter()
        .all(|header| msg.header(header).is_empty())
}

/// Whether `rcpt` is named in any of the recipient headers. Headers that do
/// not parse as address lists are ignored.
pub fn is_message_addressed_to(msg: &InboundMessage, rcpt: &str) -> bool {
    RECIPIENT_HEADERS
        .iter()
        .filter_map(|header| msg.address_list(header))
        .flatten()
        .any(|addr| addr.address == rcpt)
}

/// Recover the formatted form (display name included) of `address` from the
/// first of `fields` whose first mailbox is exactly `address`. Falls back to
/// `address` itself.
pub fn extract_address(msg: &InboundMessage, address: &str, fields: &[&str]) -> String {
    fields
        .iter()
        .filter_map(|field| msg.address_list(field)?.first())
        .find(|addr| addr.address == address)
        .map_or_else(|| address.to_string(), |addr| addr.to_string())
}

/// The checks shared by every recipient of one message, in veto order.
pub fn message_veto(msg: &InboundMessage, sender: &str) -> Option<SkipReason> {
    if is_auto_submitted(msg) {
        return Some(SkipReason::AutoSubmitted);
    }
    if !is_permitted_sender(sender) {
        return Some(SkipReason::SenderNotPermitted);
    }
    if !is_response_appropriate(msg) {
        return Some(SkipReason::MailingList);
    }
    None
}
