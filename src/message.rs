//! Inbound message headers.
//!
//! Only the header block of an inbound message is kept. The body is read to
//! the end and thrown away so the transport can finish the transaction, but
//! it is never inspected or buffered.

use std::fmt;

use mail_parser::{Addr, Address, HeaderValue, MessageParser};
use tokio::io::{AsyncBufReadExt, AsyncRead, BufReader};

use crate::error::MessageError;

/// Upper bound on the header block we are willing to hold in memory.
pub const MAX_HEADER_BYTES: usize = 256 * 1024;

/// A parsed mailbox from an address-list header.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MailAddress {
    /// Display name, if the header carried one.
    pub name: Option<String>,
    /// The `local@domain` part.
    pub address: String,
}

impl MailAddress {
    pub fn new(name: Option<&str>, address: &str) -> Self {
        Self {
            name: name.map(str::to_string),
            address: address.to_string(),
        }
    }
}

impl fmt::Display for MailAddress {
    /// `Name <local@domain>`, quoting the name when it is not plain atext.
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.name.as_deref() {
            Some(name) if !name.is_empty() => {
                if name.chars().all(is_phrase_char) {
                    write!(f, "{name} <{}>", self.address)
                } else {
                    write!(f, "\"")?;
                    for ch in name.chars() {
                        if ch == '"' || ch == '\\' {
                            write!(f, "\\")?;
                        }
                        write!(f, "{ch}")?;
                    }
                    write!(f, "\" <{}>", self.address)
                }
            }
            _ => write!(f, "{}", self.address),
        }
    }
}

fn is_phrase_char(ch: char) -> bool {
    ch.is_ascii_alphanumeric() || ch == ' ' || "!#$%&'*+-/=?^_`{|}~".contains(ch)
}

/// One header field in original order.
#[derive(Debug, Clone)]
struct HeaderField {
    name: String,
    /// Unfolded, trimmed value.
    value: String,
    /// Parsed mailboxes, for fields that carry an address list.
    addresses: Option<Vec<MailAddress>>,
}

/// Header view of an inbound message.
///
/// Lookups are case-insensitive on the field name and, as with most mail
/// libraries, return the first occurrence.
#[derive(Debug, Clone, Default)]
pub struct InboundMessage {
    headers: Vec<HeaderField>,
}

impl InboundMessage {
    /// Read a message from `reader`, keeping the header block and draining
    /// the body. The reader is always consumed to EOF, even when the header
    /// turns out to be unusable.
    pub async fn read_from<R>(reader: R) -> Result<Self, MessageError>
    where
        R: AsyncRead + Unpin,
    {
        let mut reader = BufReader::new(reader);
        let mut block = Vec::new();
        let mut line = Vec::new();
        let mut oversized = false;

        loop {
            line.clear();
            if reader.read_until(b'\n', &mut line).await? == 0 {
                break;
            }
            if line == b"\r\n" || line == b"\n" {
                break;
            }
            if block.len() + line.len() > MAX_HEADER_BYTES {
                oversized = true;
                break;
            }
            block.extend_from_slice(&line);
        }

        tokio::io::copy(&mut reader, &mut tokio::io::sink()).await?;

        if oversized {
            return Err(MessageError::HeadersTooLarge {
                limit: MAX_HEADER_BYTES,
            });
        }

        Self::parse_headers(&block)
    }

    /// Parse a raw header block (without the empty separator line).
    pub fn parse_headers(raw: &[u8]) -> Result<Self, MessageError> {
        validate_header_lines(raw)?;
        if raw.is_empty() {
            return Ok(Self::default());
        }

        let parsed = MessageParser::new()
            .parse_headers(raw)
            .ok_or_else(|| MessageError::Malformed("unparseable header block".into()))?;

        let headers = parsed
            .headers()
            .iter()
            .map(|header| {
                let start = header.offset_start as usize;
                let end = (header.offset_end as usize).min(raw.len());
                HeaderField {
                    name: header.name().to_string(),
                    value: unfold(raw.get(start..end).unwrap_or_default()),
                    addresses: match &header.value {
                        HeaderValue::Address(addr) => Some(collect_addresses(addr)),
                        _ => None,
                    },
                }
            })
            .collect();

        Ok(Self { headers })
    }

    /// First value of the named header, or `""` when absent.
    pub fn header(&self, name: &str) -> &str {
        self.field(name).map_or("", |field| field.value.as_str())
    }

    /// Mailboxes in the first header with this name.
    ///
    /// `None` when the header is absent or does not parse as an address list.
    pub fn address_list(&self, name: &str) -> Option<&[MailAddress]> {
        self.field(name)?.addresses.as_deref()
    }

    fn field(&self, name: &str) -> Option<&HeaderField> {
        self.headers
            .iter()
            .find(|field| field.name.eq_ignore_ascii_case(name))
    }
}

/// Every line must be `name: value` or a continuation of the previous field.
fn validate_header_lines(raw: &[u8]) -> Result<(), MessageError> {
    for (idx, line) in raw.split(|&b| b == b'\n').enumerate() {
        let line = line.strip_suffix(b"\r").unwrap_or(line);
        if line.is_empty() {
            continue;
        }
        if line[0] == b' ' || line[0] == b'\t' {
            if idx == 0 {
                return Err(MessageError::Malformed(
                    "continuation before first header field".into(),
                ));
            }
            continue;
        }
        let Some(colon) = line.iter().position(|&b| b == b':') else {
            return Err(MessageError::Malformed(format!(
                "line {} has no field name",
                idx + 1
            )));
        };
        let name = &line[..colon];
        if name.is_empty() || name.iter().any(|b| !(33..=126).contains(b)) {
            return Err(MessageError::Malformed(format!(
                "invalid field name on line {}",
                idx + 1
            )));
        }
    }
    Ok(())
}

/// Join continuation lines, collapsing each fold to a single space.
fn unfold(raw: &[u8]) -> String {
    let text = String::from_utf8_lossy(raw);
    let mut value = String::with_capacity(text.len());
    for line in text.split(['\r', '\n']).map(str::trim) {
        if line.is_empty() {
            continue;
        }
        if !value.is_empty() {
            value.push(' ');
        }
        value.push_str(line);
    }
    value
}

fn collect_addresses(addr: &Address<'_>) -> Vec<MailAddress> {
    match addr {
        Address::List(addrs) => addrs.iter().filter_map(to_mail_address).collect(),
        Address::Group(groups) => groups
            .iter()
            .flat_map(|g| g.addresses.iter().filter_map(to_mail_address))
            .collect(),
    }
}

fn to_mail_address(addr: &Addr<'_>) -> Option<MailAddress> {
    addr.address.as_ref().map(|address| MailAddress {
        name: addr.name.as_ref().map(|n| n.to_string()),
        address: address.to_string(),
    })
}
