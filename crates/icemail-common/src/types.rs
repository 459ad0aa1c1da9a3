//! Common types for icemail

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use uuid::Uuid;

/// Unique identifier for archived messages (UUID v7, ordered by arrival)
pub type MessageId = Uuid;

/// Discriminator stored with every message record
pub const RECORD_TYPE: &str = "message";

/// Email address
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct EmailAddress {
    pub local: String,
    pub domain: String,
}

impl EmailAddress {
    /// Create a new email address
    pub fn new(local: impl Into<String>, domain: impl Into<String>) -> Self {
        Self {
            local: local.into(),
            domain: domain.into(),
        }
    }

    /// Parse an email address from a string, splitting at the last `@`
    pub fn parse(s: &str) -> Option<Self> {
        let (local, domain) = s.trim().rsplit_once('@')?;
        if local.is_empty() || domain.is_empty() || domain.contains(char::is_whitespace) {
            return None;
        }
        Some(Self::new(local, domain))
    }

    /// Parse an address-list header value such as
    /// `"Doe, Jane" <jane@example.com>, bob@example.org`.
    ///
    /// Elements that carry no usable address are skipped.
    pub fn parse_list(value: &str) -> Vec<Self> {
        split_address_list(value)
            .into_iter()
            .filter_map(|element| {
                let element = element.trim();
                let candidate = match (element.rfind('<'), element.rfind('>')) {
                    (Some(start), Some(end)) if start < end => &element[start + 1..end],
                    _ => element.split_whitespace().last().unwrap_or(""),
                };
                Self::parse(candidate)
            })
            .collect()
    }
}

impl std::fmt::Display for EmailAddress {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}@{}", self.local, self.domain)
    }
}

/// Split on top-level commas, ignoring commas inside quotes, comments or angle brackets
fn split_address_list(value: &str) -> Vec<&str> {
    let mut parts = Vec::new();
    let mut in_quotes = false;
    let mut angle_depth = 0usize;
    let mut paren_depth = 0usize;
    let mut escaped = false;
    let mut start = 0;

    for (i, c) in value.char_indices() {
        if escaped {
            escaped = false;
            continue;
        }
        match c {
            '\\' if in_quotes => escaped = true,
            '"' => in_quotes = !in_quotes,
            '<' if !in_quotes => angle_depth += 1,
            '>' if !in_quotes => angle_depth = angle_depth.saturating_sub(1),
            '(' if !in_quotes => paren_depth += 1,
            ')' if !in_quotes => paren_depth = paren_depth.saturating_sub(1),
            ',' if !in_quotes && angle_depth == 0 && paren_depth == 0 => {
                parts.push(&value[start..i]);
                start = i + 1;
            }
            _ => {}
        }
    }
    parts.push(&value[start..]);
    parts
}

/// Message envelope (SMTP level)
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Envelope {
    /// Sender (MAIL FROM), `None` for the null reverse path
    pub from: Option<EmailAddress>,

    /// Recipients (RCPT TO)
    pub to: Vec<EmailAddress>,

    /// Client IP address, for logging only
    pub client_ip: Option<String>,

    /// HELO/EHLO hostname
    pub helo: Option<String>,
}

impl Envelope {
    /// Sender as a string, empty for the null reverse path
    pub fn sender(&self) -> String {
        self.from.as_ref().map(ToString::to_string).unwrap_or_default()
    }

    /// Recipients as plain address strings, in RCPT order
    pub fn recipients(&self) -> Vec<String> {
        self.to.iter().map(ToString::to_string).collect()
    }
}

/// Header fields of a message.
///
/// Keys are canonicalised (`content-type` becomes `Content-Type`) so lookups
/// are case-insensitive. Repeated fields keep their original order.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Header(BTreeMap<String, Vec<String>>);

impl Header {
    pub fn new() -> Self {
        Self::default()
    }

    /// Append a value to a field
    pub fn append(&mut self, name: &str, value: impl Into<String>) {
        self.0
            .entry(canonical_name(name))
            .or_default()
            .push(value.into());
    }

    /// Replace all values of a field
    pub fn set(&mut self, name: &str, value: impl Into<String>) {
        self.0.insert(canonical_name(name), vec![value.into()]);
    }

    /// First value of a field
    pub fn get(&self, name: &str) -> Option<&str> {
        self.0
            .get(&canonical_name(name))
            .and_then(|values| values.first())
            .map(String::as_str)
    }

    /// All values of a field
    pub fn get_all(&self, name: &str) -> &[String] {
        self.0
            .get(&canonical_name(name))
            .map(Vec::as_slice)
            .unwrap_or(&[])
    }

    pub fn contains(&self, name: &str) -> bool {
        self.0.contains_key(&canonical_name(name))
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    /// Iterate fields in name order
    pub fn iter(&self) -> impl Iterator<Item = (&str, &[String])> {
        self.0.iter().map(|(k, v)| (k.as_str(), v.as_slice()))
    }

    /// Addresses listed in a field, across all of its values
    pub fn addresses(&self, name: &str) -> Vec<EmailAddress> {
        self.get_all(name)
            .iter()
            .flat_map(|value| EmailAddress::parse_list(value))
            .collect()
    }

    /// Parsed `Date` field
    pub fn date(&self) -> Option<DateTime<Utc>> {
        self.get("Date").and_then(parse_date)
    }
}

/// Canonical form of a header field name: `x-mailer` becomes `X-Mailer`
pub fn canonical_name(name: &str) -> String {
    let mut out = String::with_capacity(name.len());
    let mut upper = true;
    for c in name.trim().chars() {
        if upper {
            out.extend(c.to_uppercase());
        } else {
            out.extend(c.to_lowercase());
        }
        upper = c == '-';
    }
    out
}

/// Parse an RFC 2822 date as found in `Date` headers
pub fn parse_date(value: &str) -> Option<DateTime<Utc>> {
    DateTime::parse_from_rfc2822(value.trim())
        .ok()
        .map(|dt| dt.with_timezone(&Utc))
}

/// Canonical representation used when a `Date` field has to be synthesised
pub fn format_date(date: DateTime<Utc>) -> String {
    date.to_rfc2822()
}

/// The unit of storage and search
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MessageRecord {
    /// Primary key, assigned at intake
    pub id: MessageId,

    /// Always [`RECORD_TYPE`]
    #[serde(rename = "type")]
    pub record_type: String,

    /// Parsed header fields
    pub header: Header,

    /// The complete original message, verbatim
    #[serde(with = "raw_base64")]
    pub raw_data: Vec<u8>,

    /// Envelope recipients
    pub recipients: Vec<String>,

    /// Set once forwarding succeeded
    pub delivered_at: Option<DateTime<Utc>>,
}

impl MessageRecord {
    /// Create an undelivered record with a fresh time-ordered id
    pub fn new(header: Header, raw_data: Vec<u8>, recipients: Vec<String>) -> Self {
        Self {
            id: Uuid::now_v7(),
            record_type: RECORD_TYPE.to_string(),
            header,
            raw_data,
            recipients,
            delivered_at: None,
        }
    }

    pub fn is_delivered(&self) -> bool {
        self.delivered_at.is_some()
    }

    pub fn subject(&self) -> Option<&str> {
        self.header.get("Subject")
    }

    /// Arrival time encoded in the id, if the id is time-ordered
    pub fn arrived_at(&self) -> Option<DateTime<Utc>> {
        let (secs, nanos) = self.id.get_timestamp()?.to_unix();
        DateTime::from_timestamp(i64::try_from(secs).ok()?, nanos)
    }

    /// Date used for sorting and range filters: the `Date` field, else arrival time
    pub fn date(&self) -> DateTime<Utc> {
        self.header
            .date()
            .or_else(|| self.arrived_at())
            .unwrap_or(DateTime::UNIX_EPOCH)
    }

    /// Copy of this record marked as delivered at `at`
    pub fn delivered(&self, at: DateTime<Utc>) -> Self {
        Self {
            delivered_at: Some(at),
            ..self.clone()
        }
    }
}

/// Serialize raw message bytes as base64 so records survive JSON stores
pub mod raw_base64 {
    use base64::engine::general_purpose::STANDARD;
    use base64::Engine;
    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S: Serializer>(bytes: &[u8], serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(&STANDARD.encode(bytes))
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Vec<u8>, D::Error> {
        let encoded = String::deserialize(deserializer)?;
        STANDARD.decode(encoded).map_err(serde::de::Error::custom)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;
    use pretty_assertions::assert_eq;

    #[test]
    fn test_parse_email_address() {
        assert_eq!(
            EmailAddress::parse("user@example.com"),
            Some(EmailAddress::new("user", "example.com"))
        );
        assert_eq!(
            EmailAddress::parse("\"a@b\"@example.com").map(|a| a.domain),
            Some("example.com".to_string())
        );
        assert_eq!(EmailAddress::parse("no-at-sign"), None);
        assert_eq!(EmailAddress::parse("@example.com"), None);
    }

    #[test]
    fn test_parse_address_list() {
        let list = EmailAddress::parse_list(
            "\"Doe, Jane\" <jane@example.com>, bob@example.org, Undisclosed recipients:;",
        );
        assert_eq!(
            list,
            vec![
                EmailAddress::new("jane", "example.com"),
                EmailAddress::new("bob", "example.org"),
            ]
        );
    }

    #[test]
    fn test_header_is_case_insensitive() {
        let mut header = Header::new();
        header.append("content-TYPE", "text/plain");
        header.append("Received", "first");
        header.append("received", "second");

        assert_eq!(header.get("Content-Type"), Some("text/plain"));
        assert_eq!(header.get_all("RECEIVED"), &["first", "second"]);
        assert!(header.contains("content-type"));
        assert!(!header.contains("Date"));
    }

    #[test]
    fn test_canonical_name() {
        assert_eq!(canonical_name("message-id"), "Message-Id");
        assert_eq!(canonical_name("X-MAILER"), "X-Mailer");
        assert_eq!(canonical_name("subject"), "Subject");
    }

    #[test]
    fn test_synthesised_date_parses_back() {
        let now = Utc.with_ymd_and_hms(2017, 4, 4, 9, 2, 5).unwrap();
        let formatted = format_date(now);
        assert_eq!(parse_date(&formatted), Some(now));
    }

    #[test]
    fn test_record_date_falls_back_to_arrival() {
        let record = MessageRecord::new(Header::new(), b"x".to_vec(), vec!["a@b.c".into()]);
        let arrived = record.arrived_at().unwrap();
        assert_eq!(record.date(), arrived);
        assert!((Utc::now() - arrived).num_seconds().abs() < 5);
    }

    #[test]
    fn test_record_serialization() {
        let mut header = Header::new();
        header.set("Subject", "hello");
        let record = MessageRecord::new(header, vec![0xff, b'a'], vec!["a@b.c".into()]);

        let json = serde_json::to_value(&record).unwrap();
        assert_eq!(json["type"], "message");
        assert_eq!(json["header"]["Subject"][0], "hello");
        assert_eq!(json["raw_data"], "/2E=");

        let back: MessageRecord = serde_json::from_value(json).unwrap();
        assert_eq!(back, record);
    }
}
