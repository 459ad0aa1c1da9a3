//! Raw message parsing: header fields and body text extraction.

use mail_parser::{MessageParser, MessagePart, MimeHeaders, PartType};

use crate::types::{EmailAddress, Header};
use crate::{Error, Result};

/// Maximum multipart nesting followed when looking for the body text
const MAX_DEPTH: usize = 10;

/// A message split into header fields and body
#[derive(Debug, Clone)]
pub struct ParsedMessage {
    pub header: Header,
}

impl ParsedMessage {
    /// Parse the header section of a raw message.
    ///
    /// Fails on empty input, stray continuation lines, lines without a colon,
    /// invalid field names, or a header section with no fields.
    pub fn parse(raw: &[u8]) -> Result<Self> {
        if raw.is_empty() {
            return Err(Error::Parse("empty message".to_string()));
        }

        let header_end = find_header_end(raw);
        let text = String::from_utf8_lossy(&raw[..header_end]);

        let mut fields: Vec<(String, String)> = Vec::new();
        for (number, line) in text.lines().enumerate() {
            let line = line.trim_end_matches('\r');
            if line.is_empty() {
                continue;
            }
            if line.starts_with(' ') || line.starts_with('\t') {
                let last = fields.last_mut().ok_or_else(|| {
                    Error::Parse("continuation line before first header field".to_string())
                })?;
                last.1.push(' ');
                last.1.push_str(line.trim());
                continue;
            }
            let (name, value) = line.split_once(':').ok_or_else(|| {
                Error::Parse(format!("malformed header line {}: missing colon", number + 1))
            })?;
            if name.is_empty() || name.contains(char::is_whitespace) {
                return Err(Error::Parse(format!(
                    "malformed header field name on line {}",
                    number + 1
                )));
            }
            fields.push((name.to_string(), value.trim().to_string()));
        }

        if fields.is_empty() {
            return Err(Error::Parse("message has no header fields".to_string()));
        }

        let mut header = Header::new();
        for (name, value) in fields {
            header.append(&name, value);
        }

        Ok(Self { header })
    }

    pub fn subject(&self) -> Option<&str> {
        self.header.get("Subject")
    }

    /// Addresses of the `To` field; empty when absent or unparseable
    pub fn to_addresses(&self) -> Vec<EmailAddress> {
        self.header.addresses("To")
    }

    /// First address of the `From` field
    pub fn from_address(&self) -> Option<EmailAddress> {
        self.header.addresses("From").into_iter().next()
    }
}

/// Offset of the blank line ending the header section
fn find_header_end(data: &[u8]) -> usize {
    (0..data.len())
        .find(|&i| data[i..].starts_with(b"\r\n\r\n") || data[i..].starts_with(b"\n\n"))
        .unwrap_or(data.len())
}

/// Extract the readable body of a raw message.
///
/// `text/plain` roots are decoded as-is; for multipart roots the first
/// non-attachment part is used. Any other content type yields an empty string.
pub fn extract_body(raw: &[u8]) -> String {
    let Some(message) = MessageParser::default().parse(raw) else {
        return String::new();
    };

    let mut part = message.root_part();
    for _ in 0..MAX_DEPTH {
        match &part.body {
            PartType::Text(text) => return text.to_string(),
            PartType::Multipart(children) => {
                let next = children
                    .iter()
                    .filter_map(|id| message.part(*id))
                    .find(|child| !is_attachment(child));
                match next {
                    Some(child) if is_multipart(child) => part = child,
                    Some(child) => return part_text(child),
                    None => return String::new(),
                }
            }
            _ => return String::new(),
        }
    }
    String::new()
}

fn is_attachment(part: &MessagePart<'_>) -> bool {
    part.content_disposition()
        .map(|disposition| disposition.ctype().eq_ignore_ascii_case("attachment"))
        .unwrap_or(false)
}

fn is_multipart(part: &MessagePart<'_>) -> bool {
    matches!(part.body, PartType::Multipart(_))
}

fn part_text(part: &MessagePart<'_>) -> String {
    match &part.body {
        PartType::Text(text) | PartType::Html(text) => text.to_string(),
        _ => String::new(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    const EMAIL: &str = "Date: Tue, 04 Apr 2017 19:02:05 +1000\r\n\
From: from@example.com\r\n\
To: to@example.com\r\n\
Subject: test subject\r\n\
Cc: cc@example.com\r\n\
\r\n\
test message";

    #[test]
    fn test_parse_headers() {
        let parsed = ParsedMessage::parse(EMAIL.as_bytes()).unwrap();
        assert_eq!(parsed.subject(), Some("test subject"));
        assert_eq!(parsed.header.get("cc"), Some("cc@example.com"));
        assert_eq!(
            parsed.to_addresses(),
            vec![EmailAddress::new("to", "example.com")]
        );
        assert_eq!(
            parsed.from_address(),
            Some(EmailAddress::new("from", "example.com"))
        );
    }

    #[test]
    fn test_folded_header() {
        let raw = b"Subject: a long\n\tsubject line\nTo: x@y.com\n\nbody";
        let parsed = ParsedMessage::parse(raw).unwrap();
        assert_eq!(parsed.subject(), Some("a long subject line"));
    }

    #[test]
    fn test_parse_errors() {
        assert!(matches!(ParsedMessage::parse(b""), Err(Error::Parse(_))));
        assert!(matches!(
            ParsedMessage::parse(b"this is not a header\n\nbody"),
            Err(Error::Parse(_))
        ));
        assert!(matches!(
            ParsedMessage::parse(b" folded first\nTo: a@b.c\n\n"),
            Err(Error::Parse(_))
        ));
        assert!(matches!(
            ParsedMessage::parse(b"Bad Name: value\n\n"),
            Err(Error::Parse(_))
        ));
        assert!(matches!(
            ParsedMessage::parse(b"\n\nbody only"),
            Err(Error::Parse(_))
        ));
    }

    #[test]
    fn test_extract_plain_body() {
        assert_eq!(extract_body(EMAIL.as_bytes()), "test message");
    }

    #[test]
    fn test_extract_quoted_printable_body() {
        let raw = b"To: a@b.c\r\n\
Content-Type: text/plain; charset=utf-8\r\n\
Content-Transfer-Encoding: quoted-printable\r\n\
\r\n\
caf=C3=A9 =3D coffee";
        assert_eq!(extract_body(raw), "caf\u{e9} = coffee");
    }

    #[test]
    fn test_extract_multipart_body_skips_attachments() {
        let raw = b"To: a@b.c\r\n\
Content-Type: multipart/mixed; boundary=\"XYZ\"\r\n\
\r\n\
--XYZ\r\n\
Content-Type: application/pdf\r\n\
Content-Disposition: attachment; filename=\"a.pdf\"\r\n\
\r\n\
%PDF\r\n\
--XYZ\r\n\
Content-Type: text/plain\r\n\
\r\n\
hello from multipart\r\n\
--XYZ--\r\n";
        assert_eq!(extract_body(raw).trim_end(), "hello from multipart");
    }

    #[test]
    fn test_extract_other_content_type_is_empty() {
        let raw = b"To: a@b.c\r\nContent-Type: image/png\r\n\r\nPNGDATA";
        assert_eq!(extract_body(raw), "");
    }
}
