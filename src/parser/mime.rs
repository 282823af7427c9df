//! MIME message decoding: sender, subject, date, plain-text body and attachments.

use chrono::NaiveDate;
use mail_parser::{MessageParser, MessagePart, MimeHeaders, PartType};
use tracing::{debug, warn};

use crate::error::{RegistryError, Result};
use crate::model::address::EmailAddress;
use crate::model::message::{AttachmentPart, DecodedMessage};
use crate::parser::header;

/// Longest attachment display name kept.
const MAX_FILENAME_LEN: usize = 255;

/// Applicant stored when the message has no `From` header.
pub const UNKNOWN_SENDER: &str = "Unknown";

/// Subject stored when the message has no `Subject` header.
pub const NO_SUBJECT: &str = "No Subject";

/// Decode a raw RFC 5322 message, using today's local date when the `Date`
/// header is missing or unparseable.
pub fn decode(raw_message: &[u8]) -> Result<DecodedMessage> {
    decode_with_fallback(raw_message, chrono::Local::now().date_naive())
}

/// Decode a raw RFC 5322 message.
///
/// Only an empty or header-less message is an error. Header, date, body and
/// attachment problems all degrade: lossy text, the fallback date, an empty
/// body, or a skipped attachment.
pub fn decode_with_fallback(
    raw_message: &[u8],
    fallback_date: NaiveDate,
) -> Result<DecodedMessage> {
    if raw_message.iter().all(u8::is_ascii_whitespace) {
        return Err(RegistryError::Parse("empty message".into()));
    }

    let (header_bytes, _) = header::split_header_block(raw_message);
    let headers = header::unfold_headers(&header::decode_header_bytes(header_bytes));
    if headers.is_empty() {
        return Err(RegistryError::Parse("message has no header block".into()));
    }

    let msg = MessageParser::default()
        .parse(raw_message)
        .ok_or_else(|| RegistryError::Parse("MIME structure could not be parsed".into()))?;

    let sender = header::get_header(&headers, "from")
        .map(EmailAddress::parse)
        .unwrap_or_else(|| EmailAddress::parse(""));
    let applicant = match sender.applicant() {
        "" => UNKNOWN_SENDER.to_string(),
        name => name.to_string(),
    };

    let subject = header::get_header(&headers, "subject")
        .map(header::decode_encoded_words)
        .map(|s| s.trim().to_string())
        .filter(|s| !s.is_empty())
        .unwrap_or_else(|| NO_SUBJECT.to_string());

    let parsed_date = header::get_header(&headers, "date").and_then(header::received_date);
    if parsed_date.is_none() {
        warn!(
            applicant = %applicant,
            fallback = %fallback_date,
            "Missing or unparseable Date header, using processing date"
        );
    }

    let body = extract_body(&msg.parts);

    let mut attachments = Vec::new();
    let mut skipped_attachments = 0;
    for (idx, part) in msg.parts.iter().enumerate() {
        match extract_attachment(part) {
            Ok(Some(att)) => attachments.push(att),
            Ok(None) => {}
            Err(e) => {
                skipped_attachments += 1;
                warn!(
                    part = idx,
                    applicant = %applicant,
                    error = %e,
                    "Skipping undecodable attachment"
                );
            }
        }
    }

    debug!(
        applicant = %applicant,
        body_chars = body.chars().count(),
        attachments = attachments.len(),
        "Decoded message"
    );

    Ok(DecodedMessage {
        sender,
        applicant,
        subject,
        date: parsed_date.unwrap_or(fallback_date),
        date_is_fallback: parsed_date.is_none(),
        body,
        attachments,
        skipped_attachments,
    })
}

/// Pick the body text.
///
/// A single-part message contributes its only payload unless that payload is
/// itself an attachment. A multipart message contributes the first
/// `text/plain` leaf in depth-first order that is not itself an attachment;
/// without one the body is empty.
fn extract_body(parts: &[MessagePart<'_>]) -> String {
    let Some(root) = parts.first() else {
        return String::new();
    };

    if !matches!(root.body, PartType::Multipart(_)) {
        if is_attachment(root) {
            return String::new();
        }
        return String::from_utf8_lossy(root.contents()).into_owned();
    }

    parts
        .iter()
        .skip(1)
        .find(|part| is_plain_text(part) && !is_attachment(part))
        .map(|part| String::from_utf8_lossy(part.contents()).into_owned())
        .unwrap_or_default()
}

fn is_plain_text(part: &MessagePart<'_>) -> bool {
    match part.content_type() {
        Some(ct) => {
            ct.ctype().eq_ignore_ascii_case("text")
                && ct
                    .subtype()
                    .map(|s| s.eq_ignore_ascii_case("plain"))
                    .unwrap_or(false)
        }
        // RFC 2045 default content type
        None => matches!(part.body, PartType::Text(_)),
    }
}

fn is_attachment(part: &MessagePart<'_>) -> bool {
    part.content_disposition()
        .map(|d| d.ctype().eq_ignore_ascii_case("attachment"))
        .unwrap_or(false)
}

/// Turn one MIME part into an attachment.
///
/// `Ok(None)` for parts that are not attachments: containers, parts without
/// an `attachment` disposition, and parts without a filename.
fn extract_attachment(part: &MessagePart<'_>) -> Result<Option<AttachmentPart>> {
    if matches!(part.body, PartType::Multipart(_)) || !is_attachment(part) {
        return Ok(None);
    }

    let Some(raw_name) = part.attachment_name() else {
        return Ok(None);
    };

    let decoded = header::decode_encoded_words(raw_name);
    let filename = header::sanitize_filename(&decoded, MAX_FILENAME_LEN).ok_or_else(|| {
        RegistryError::Parse(format!("attachment name {raw_name:?} is not a usable filename"))
    })?;

    if part.is_encoding_problem {
        return Err(RegistryError::Parse(format!(
            "transfer decoding failed for attachment {filename:?}"
        )));
    }

    Ok(Some(AttachmentPart {
        filename,
        content: part.contents().to_vec(),
    }))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn fallback() -> NaiveDate {
        NaiveDate::from_ymd_opt(2030, 6, 1).unwrap()
    }

    #[test]
    fn test_single_part_message() {
        let raw = b"From: Alice <alice@example.com>\r\n\
Subject: Hello\r\n\
Date: Mon, 08 Jan 2024 10:00:00 +0000\r\n\
\r\n\
Please register my letter.\r\n";
        let msg = decode_with_fallback(raw, fallback()).unwrap();
        assert_eq!(msg.applicant, "Alice");
        assert_eq!(msg.sender.address, "alice@example.com");
        assert_eq!(msg.subject, "Hello");
        assert_eq!(msg.date, NaiveDate::from_ymd_opt(2024, 1, 8).unwrap());
        assert!(!msg.date_is_fallback);
        assert!(msg.body.starts_with("Please register my letter."));
        assert!(msg.attachments.is_empty());
    }

    #[test]
    fn test_missing_headers_get_defaults() {
        let raw = b"X-Mailer: test\n\nbody\n";
        let msg = decode_with_fallback(raw, fallback()).unwrap();
        assert_eq!(msg.applicant, UNKNOWN_SENDER);
        assert_eq!(msg.subject, NO_SUBJECT);
        assert_eq!(msg.date, fallback());
        assert!(msg.date_is_fallback);
    }

    #[test]
    fn test_bad_date_uses_fallback() {
        let raw = b"From: a@b.com\nDate: the day after tomorrow\n\nbody\n";
        let msg = decode_with_fallback(raw, fallback()).unwrap();
        assert_eq!(msg.date, fallback());
        assert!(msg.date_is_fallback);
    }

    #[test]
    fn test_bare_address_is_applicant() {
        let raw = b"From: plain@example.com\nSubject: x\n\nbody\n";
        let msg = decode_with_fallback(raw, fallback()).unwrap();
        assert_eq!(msg.applicant, "plain@example.com");
    }

    #[test]
    fn test_empty_message_is_error() {
        assert!(matches!(
            decode_with_fallback(b"", fallback()),
            Err(RegistryError::Parse(_))
        ));
        assert!(matches!(
            decode_with_fallback(b"\r\n\r\n", fallback()),
            Err(RegistryError::Parse(_))
        ));
    }

    #[test]
    fn test_invalid_utf8_body_is_lossy() {
        let raw = b"From: a@b.com\nContent-Type: text/plain; charset=utf-8\n\nok \xff\xfe end\n";
        let msg = decode_with_fallback(raw, fallback()).unwrap();
        assert!(msg.body.starts_with("ok "));
        assert!(msg.body.contains("end"));
    }

    #[test]
    fn test_multipart_without_text_plain_has_empty_body() {
        let raw = b"From: a@b.com\n\
Content-Type: multipart/alternative; boundary=\"b1\"\n\
\n\
--b1\n\
Content-Type: text/html\n\
\n\
<p>Only HTML</p>\n\
--b1--\n";
        let msg = decode_with_fallback(raw, fallback()).unwrap();
        assert_eq!(msg.body, "");
    }

    #[test]
    fn test_attachment_without_disposition_is_ignored() {
        let raw = b"From: a@b.com\n\
Content-Type: multipart/mixed; boundary=\"b1\"\n\
\n\
--b1\n\
Content-Type: text/plain\n\
\n\
Body text\n\
--b1\n\
Content-Type: image/png; name=\"logo.png\"\n\
Content-Transfer-Encoding: base64\n\
\n\
iVBORw0KGgo=\n\
--b1--\n";
        let msg = decode_with_fallback(raw, fallback()).unwrap();
        assert!(msg.body.starts_with("Body text"));
        assert!(msg.attachments.is_empty());
        assert_eq!(msg.skipped_attachments, 0);
    }

    #[test]
    fn test_single_part_attachment_has_empty_body() {
        let raw = b"From: scanner@example.com\n\
Content-Type: application/pdf\n\
Content-Disposition: attachment; filename=\"scan.pdf\"\n\
Content-Transfer-Encoding: base64\n\
\n\
JVBERi0xLjQ=\n";
        let msg = decode_with_fallback(raw, fallback()).unwrap();
        assert_eq!(msg.body, "");
        assert_eq!(msg.attachments.len(), 1);
        assert_eq!(msg.attachments[0].filename, "scan.pdf");
        assert_eq!(msg.attachments[0].content, b"%PDF-1.4");
    }
}
