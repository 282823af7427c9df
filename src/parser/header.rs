//! RFC 5322 header parsing: folding, encoded-words (RFC 2047), and date parsing.

use chrono::{DateTime, FixedOffset, NaiveDate, NaiveDateTime, TimeZone, Utc};
use tracing::warn;

/// Split raw message bytes at the blank line ending the header block.
///
/// Returns `(headers, body)`. A message without a blank line is all headers.
pub fn split_header_block(data: &[u8]) -> (&[u8], &[u8]) {
    match find_header_end(data) {
        Some((end, sep_len)) => (&data[..end], &data[end + sep_len..]),
        None => (data, &[]),
    }
}

/// Find the byte offset where headers end and the length of the separator.
fn find_header_end(data: &[u8]) -> Option<(usize, usize)> {
    for i in 0..data.len().saturating_sub(1) {
        if data[i] == b'\n' && data[i + 1] == b'\n' {
            return Some((i, 2));
        }
        if i + 3 < data.len()
            && data[i] == b'\r'
            && data[i + 1] == b'\n'
            && data[i + 2] == b'\r'
            && data[i + 3] == b'\n'
        {
            return Some((i, 4));
        }
    }
    None
}

/// Decode raw header bytes to a string.
///
/// Tries UTF-8 first, then falls back to Windows-1252 (which accepts every byte).
pub fn decode_header_bytes(bytes: &[u8]) -> String {
    let bytes = if bytes.starts_with(&[0xEF, 0xBB, 0xBF]) {
        &bytes[3..]
    } else {
        bytes
    };

    match std::str::from_utf8(bytes) {
        Ok(s) => s.to_string(),
        Err(_) => {
            let (decoded, _, _) = encoding_rs::WINDOWS_1252.decode(bytes);
            decoded.into_owned()
        }
    }
}

/// Unfold headers: join continuation lines (starting with space or tab) with the previous header.
///
/// Returns a list of `(lowercase_name, raw_value)` pairs.
pub fn unfold_headers(text: &str) -> Vec<(String, String)> {
    let mut result: Vec<(String, String)> = Vec::new();

    for line in text.lines() {
        if line.starts_with(' ') || line.starts_with('\t') {
            if let Some(last) = result.last_mut() {
                last.1.push(' ');
                last.1.push_str(line.trim());
            }
        } else if let Some(colon_pos) = line.find(':') {
            let name = line[..colon_pos].trim().to_lowercase();
            let value = line[colon_pos + 1..].trim().to_string();
            result.push((name, value));
        }
    }

    result
}

/// Get the first value for a header name (case-insensitive).
pub fn get_header<'a>(headers: &'a [(String, String)], name: &str) -> Option<&'a str> {
    headers
        .iter()
        .find(|(k, _)| k.eq_ignore_ascii_case(name))
        .map(|(_, v)| v.as_str())
}

/// Decode RFC 2047 encoded-words in a header value.
///
/// Example: `"=?UTF-8?B?SG9sYQ==?= =?UTF-8?B?IG11bmRv?="` → `"Hola mundo"`
///
/// Never fails: malformed tokens are kept verbatim, unknown charsets and
/// invalid byte sequences are decoded lossily.
pub fn decode_encoded_words(input: &str) -> String {
    let mut result = String::with_capacity(input.len());
    let mut remaining = input;
    let mut last_was_encoded = false;

    while let Some(start) = remaining.find("=?") {
        let before = &remaining[..start];
        // Whitespace between two adjacent encoded words is dropped (RFC 2047 §6.2)
        if !last_was_encoded || !before.trim().is_empty() {
            result.push_str(before);
        }

        let after_start = &remaining[start + 2..];

        if let Some(decoded) = try_decode_one_word(after_start) {
            result.push_str(&decoded.text);
            remaining = &remaining[start + 2 + decoded.consumed..];
            last_was_encoded = true;
        } else {
            result.push_str("=?");
            remaining = after_start;
            last_was_encoded = false;
        }
    }

    result.push_str(remaining);
    result
}

struct DecodedWord {
    text: String,
    consumed: usize, // bytes consumed after the initial "=?"
}

fn try_decode_one_word(s: &str) -> Option<DecodedWord> {
    // charset?encoding?encoded_text?=
    let first_q = s.find('?')?;
    let charset = &s[..first_q];

    let rest = &s[first_q + 1..];
    let second_q = rest.find('?')?;
    let encoding = &rest[..second_q];

    let rest2 = &rest[second_q + 1..];
    let end = rest2.find("?=")?;
    let encoded_text = &rest2[..end];

    // An encoded word never spans whitespace
    if charset.contains(char::is_whitespace) || encoded_text.contains(char::is_whitespace) {
        return None;
    }

    let total_consumed = first_q + 1 + second_q + 1 + end + 2;

    let bytes = match encoding.to_uppercase().as_str() {
        "B" => {
            use std::io::Read;
            let mut decoder = base64_decode_reader(encoded_text.as_bytes());
            let mut buf = Vec::new();
            decoder.read_to_end(&mut buf).ok()?;
            buf
        }
        "Q" => decode_q_encoding(encoded_text),
        _ => return None,
    };

    // RFC 2231 language suffix: "UTF-8*ru"
    let charset = charset.split('*').next().unwrap_or(charset);
    let text = decode_charset(charset, &bytes);

    Some(DecodedWord {
        text,
        consumed: total_consumed,
    })
}

/// Minimal base64 decoder (reads from a byte slice).
fn base64_decode_reader(input: &[u8]) -> impl std::io::Read + '_ {
    struct Base64Reader<'a> {
        input: &'a [u8],
        pos: usize,
        buf: [u8; 3],
        buf_len: usize,
        buf_pos: usize,
    }

    impl std::io::Read for Base64Reader<'_> {
        fn read(&mut self, out: &mut [u8]) -> std::io::Result<usize> {
            let mut written = 0;
            while written < out.len() {
                if self.buf_pos < self.buf_len {
                    out[written] = self.buf[self.buf_pos];
                    self.buf_pos += 1;
                    written += 1;
                    continue;
                }
                let mut quad = [0u8; 4];
                let mut qi = 0;
                while qi < 4 {
                    if self.pos >= self.input.len() {
                        if qi == 0 {
                            return Ok(written);
                        }
                        while qi < 4 {
                            quad[qi] = b'=';
                            qi += 1;
                        }
                        break;
                    }
                    let b = self.input[self.pos];
                    self.pos += 1;
                    if b.is_ascii_whitespace() {
                        continue;
                    }
                    quad[qi] = b;
                    qi += 1;
                }
                let vals: [u8; 4] = quad.map(b64val);
                self.buf[0] = (vals[0] << 2) | (vals[1] >> 4);
                self.buf[1] = (vals[1] << 4) | (vals[2] >> 2);
                self.buf[2] = (vals[2] << 6) | vals[3];
                self.buf_len = if quad[3] == b'=' {
                    if quad[2] == b'=' {
                        1
                    } else {
                        2
                    }
                } else {
                    3
                };
                self.buf_pos = 0;
            }
            Ok(written)
        }
    }

    fn b64val(c: u8) -> u8 {
        match c {
            b'A'..=b'Z' => c - b'A',
            b'a'..=b'z' => c - b'a' + 26,
            b'0'..=b'9' => c - b'0' + 52,
            b'+' => 62,
            b'/' => 63,
            _ => 0,
        }
    }

    Base64Reader {
        input,
        pos: 0,
        buf: [0; 3],
        buf_len: 0,
        buf_pos: 0,
    }
}

/// Decode Q-encoding (RFC 2047): underscores → spaces, `=XX` → byte.
fn decode_q_encoding(input: &str) -> Vec<u8> {
    let mut result = Vec::with_capacity(input.len());
    let bytes = input.as_bytes();
    let mut i = 0;
    while i < bytes.len() {
        match bytes[i] {
            b'_' => {
                result.push(b' ');
                i += 1;
            }
            b'=' if i + 2 < bytes.len() => {
                let hex = std::str::from_utf8(&bytes[i + 1..i + 3]).unwrap_or("");
                if let Ok(byte) = u8::from_str_radix(hex, 16) {
                    result.push(byte);
                    i += 3;
                } else {
                    result.push(b'=');
                    i += 1;
                }
            }
            b => {
                result.push(b);
                i += 1;
            }
        }
    }
    result
}

/// Decode bytes using a named charset.
fn decode_charset(charset: &str, bytes: &[u8]) -> String {
    let charset_lower = charset.to_lowercase();
    match charset_lower.as_str() {
        "utf-8" | "utf8" => String::from_utf8_lossy(bytes).into_owned(),
        _ => {
            if let Some(encoding) = encoding_rs::Encoding::for_label(charset.as_bytes()) {
                let (decoded, _, _) = encoding.decode(bytes);
                decoded.into_owned()
            } else {
                warn!(
                    charset = charset,
                    "Unknown charset, falling back to UTF-8 lossy"
                );
                String::from_utf8_lossy(bytes).into_owned()
            }
        }
    }
}

/// Calendar date of a `Date` header, in the sender's own offset.
///
/// `None` when the value cannot be parsed; callers substitute the processing date.
pub fn received_date(date_str: &str) -> Option<NaiveDate> {
    parse_date(date_str).map(|dt| dt.date_naive())
}

/// Parse an email date string in various common formats.
///
/// Supports RFC 2822, ISO 8601, and many broken real-world variants. The
/// original offset is kept so the calendar date matches what the sender saw.
pub fn parse_date(date_str: &str) -> Option<DateTime<FixedOffset>> {
    let trimmed = date_str.trim();
    if trimmed.is_empty() {
        return None;
    }

    if let Ok(dt) = DateTime::parse_from_rfc2822(trimmed) {
        return Some(dt);
    }

    if let Ok(dt) = DateTime::parse_from_rfc3339(trimmed) {
        return Some(dt);
    }

    // Drop trailing comments such as "(UTC)" or "(MSK)"
    let no_comment = match trimmed.find('(') {
        Some(pos) if pos > 0 => trimmed[..pos].trim(),
        _ => trimmed,
    };
    if let Ok(dt) = DateTime::parse_from_rfc2822(no_comment) {
        return Some(dt);
    }

    let no_dow = strip_day_of_week(no_comment);

    // IMAP-style: "16-JUL-2025 03:01:03" → "16 Jul 2025 03:01:03"
    let no_dow_normalized = normalize_imap_date(&no_dow);

    let formats = [
        "%d %b %Y %H:%M:%S %z",
        "%d %b %Y %H:%M:%S",
        "%d %b %Y %H:%M %z",
        "%b %d %H:%M:%S %Y",
        "%Y-%m-%dT%H:%M:%S%z",
        "%Y-%m-%d %H:%M:%S %z",
        "%Y-%m-%d %H:%M:%S",
        "%d/%m/%Y %H:%M:%S",
        "%d.%m.%Y %H:%M:%S",
    ];

    for candidate in [&no_dow, &no_dow_normalized] {
        for fmt in &formats {
            if let Ok(dt) = DateTime::parse_from_str(candidate, fmt) {
                return Some(dt);
            }
            if let Ok(ndt) = NaiveDateTime::parse_from_str(candidate, fmt) {
                return Some(Utc.from_utc_datetime(&ndt).fixed_offset());
            }
        }
    }

    for candidate in [&no_dow, &no_dow_normalized] {
        let replaced = replace_named_tz(candidate);
        for fmt in &formats {
            if let Ok(dt) = DateTime::parse_from_str(&replaced, fmt) {
                return Some(dt);
            }
        }
    }

    if let Some(dt) = mail_parser_date(trimmed) {
        return Some(dt);
    }

    warn!(date = trimmed, "Could not parse date");
    None
}

/// Attempt to parse a date using `mail-parser`'s built-in parser.
fn mail_parser_date(input: &str) -> Option<DateTime<FixedOffset>> {
    use mail_parser::MessageParser;

    // Wrap input in a minimal RFC 5322 message so mail-parser can parse it
    let fake_msg = format!("Date: {input}\n\n");
    let parser = MessageParser::default();
    let parsed = parser.parse(fake_msg.as_bytes())?;
    let dt = parsed.date()?.to_rfc3339();
    DateTime::parse_from_rfc3339(&dt).ok()
}

/// Normalize IMAP-style dates: `"16-JUL-2025 03:01:03"` → `"16 Jul 2025 03:01:03"`.
fn normalize_imap_date(s: &str) -> String {
    if !s.contains('-') {
        return s.to_string();
    }

    let title_months = [
        "Jan", "Feb", "Mar", "Apr", "May", "Jun", "Jul", "Aug", "Sep", "Oct", "Nov", "Dec",
    ];

    for month in &title_months {
        for variant in [month.to_uppercase(), month.to_lowercase(), month.to_string()] {
            let pattern = format!("-{variant}-");
            if s.contains(&pattern) {
                return s.replacen(&pattern, &format!(" {month} "), 1);
            }
        }
    }

    s.to_string()
}

/// Strip leading day-of-week prefix (e.g. "Thu, " or "Thu ").
fn strip_day_of_week(s: &str) -> String {
    let days = [
        "Mon,", "Tue,", "Wed,", "Thu,", "Fri,", "Sat,", "Sun,", "Mon ", "Tue ", "Wed ", "Thu ",
        "Fri ", "Sat ", "Sun ",
    ];
    for day in &days {
        if let Some(rest) = s.strip_prefix(day) {
            return rest.trim().to_string();
        }
    }
    s.to_string()
}

/// Replace well-known timezone abbreviations with numeric offsets.
fn replace_named_tz(s: &str) -> String {
    let tzs = [
        ("EST", "-0500"),
        ("EDT", "-0400"),
        ("CST", "-0600"),
        ("CDT", "-0500"),
        ("MST", "-0700"),
        ("MDT", "-0600"),
        ("PST", "-0800"),
        ("PDT", "-0700"),
        ("GMT", "+0000"),
        ("UTC", "+0000"),
        ("CEST", "+0200"),
        ("CET", "+0100"),
        ("EEST", "+0300"),
        ("EET", "+0200"),
        ("MSK", "+0300"),
        ("JST", "+0900"),
    ];
    let mut result = s.to_string();
    for (name, offset) in &tzs {
        if result.ends_with(name) {
            let pos = result.len() - name.len();
            result.replace_range(pos.., offset);
            return result;
        }
    }
    result
}

/// Turn a decoded attachment name into a safe display name.
///
/// Path components are dropped, control characters removed, and leading
/// dots trimmed. `None` when nothing usable remains.
pub fn sanitize_filename(name: &str, max_len: usize) -> Option<String> {
    let last = name.rsplit(['/', '\\']).next().unwrap_or(name);

    let cleaned: String = last
        .chars()
        .filter(|c| !c.is_control())
        .map(|c| match c {
            ':' | '*' | '?' | '"' | '<' | '>' | '|' => '_',
            c => c,
        })
        .collect();

    let trimmed = cleaned.trim().trim_start_matches('.').trim();
    if trimmed.is_empty() {
        return None;
    }
    Some(trimmed.chars().take(max_len).collect())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_decode_base64_encoded_word() {
        let input = "=?UTF-8?B?SG9sYSBtdW5kbw==?=";
        assert_eq!(decode_encoded_words(input), "Hola mundo");
    }

    #[test]
    fn test_decode_q_encoded_word() {
        let input = "=?ISO-8859-1?Q?caf=E9?=";
        assert_eq!(decode_encoded_words(input), "café");
    }

    #[test]
    fn test_decode_multiple_encoded_words() {
        let input = "=?UTF-8?B?SG9sYQ==?= =?UTF-8?B?IG11bmRv?=";
        assert_eq!(decode_encoded_words(input), "Hola mundo");
    }

    #[test]
    fn test_decode_mixed_plain_and_encoded() {
        let input = "Re: =?UTF-8?B?SG9sYQ==?= there";
        assert_eq!(decode_encoded_words(input), "Re: Hola there");
    }

    #[test]
    fn test_decode_koi8r_encoded_word() {
        // "Привет" in KOI8-R
        let input = "=?KOI8-R?B?8NLJ18XU?=";
        assert_eq!(decode_encoded_words(input), "Привет");
    }

    #[test]
    fn test_unknown_charset_is_lossy_not_fatal() {
        let input = "=?X-NOPE?Q?ab=FFcd?=";
        let decoded = decode_encoded_words(input);
        assert!(decoded.starts_with("ab"));
        assert!(decoded.ends_with("cd"));
        assert!(decoded.contains('\u{FFFD}'));
    }

    #[test]
    fn test_malformed_encoded_word_kept_verbatim() {
        assert_eq!(decode_encoded_words("=?UTF-8?B?broken"), "=?UTF-8?B?broken");
    }

    #[test]
    fn test_unfold_headers() {
        let text = "Subject: This is a long\n\tsubject line\nFrom: user@example.com\n";
        let headers = unfold_headers(text);
        assert_eq!(headers.len(), 2);
        assert_eq!(headers[0].0, "subject");
        assert_eq!(headers[0].1, "This is a long subject line");
        assert_eq!(get_header(&headers, "FROM"), Some("user@example.com"));
    }

    #[test]
    fn test_split_header_block() {
        let data = b"From: a@b.com\nSubject: Hi\n\nBody\n";
        let (headers, body) = split_header_block(data);
        assert_eq!(headers, b"From: a@b.com\nSubject: Hi");
        assert_eq!(body, b"Body\n");
    }

    #[test]
    fn test_split_header_block_crlf() {
        let data = b"From: a@b.com\r\nSubject: Hi\r\n\r\nBody\r\n";
        let (headers, body) = split_header_block(data);
        assert_eq!(headers, b"From: a@b.com\r\nSubject: Hi");
        assert_eq!(body, b"Body\r\n");
    }

    #[test]
    fn test_windows1252_header_bytes() {
        let bytes = b"Subject: M\xfcller";
        assert_eq!(decode_header_bytes(bytes), "Subject: Müller");
    }

    #[test]
    fn test_received_date_keeps_sender_offset() {
        // 22:30 UTC on the 4th, but already the 5th for the sender
        let d = received_date("Fri, 05 Jan 2024 01:30:00 +0300").unwrap();
        assert_eq!(d, NaiveDate::from_ymd_opt(2024, 1, 5).unwrap());
    }

    #[test]
    fn test_parse_date_rfc2822() {
        let dt = parse_date("Thu, 04 Jan 2024 10:00:00 +0000").unwrap();
        assert_eq!(dt.format("%Y-%m-%d").to_string(), "2024-01-04");
    }

    #[test]
    fn test_parse_date_with_comment() {
        assert!(parse_date("Thu, 04 Jan 2024 10:00:00 +0000 (UTC)").is_some());
    }

    #[test]
    fn test_parse_date_named_tz() {
        assert!(parse_date("Thu, 04 Jan 2024 10:00:00 EST").is_some());
    }

    #[test]
    fn test_parse_date_iso8601() {
        assert!(parse_date("2024-01-04T10:00:00Z").is_some());
    }

    #[test]
    fn test_parse_date_imap_style() {
        let dt = parse_date("16-JUL-2025 03:01:03").unwrap();
        assert_eq!(dt.format("%Y-%m-%d").to_string(), "2025-07-16");
    }

    #[test]
    fn test_parse_date_garbage() {
        assert!(parse_date("not a date").is_none());
        assert!(parse_date("").is_none());
    }

    #[test]
    fn test_normalize_imap_date() {
        assert_eq!(
            normalize_imap_date("10-MAR-2025 06:00:42"),
            "10 Mar 2025 06:00:42"
        );
        assert_eq!(
            normalize_imap_date("04 Jan 2024 10:00:00"),
            "04 Jan 2024 10:00:00"
        );
    }

    #[test]
    fn test_sanitize_filename() {
        assert_eq!(sanitize_filename("report.pdf", 255).as_deref(), Some("report.pdf"));
        assert_eq!(
            sanitize_filename("../../etc/passwd", 255).as_deref(),
            Some("passwd")
        );
        assert_eq!(
            sanitize_filename("C:\\Users\\scan 01.png", 255).as_deref(),
            Some("scan 01.png")
        );
        assert_eq!(sanitize_filename("a:b?.txt", 255).as_deref(), Some("a_b_.txt"));
        assert_eq!(sanitize_filename("..", 255), None);
        assert_eq!(sanitize_filename("  ", 255), None);
        assert_eq!(sanitize_filename("abcdef", 3).as_deref(), Some("abc"));
    }
}
