//! Sender address parsing (RFC 5322 §3.4).

use crate::parser::header::decode_encoded_words;

/// A parsed sender address.
///
/// # Examples
/// - `"Ivan Petrov <ivan@example.com>"` → `display_name = "Ivan Petrov"`, `address = "ivan@example.com"`
/// - `"user@example.com"` → `display_name = ""`, `address = "user@example.com"`
#[derive(Debug, Clone, serde::Serialize, serde::Deserialize, PartialEq, Eq)]
pub struct EmailAddress {
    /// Human-readable display name, already decoded (may be empty).
    pub display_name: String,
    /// The bare email address (`user@domain`).
    pub address: String,
}

impl EmailAddress {
    /// Parse a raw `From` header value.
    ///
    /// The display name is split off first and only then run through
    /// encoded-word decoding, so an encoded name containing `<` or `,` cannot
    /// confuse the address split.
    ///
    /// Supported formats:
    /// - `"user@domain.com"`
    /// - `"<user@domain.com>"`
    /// - `"Display Name <user@domain.com>"`
    /// - `"\"Display, Name\" <user@domain.com>"`
    /// - `"=?UTF-8?B?...?= <user@domain.com>"`
    ///
    /// If parsing fails, the raw string is stored as `address`.
    pub fn parse(raw: &str) -> Self {
        let trimmed = raw.trim();
        if trimmed.is_empty() {
            return Self {
                display_name: String::new(),
                address: String::new(),
            };
        }

        if let Some(angle_start) = trimmed.rfind('<') {
            if let Some(angle_end) = trimmed.rfind('>') {
                if angle_end > angle_start {
                    let addr = trimmed[angle_start + 1..angle_end].trim().to_string();
                    let name_part = strip_quotes(&trimmed[..angle_start]);
                    let display_name = strip_quotes(&decode_encoded_words(&name_part));
                    return Self {
                        display_name,
                        address: addr,
                    };
                }
            }
        }

        // "user@domain.com (Display Name)", old comment form
        if let (Some(open), Some(close)) = (trimmed.find('('), trimmed.rfind(')')) {
            if close > open && trimmed[..open].contains('@') {
                return Self {
                    display_name: decode_encoded_words(trimmed[open + 1..close].trim()),
                    address: trimmed[..open].trim().to_string(),
                };
            }
        }

        Self {
            display_name: String::new(),
            address: trimmed.to_string(),
        }
    }

    /// The text stored as a record's applicant: the display name when there
    /// is one, otherwise the bare address.
    pub fn applicant(&self) -> &str {
        if self.display_name.trim().is_empty() {
            &self.address
        } else {
            &self.display_name
        }
    }

    /// Format for display: `"Display Name <address>"` or just `"address"`.
    pub fn display(&self) -> String {
        if self.display_name.is_empty() {
            self.address.clone()
        } else {
            format!("{} <{}>", self.display_name, self.address)
        }
    }
}

/// Strip surrounding double-quotes and trim whitespace.
fn strip_quotes(s: &str) -> String {
    let trimmed = s.trim();
    if trimmed.starts_with('"') && trimmed.ends_with('"') && trimmed.len() >= 2 {
        trimmed[1..trimmed.len() - 1].trim().to_string()
    } else {
        trimmed.to_string()
    }
}

impl std::fmt::Display for EmailAddress {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.display())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_bare_address() {
        let addr = EmailAddress::parse("user@example.com");
        assert_eq!(addr.address, "user@example.com");
        assert_eq!(addr.display_name, "");
        assert_eq!(addr.applicant(), "user@example.com");
    }

    #[test]
    fn test_parse_angle_address() {
        let addr = EmailAddress::parse("<user@example.com>");
        assert_eq!(addr.address, "user@example.com");
        assert_eq!(addr.applicant(), "user@example.com");
    }

    #[test]
    fn test_parse_name_and_address() {
        let addr = EmailAddress::parse("User One <user1@example.com>");
        assert_eq!(addr.address, "user1@example.com");
        assert_eq!(addr.applicant(), "User One");
    }

    #[test]
    fn test_parse_quoted_name() {
        let addr = EmailAddress::parse("\"Last, First\" <user@example.com>");
        assert_eq!(addr.display_name, "Last, First");
    }

    #[test]
    fn test_parse_encoded_name() {
        // "Иван Петров"
        let addr = EmailAddress::parse("=?UTF-8?B?0JjQstCw0L0g0J/QtdGC0YDQvtCy?= <ivan@example.ru>");
        assert_eq!(addr.display_name, "Иван Петров");
        assert_eq!(addr.address, "ivan@example.ru");
        assert_eq!(addr.applicant(), "Иван Петров");
    }

    #[test]
    fn test_parse_quoted_encoded_name() {
        let addr = EmailAddress::parse("\"=?ISO-8859-1?Q?Fran=E7ois?=\" <f@example.fr>");
        assert_eq!(addr.display_name, "François");
    }

    #[test]
    fn test_parse_comment_form() {
        let addr = EmailAddress::parse("jdoe@example.com (John Doe)");
        assert_eq!(addr.address, "jdoe@example.com");
        assert_eq!(addr.display_name, "John Doe");
    }

    #[test]
    fn test_blank_display_name_falls_back_to_address() {
        let addr = EmailAddress::parse("\"\" <quiet@example.com>");
        assert_eq!(addr.applicant(), "quiet@example.com");
    }

    #[test]
    fn test_display_with_name() {
        let addr = EmailAddress {
            display_name: "Alice".to_string(),
            address: "alice@example.com".to_string(),
        };
        assert_eq!(addr.display(), "Alice <alice@example.com>");
    }

    #[test]
    fn test_parse_empty() {
        let addr = EmailAddress::parse("");
        assert_eq!(addr.address, "");
    }
}
