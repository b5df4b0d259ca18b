use std::fmt;
use std::sync::LazyLock;

use regex::Regex;
use serde::{Deserialize, Serialize};

static EMAIL_PATTERN: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"^[a-zA-Z0-9._%+\-]+@[a-zA-Z0-9.\-]+\.[a-zA-Z]{2,}$").unwrap()
});

pub fn is_valid_email(address: &str) -> bool {
    EMAIL_PATTERN.is_match(address)
}

/// A mailbox as it appears in sender, from, reply-to and recipient fields.
///
/// Inbound addresses are parsed into this type once, at the boundary where
/// they enter the relay; everything downstream works with it directly.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct EmailAddress {
    #[serde(default)]
    pub name: String,
    pub address: String,
}

impl EmailAddress {
    pub fn new(name: impl Into<String>, address: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            address: address.into(),
        }
    }

    pub fn bare(address: impl Into<String>) -> Self {
        Self::new(String::new(), address)
    }

    /// Parses `Name <addr>`, `<addr>` or a bare `addr`.
    ///
    /// Returns `None` when the address part is not a valid mailbox.
    pub fn parse(raw: &str) -> Option<Self> {
        let raw = raw.trim();
        if raw.is_empty() {
            return None;
        }
        let (name, address) = match (raw.rfind('<'), raw.rfind('>')) {
            (Some(start), Some(end)) if start < end => {
                let name = raw[..start].trim().trim_matches('"').trim();
                (name.to_string(), raw[start + 1..end].trim().to_string())
            }
            _ => (String::new(), raw.to_string()),
        };
        if !is_valid_email(&address) {
            return None;
        }
        Some(Self { name, address })
    }

    /// Parses a comma separated list, skipping entries that are not valid mailboxes.
    pub fn parse_list(raw: &str) -> Vec<Self> {
        split_address_list(raw)
            .into_iter()
            .filter_map(|entry| {
                let parsed = Self::parse(entry);
                if parsed.is_none() && !entry.trim().is_empty() {
                    tracing::warn!("ignoring invalid mail address in list: {}", entry.trim());
                }
                parsed
            })
            .collect()
    }

    pub fn is_valid(&self) -> bool {
        is_valid_email(&self.address)
    }

    pub fn local_part(&self) -> &str {
        match self.address.find('@') {
            Some(index) => &self.address[..index],
            None => &self.address,
        }
    }

    /// The name when present, otherwise the local part of the address.
    pub fn display_name(&self) -> &str {
        if self.name.trim().is_empty() {
            self.local_part()
        } else {
            self.name.trim()
        }
    }

    pub fn with_name(&self, name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            address: self.address.clone(),
        }
    }

    pub fn same_mailbox(&self, other: &EmailAddress) -> bool {
        self.address.eq_ignore_ascii_case(&other.address)
    }
}

impl fmt::Display for EmailAddress {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.name.is_empty() {
            write!(f, "{}", self.address)
        } else {
            write!(f, "{} <{}>", self.name, self.address)
        }
    }
}

fn split_address_list(raw: &str) -> Vec<&str> {
    let mut entries = Vec::new();
    let mut quoted = false;
    let mut start = 0;
    for (index, ch) in raw.char_indices() {
        match ch {
            '"' => quoted = !quoted,
            ',' | ';' if !quoted => {
                entries.push(&raw[start..index]);
                start = index + ch.len_utf8();
            }
            _ => {}
        }
    }
    entries.push(&raw[start..]);
    entries
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn validates_addresses() {
        assert!(is_valid_email("someone@example.com"));
        assert!(is_valid_email("first.last+tag@sub.example.org"));
        assert!(!is_valid_email("someone@localhost"));
        assert!(!is_valid_email("not an email"));
        assert!(!is_valid_email(""));
    }

    #[test]
    fn parses_named_and_bare_forms() {
        let named = EmailAddress::parse("\"Xiao Ming\" <ming@example.com>").expect("named");
        assert_eq!(named.name, "Xiao Ming");
        assert_eq!(named.address, "ming@example.com");

        let angle = EmailAddress::parse("<ming@example.com>").expect("angle");
        assert_eq!(angle.name, "");

        let bare = EmailAddress::parse(" ming@example.com ").expect("bare");
        assert_eq!(bare.address, "ming@example.com");

        assert!(EmailAddress::parse("Ming <ming@>").is_none());
    }

    #[test]
    fn parses_lists_with_quoted_commas() {
        let list =
            EmailAddress::parse_list("\"Doe, Jane\" <jane@example.com>, bob@example.com, broken");
        assert_eq!(list.len(), 2);
        assert_eq!(list[0].name, "Doe, Jane");
        assert_eq!(list[1].address, "bob@example.com");
    }

    #[test]
    fn display_name_falls_back_to_local_part() {
        assert_eq!(EmailAddress::bare("ming@example.com").display_name(), "ming");
        assert_eq!(
            EmailAddress::new("小明", "ming@example.com").display_name(),
            "小明"
        );
        assert_eq!(
            EmailAddress::new("小明", "ming@example.com").to_string(),
            "小明 <ming@example.com>"
        );
    }
}
