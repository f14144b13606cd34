use crate::{Error, Result};

pub mod proxy;
pub mod server;
pub mod user;

/// subdomains withheld from non-admin users
pub const RESERVED_SUBDOMAINS: &[&str] = &[
    "www", "mail", "smtp", "imap", "ns1", "ns2", "api", "admin", "panel", "map", "status",
];

/// RFC 1035 label: lowercase alphanumerics and interior hyphens, at most 63 octets
pub fn is_valid_dns_label(label: &str) -> bool {
    if label.is_empty() || label.len() > 63 {
        return false;
    }
    let bytes = label.as_bytes();
    if bytes[0] == b'-' || bytes[bytes.len() - 1] == b'-' {
        return false;
    }
    bytes
        .iter()
        .all(|b| b.is_ascii_lowercase() || b.is_ascii_digit() || *b == b'-')
}

pub fn is_reserved_subdomain(label: &str) -> bool {
    RESERVED_SUBDOMAINS.contains(&label)
}

/// the part of an email address before the '@', used as a directory name
pub fn email_local_part(email: &str) -> Result<&str> {
    email
        .split('@')
        .next()
        .filter(|s| !s.is_empty())
        .ok_or_else(|| Error::Validation(format!("malformed email address: {email}")))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn dns_labels() {
        assert!(is_valid_dns_label("survival"));
        assert!(is_valid_dns_label("sky-block2"));
        assert!(!is_valid_dns_label(""));
        assert!(!is_valid_dns_label("-edge"));
        assert!(!is_valid_dns_label("edge-"));
        assert!(!is_valid_dns_label("Sky"));
        assert!(!is_valid_dns_label("under_score"));
        assert!(!is_valid_dns_label(&"a".repeat(64)));
    }

    #[test]
    fn local_part() {
        assert_eq!(email_local_part("u@x.dev").unwrap(), "u");
        assert!(email_local_part("@x.dev").is_err());
    }
}
