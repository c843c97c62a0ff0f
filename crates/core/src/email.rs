//! Email address value object.
//!
//! Validation here is deliberately shallow: enough to reject obviously
//! malformed input at the boundary (the canonical *terminal* delivery
//! failure), without attempting full RFC 5321 parsing — that is the mail
//! transport's job.

use serde::{Deserialize, Serialize};

use crate::error::DomainError;

/// A syntactically plausible email address.
///
/// Immutable and compared by value. Construct via [`EmailAddress::parse`];
/// deserialization applies the same validation.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct EmailAddress(String);

impl EmailAddress {
    /// Validate and wrap an address.
    ///
    /// Requires a single `@` with a non-empty local part and a domain
    /// containing at least one dot, and no whitespace anywhere.
    pub fn parse(value: impl Into<String>) -> Result<Self, DomainError> {
        let value = value.into();

        if value.chars().any(char::is_whitespace) {
            return Err(DomainError::validation(format!(
                "email address contains whitespace: {value:?}"
            )));
        }

        let mut parts = value.splitn(2, '@');
        let local = parts.next().unwrap_or_default();
        let domain = parts.next();

        match domain {
            Some(domain) if !local.is_empty() && domain.contains('.') && !domain.starts_with('.') => {
                Ok(Self(value))
            }
            _ => Err(DomainError::validation(format!(
                "malformed email address: {value:?}"
            ))),
        }
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl core::fmt::Display for EmailAddress {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.write_str(&self.0)
    }
}

impl TryFrom<String> for EmailAddress {
    type Error = DomainError;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        Self::parse(value)
    }
}

impl From<EmailAddress> for String {
    fn from(value: EmailAddress) -> Self {
        value.0
    }
}

impl AsRef<str> for EmailAddress {
    fn as_ref(&self) -> &str {
        self.0.as_str()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn accepts_plain_addresses() {
        for ok in ["teacher@school.example", "a.b+tag@sub.domain.org"] {
            assert!(EmailAddress::parse(ok).is_ok(), "{ok} should parse");
        }
    }

    #[test]
    fn rejects_malformed_addresses() {
        for bad in ["", "no-at-sign", "@school.example", "user@", "user@nodot", "u ser@x.y", "user@.com"] {
            assert!(EmailAddress::parse(bad).is_err(), "{bad:?} should be rejected");
        }
    }

    #[test]
    fn serde_round_trip_validates() {
        let addr = EmailAddress::parse("parent@school.example").unwrap();
        let json = serde_json::to_string(&addr).unwrap();
        assert_eq!(json, "\"parent@school.example\"");

        let back: EmailAddress = serde_json::from_str(&json).unwrap();
        assert_eq!(back, addr);

        assert!(serde_json::from_str::<EmailAddress>("\"broken\"").is_err());
    }
}
