//! Identity of an installable application: a reverse-DNS name paired with an
//! opaque version string.

use std::fmt;

use serde::{Deserialize, Serialize};
use thiserror::Error;

const MAX_NAME_LEN: usize = 127;

#[derive(Debug, Error, PartialEq, Eq)]
pub enum AppKeyError {
    #[error("app name `{0}` is not a valid reverse-DNS identifier")]
    InvalidName(String),
    #[error("app version must not be empty")]
    EmptyVersion,
}

/// A reverse-DNS app name, e.g. `tech.flecs.demo`.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct AppName(String);

impl AppName {
    pub fn parse(raw: impl Into<String>) -> Result<Self, AppKeyError> {
        let raw = raw.into();
        if is_valid_app_name(&raw) {
            Ok(Self(raw))
        } else {
            Err(AppKeyError::InvalidName(raw))
        }
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for AppName {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl TryFrom<String> for AppName {
    type Error = AppKeyError;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        Self::parse(value)
    }
}

impl From<AppName> for String {
    fn from(value: AppName) -> Self {
        value.0
    }
}

/// Reverse-DNS validation: `label(.label)+`, each label `[a-z0-9]([a-z0-9-]*[a-z0-9])?`,
/// at least two labels, total length bounded.
fn is_valid_app_name(name: &str) -> bool {
    if name.is_empty() || name.len() > MAX_NAME_LEN {
        return false;
    }

    let labels: Vec<&str> = name.split('.').collect();
    if labels.len() < 2 {
        return false;
    }

    labels.iter().all(|label| is_valid_label(label))
}

fn is_valid_label(label: &str) -> bool {
    let bytes = label.as_bytes();
    if bytes.is_empty() {
        return false;
    }

    let is_lower_alnum = |b: u8| b.is_ascii_lowercase() || b.is_ascii_digit();

    if !is_lower_alnum(bytes[0]) || !is_lower_alnum(bytes[bytes.len() - 1]) {
        return false;
    }

    bytes
        .iter()
        .all(|&b| is_lower_alnum(b) || b == b'-')
}

/// `(name, version)`, the unique key of an [`crate::manifest::Manifest`] and [`crate::apps::App`].
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct AppKey {
    pub name: AppName,
    pub version: String,
}

impl AppKey {
    pub fn new(name: AppName, version: impl Into<String>) -> Result<Self, AppKeyError> {
        let version = version.into();
        if version.is_empty() {
            return Err(AppKeyError::EmptyVersion);
        }

        Ok(Self { name, version })
    }

    pub fn parse(name: impl Into<String>, version: impl Into<String>) -> Result<Self, AppKeyError> {
        Self::new(AppName::parse(name)?, version)
    }
}

impl fmt::Display for AppKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}-{}", self.name, self.version)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn accepts_well_formed_names() {
        assert!(AppName::parse("tech.flecs.demo").is_ok());
        assert!(AppName::parse("io.github.some-org.some-app").is_ok());
    }

    #[test]
    fn rejects_single_label_or_uppercase() {
        assert!(AppName::parse("demo").is_err());
        assert!(AppName::parse("Tech.Flecs.Demo").is_err());
        assert!(AppName::parse("tech..demo").is_err());
        assert!(AppName::parse("-tech.demo").is_err());
        assert!(AppName::parse("tech.demo-").is_err());
    }

    #[test]
    fn rejects_overlong_names() {
        let long = format!("tech.{}", "a".repeat(200));
        assert!(AppName::parse(long).is_err());
    }

    #[test]
    fn rejects_empty_version() {
        let name = AppName::parse("tech.flecs.demo").unwrap();
        assert_eq!(AppKey::new(name, "").unwrap_err(), AppKeyError::EmptyVersion);
    }

    #[test]
    fn orders_lexicographically_by_name_then_version() {
        let a = AppKey::parse("tech.flecs.demo", "1.0.0").unwrap();
        let b = AppKey::parse("tech.flecs.demo", "2.0.0").unwrap();
        let c = AppKey::parse("tech.flecs.other", "0.0.1").unwrap();
        assert!(a < b);
        assert!(b < c);
    }
}
