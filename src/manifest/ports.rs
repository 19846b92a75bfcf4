//! `hostRange:containerRange` port mappings, e.g. `"8080:80"` or `"8080-8090:80-90"`.

use std::fmt;

use serde::{Deserialize, Serialize};
use thiserror::Error;

#[derive(Debug, Error, PartialEq, Eq)]
pub enum PortRangeError {
    #[error("malformed port mapping `{0}`, expected hostRange:containerRange")]
    Malformed(String),
    #[error("malformed port number in `{0}`")]
    InvalidNumber(String),
    #[error("range `{0}` has start greater than end")]
    Inverted(String),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Range {
    pub start: u16,
    pub end: u16,
}

impl Range {
    fn parse(raw: &str) -> Result<Self, PortRangeError> {
        match raw.split_once('-') {
            Some((start, end)) => {
                let start: u16 = start
                    .parse()
                    .map_err(|_| PortRangeError::InvalidNumber(raw.to_owned()))?;
                let end: u16 = end
                    .parse()
                    .map_err(|_| PortRangeError::InvalidNumber(raw.to_owned()))?;
                if start > end {
                    return Err(PortRangeError::Inverted(raw.to_owned()));
                }
                Ok(Self { start, end })
            }
            None => {
                let port: u16 = raw
                    .parse()
                    .map_err(|_| PortRangeError::InvalidNumber(raw.to_owned()))?;
                Ok(Self {
                    start: port,
                    end: port,
                })
            }
        }
    }

    pub fn len(&self) -> u32 {
        u32::from(self.end) - u32::from(self.start) + 1
    }

    pub fn is_empty(&self) -> bool {
        false
    }
}

impl fmt::Display for Range {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.start == self.end {
            write!(f, "{}", self.start)
        } else {
            write!(f, "{}-{}", self.start, self.end)
        }
    }
}

/// A `host:container` port range mapping. The host side may be empty,
/// meaning "let the engine choose a free host port".
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PortRange {
    pub host: Option<Range>,
    pub container: Range,
}

impl PortRange {
    pub fn engine_chooses(container: Range) -> Self {
        Self {
            host: None,
            container,
        }
    }

    pub fn with_empty_host(&self) -> Self {
        Self {
            host: None,
            container: self.container,
        }
    }

    /// True iff `self`'s host range overlaps `other`'s host range. Two
    /// engine-chosen (empty) ranges never collide by this definition.
    pub fn host_overlaps(&self, other: &PortRange) -> bool {
        match (self.host, other.host) {
            (Some(a), Some(b)) => a.start <= b.end && b.start <= a.end,
            _ => false,
        }
    }
}

impl fmt::Display for PortRange {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.host {
            Some(host) => write!(f, "{}:{}", host, self.container),
            None => write!(f, ":{}", self.container),
        }
    }
}

impl std::str::FromStr for PortRange {
    type Err = PortRangeError;

    fn from_str(raw: &str) -> Result<Self, Self::Err> {
        let (host, container) = raw
            .split_once(':')
            .ok_or_else(|| PortRangeError::Malformed(raw.to_owned()))?;
        let container = Range::parse(container)?;
        let host = if host.is_empty() {
            None
        } else {
            Some(Range::parse(host)?)
        };
        Ok(Self { host, container })
    }
}

impl Serialize for PortRange {
    fn serialize<S>(&self, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: serde::Serializer,
    {
        self.to_string().serialize(serializer)
    }
}

impl<'de> Deserialize<'de> for PortRange {
    fn deserialize<D>(deserializer: D) -> Result<Self, D::Error>
    where
        D: serde::Deserializer<'de>,
    {
        let raw = String::deserialize(deserializer)?;
        raw.parse().map_err(serde::de::Error::custom)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_single_port_mapping() {
        let pr: PortRange = "8080:80".parse().unwrap();
        assert_eq!(pr.host.unwrap().start, 8080);
        assert_eq!(pr.container.start, 80);
    }

    #[test]
    fn parses_ranged_mapping() {
        let pr: PortRange = "8080-8090:80-90".parse().unwrap();
        assert_eq!(pr.host.unwrap().len(), 11);
    }

    #[test]
    fn parses_empty_host_range() {
        let pr: PortRange = ":80".parse().unwrap();
        assert!(pr.host.is_none());
        assert_eq!(pr.to_string(), ":80");
    }

    #[test]
    fn detects_host_overlap() {
        let a: PortRange = "8080:80".parse().unwrap();
        let b: PortRange = "8000-8100:81".parse().unwrap();
        assert!(a.host_overlaps(&b));
        let c = a.with_empty_host();
        assert!(!a.host_overlaps(&c));
    }

    #[test]
    fn round_trips_through_display() {
        let pr: PortRange = "8080-8090:80-90".parse().unwrap();
        let reparsed: PortRange = pr.to_string().parse().unwrap();
        assert_eq!(pr, reparsed);
    }
}
