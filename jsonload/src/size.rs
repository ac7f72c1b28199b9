use std::fmt;
use std::str::FromStr;

use byte_unit::Byte;
use serde::{de, Deserialize, Deserializer};

use crate::error::ConfigError;

/// A size in bytes, parsed from values like `100KB`, `10MB`, `1.5GB` or `4096`.
/// Units are powers of 1024 and case insensitive.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub struct ByteSize(pub u64);

impl ByteSize {
    pub const fn kib(n: u64) -> Self {
        ByteSize(n * 1024)
    }

    pub const fn mib(n: u64) -> Self {
        ByteSize(n * 1024 * 1024)
    }

    pub const fn gib(n: u64) -> Self {
        ByteSize(n * 1024 * 1024 * 1024)
    }

    pub fn as_u64(&self) -> u64 {
        self.0
    }
}

impl FromStr for ByteSize {
    type Err = ConfigError;

    /// `KB`, `MB`, `GB` and `TB` count in 1024s, the same as `KiB` and friends.
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let trimmed = s.trim();
        let split = trimmed
            .find(|c: char| c.is_ascii_alphabetic())
            .unwrap_or(trimmed.len());
        let (number, unit) = trimmed.split_at(split);
        let number = number.trim();
        if number.starts_with('-') {
            return Err(ConfigError::InvalidSize(s.to_owned()));
        }
        let unit = match unit.to_ascii_uppercase().as_str() {
            "K" | "KB" => "KiB",
            "M" | "MB" => "MiB",
            "G" | "GB" => "GiB",
            "T" | "TB" => "TiB",
            _ => unit,
        };

        Byte::parse_str(format!("{number}{unit}"), true)
            .map(|bytes| ByteSize(bytes.as_u64()))
            .map_err(|_| ConfigError::InvalidSize(s.to_owned()))
    }
}

impl fmt::Display for ByteSize {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}B", self.0)
    }
}

impl<'de> Deserialize<'de> for ByteSize {
    fn deserialize<D>(deserializer: D) -> Result<Self, D::Error>
    where
        D: Deserializer<'de>,
    {
        #[derive(Deserialize)]
        #[serde(untagged)]
        enum Raw {
            Bytes(u64),
            Human(String),
        }

        match Raw::deserialize(deserializer)? {
            Raw::Bytes(n) => Ok(ByteSize(n)),
            Raw::Human(s) => s.parse().map_err(de::Error::custom),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_units() {
        assert_eq!("100".parse::<ByteSize>().unwrap(), ByteSize(100));
        assert_eq!("100B".parse::<ByteSize>().unwrap(), ByteSize(100));
        assert_eq!("100KB".parse::<ByteSize>().unwrap(), ByteSize::kib(100));
        assert_eq!("10mb".parse::<ByteSize>().unwrap(), ByteSize::mib(10));
        assert_eq!("1GB".parse::<ByteSize>().unwrap(), ByteSize::gib(1));
        assert_eq!(" 2 MB ".parse::<ByteSize>().unwrap(), ByteSize::mib(2));
        assert_eq!("1.5KB".parse::<ByteSize>().unwrap(), ByteSize(1536));
        assert_eq!("512KiB".parse::<ByteSize>().unwrap(), ByteSize::kib(512));
        assert_eq!("4g".parse::<ByteSize>().unwrap(), ByteSize::gib(4));
    }

    #[test]
    fn test_parse_invalid() {
        for bad in ["", "MB", "ten", "10XB", "-1KB"] {
            assert!(bad.parse::<ByteSize>().is_err(), "{bad:?} should not parse");
        }
    }

    #[test]
    fn test_deserialize_number_or_string() {
        let n: ByteSize = serde_json::from_str("2048").unwrap();
        assert_eq!(n, ByteSize(2048));
        let s: ByteSize = serde_json::from_str("\"1MB\"").unwrap();
        assert_eq!(s, ByteSize::mib(1));
        assert!(serde_json::from_str::<ByteSize>("\"lots\"").is_err());
    }
}
