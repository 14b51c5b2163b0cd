use std::fmt;
use std::str::FromStr;

use once_cell::sync::Lazy;
use regex::Regex;
use serde::{Deserialize, Serialize};

/// A Greenplum release, `major.minor.patch`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Default)]
pub struct Version {
    pub major: u64,
    pub minor: u64,
    pub patch: u64,
}

impl Version {
    pub const fn new(major: u64, minor: u64, patch: u64) -> Self {
        Version {
            major,
            minor,
            patch,
        }
    }

    /// Parses the output of `postgres --gp-version`, e.g.
    /// `postgres (Greenplum Database) 6.20.3 build commit:...`.
    pub fn from_gp_version_output(output: &str) -> anyhow::Result<Version> {
        static VERSION_RE: Lazy<Regex> =
            Lazy::new(|| Regex::new(r"\(Greenplum Database\)\s+(\d+)\.(\d+)\.(\d+)").unwrap());

        let captures = VERSION_RE
            .captures(output)
            .ok_or_else(|| anyhow::anyhow!("unable to parse Greenplum version from {output:?}"))?;
        Ok(Version {
            major: captures[1].parse()?,
            minor: captures[2].parse()?,
            patch: captures[3].parse()?,
        })
    }
}

impl fmt::Display for Version {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}.{}.{}", self.major, self.minor, self.patch)
    }
}

impl FromStr for Version {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let mut parts = s.trim().splitn(3, '.');
        let mut next = |what: &str| -> anyhow::Result<u64> {
            let part = parts.next().unwrap_or("0");
            // Tolerate suffixes such as "6.20.3+dev".
            let digits: String = part.chars().take_while(|c| c.is_ascii_digit()).collect();
            digits
                .parse()
                .map_err(|_| anyhow::anyhow!("invalid {what} version in {s:?}"))
        };
        Ok(Version {
            major: next("major")?,
            minor: next("minor")?,
            patch: next("patch")?,
        })
    }
}

impl Serialize for Version {
    fn serialize<S: serde::Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(&self.to_string())
    }
}

impl<'de> Deserialize<'de> for Version {
    fn deserialize<D: serde::Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let s = String::deserialize(deserializer)?;
        s.parse().map_err(serde::de::Error::custom)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_gp_version_output() {
        let version = Version::from_gp_version_output(
            "postgres (Greenplum Database) 6.20.3 build commit:24b949d2585cdbe8a157062fb756013e7c2874ab",
        )
        .unwrap();
        assert_eq!(version, Version::new(6, 20, 3));

        let err = Version::from_gp_version_output("postgres (PostgreSQL) 12.12").unwrap_err();
        assert!(err.to_string().contains("unable to parse"));
    }

    #[test]
    fn parses_and_orders() {
        let five: Version = "5.28.12".parse().unwrap();
        let six: Version = "6.0.0+dev".parse().unwrap();
        assert!(five < six);
        assert_eq!(six.to_string(), "6.0.0");
        assert_eq!("7".parse::<Version>().unwrap(), Version::new(7, 0, 0));
    }

    #[test]
    fn serializes_as_string() {
        let json = serde_json::to_string(&Version::new(7, 1, 0)).unwrap();
        assert_eq!(json, "\"7.1.0\"");
        let back: Version = serde_json::from_str(&json).unwrap();
        assert_eq!(back, Version::new(7, 1, 0));
    }
}
