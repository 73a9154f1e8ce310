// SPDX-License-Identifier: MIT
// Copyright 2025. Triad National Security, LLC.

use std::{fmt, str::FromStr};

use serde::{Deserialize, Deserializer, Serialize, Serializer};

/// A Greenplum release, `MAJOR.MINOR.PATCH`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub struct GpVersion {
    pub major: u32,
    pub minor: u32,
    pub patch: u32,
}

#[derive(Debug, thiserror::Error)]
#[error("could not parse a Greenplum version from '{0}'")]
pub struct VersionError(String);

impl GpVersion {
    pub fn new(major: u32, minor: u32, patch: u32) -> Self {
        GpVersion {
            major,
            minor,
            patch,
        }
    }

    /// Extracts the version from the output of `SELECT version()` or `postgres --gp-version`,
    /// e.g. `PostgreSQL 9.4.26 (Greenplum Database 6.20.3 build commit:...)` or
    /// `postgres (Greenplum Database) 7.1.0 build commit:...`.
    pub fn parse_banner(banner: &str) -> Result<Self, VersionError> {
        const MARKER: &str = "Greenplum Database";

        let err = || VersionError(banner.trim().to_string());
        let start = banner.find(MARKER).ok_or_else(err)? + MARKER.len();
        let rest = banner[start..].trim_start_matches([')', ' ']);
        let number: String = rest
            .chars()
            .take_while(|c| c.is_ascii_digit() || *c == '.')
            .collect();

        number.parse().map_err(|_| err())
    }
}

impl FromStr for GpVersion {
    type Err = VersionError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let err = || VersionError(s.to_string());
        let mut parts = s.trim().trim_end_matches('.').split('.');

        let mut next = |required: bool| -> Result<u32, VersionError> {
            match parts.next() {
                Some(p) => p.parse().map_err(|_| err()),
                None if required => Err(err()),
                None => Ok(0),
            }
        };

        let major = next(true)?;
        let minor = next(false)?;
        let patch = next(false)?;

        Ok(GpVersion::new(major, minor, patch))
    }
}

impl fmt::Display for GpVersion {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}.{}.{}", self.major, self.minor, self.patch)
    }
}

impl Serialize for GpVersion {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.collect_str(self)
    }
}

impl<'de> Deserialize<'de> for GpVersion {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let s = String::deserialize(deserializer)?;
        s.parse().map_err(serde::de::Error::custom)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_select_version_output() {
        let banner = "PostgreSQL 9.4.26 (Greenplum Database 6.20.3 build commit:abc) on x86_64";
        assert_eq!(
            GpVersion::parse_banner(banner).unwrap(),
            GpVersion::new(6, 20, 3)
        );
    }

    #[test]
    fn parses_gp_version_flag_output() {
        let banner = "postgres (Greenplum Database) 7.0.0-beta.1 build dev\n";
        assert_eq!(
            GpVersion::parse_banner(banner).unwrap(),
            GpVersion::new(7, 0, 0)
        );
    }

    #[test]
    fn rejects_other_databases() {
        assert!(GpVersion::parse_banner("PostgreSQL 14.2 on x86_64").is_err());
    }

    #[test]
    fn missing_components_default_to_zero() {
        assert_eq!("6".parse::<GpVersion>().unwrap(), GpVersion::new(6, 0, 0));
        assert!("six".parse::<GpVersion>().is_err());
    }
}
