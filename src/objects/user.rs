use std::collections::BTreeSet;

use serde::{Deserialize, Serialize};

use crate::{Error, Result};

pub const DEFAULT_MAX_SERVERS: u32 = 3;

fn default_max_servers() -> u32 {
    DEFAULT_MAX_SERVERS
}

/// an inclusive port range reserved for one user
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq, Eq)]
pub struct ReservedRange {
    pub start: u16,
    pub end: u16,
    #[serde(default)]
    pub description: Option<String>,
}

impl ReservedRange {
    pub fn contains(&self, port: u16) -> bool {
        self.start <= port && port <= self.end
    }

    pub fn overlaps(&self, other: &ReservedRange) -> bool {
        self.start <= other.end && other.start <= self.end
    }

    pub fn iter(&self) -> impl Iterator<Item = u16> + use<> {
        self.start..=self.end
    }
}

#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
pub struct User {
    /// unique, stored lowercased
    pub email: String,
    pub password_hash: String,
    #[serde(default)]
    pub is_admin: bool,
    #[serde(default = "default_max_servers")]
    pub max_servers: u32,
    #[serde(default)]
    pub reserved_ports: BTreeSet<u16>,
    /// ordered, pairwise non-overlapping
    #[serde(default)]
    pub reserved_port_ranges: Vec<ReservedRange>,
    #[serde(default)]
    pub deleted: bool,
}

impl User {
    /// structural checks on the reservation fields; enforced on every mutation
    pub fn validate_reservations(&self) -> Result<()> {
        for port in &self.reserved_ports {
            if *port < 1024 {
                return Err(Error::Validation(format!(
                    "reserved port {port} below 1024"
                )));
            }
        }
        for range in &self.reserved_port_ranges {
            if range.start > range.end {
                return Err(Error::Validation(format!(
                    "range {}..{} is inverted",
                    range.start, range.end
                )));
            }
            if range.start < 1024 {
                return Err(Error::Validation(format!(
                    "range {}..{} starts below 1024",
                    range.start, range.end
                )));
            }
        }
        for (i, a) in self.reserved_port_ranges.iter().enumerate() {
            for b in &self.reserved_port_ranges[i + 1..] {
                if a.overlaps(b) {
                    return Err(Error::Validation(format!(
                        "ranges {}..{} and {}..{} overlap",
                        a.start, a.end, b.start, b.end
                    )));
                }
            }
        }
        Ok(())
    }

    pub fn owns_port(&self, port: u16) -> bool {
        self.reserved_ports.contains(&port)
            || self.reserved_port_ranges.iter().any(|r| r.contains(port))
    }
}
