use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Deserializer, Serialize, Serializer};

use crate::error::Error;

/// A 6-byte Ethernet hardware address.
///
/// Equality is byte-wise; rendering is lowercase colon-separated.
/// Parsing accepts `:` or `-` separators in either case.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct MacAddr(pub [u8; 6]);

impl MacAddr {
    pub const ZERO: MacAddr = MacAddr([0; 6]);

    pub fn octets(&self) -> [u8; 6] {
        self.0
    }

    /// Extracts a MAC from the leading bytes of a BOOTP `chaddr` field.
    pub fn from_chaddr(chaddr: &[u8; 16]) -> Self {
        let mut octets = [0u8; 6];
        octets.copy_from_slice(&chaddr[..6]);
        MacAddr(octets)
    }

    /// Lowercase hex with no separators, the form used by filter matching.
    pub fn normalized(&self) -> String {
        self.0.iter().map(|byte| format!("{:02x}", byte)).collect()
    }
}

impl fmt::Display for MacAddr {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{:02x}:{:02x}:{:02x}:{:02x}:{:02x}:{:02x}",
            self.0[0], self.0[1], self.0[2], self.0[3], self.0[4], self.0[5]
        )
    }
}

impl FromStr for MacAddr {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let normalized = s.to_lowercase().replace('-', ":");
        let parts: Vec<&str> = normalized.split(':').collect();
        if parts.len() != 6 {
            return Err(Error::InvalidConfig(format!("invalid MAC address: {}", s)));
        }
        let mut octets = [0u8; 6];
        for (index, part) in parts.iter().enumerate() {
            octets[index] = u8::from_str_radix(part, 16)
                .map_err(|_| Error::InvalidConfig(format!("invalid MAC address: {}", s)))?;
        }
        Ok(MacAddr(octets))
    }
}

impl Serialize for MacAddr {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.collect_str(self)
    }
}

impl<'de> Deserialize<'de> for MacAddr {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let text = String::deserialize(deserializer)?;
        text.parse().map_err(serde::de::Error::custom)
    }
}
