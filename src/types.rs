use std::fmt::{Debug, Display};

use serde::{Deserialize, Serialize};
use zeroize::{Zeroize, ZeroizeOnDrop};

/// Passphrase of the encrypted container. Only lives in process memory and is wiped on drop.
#[derive(Zeroize, ZeroizeOnDrop, Clone, PartialEq)]
pub struct Passphrase(Vec<u8>);

impl Passphrase {
    pub fn as_bytes(&self) -> &[u8] {
        self.0.as_slice()
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }
}

impl From<Vec<u8>> for Passphrase {
    fn from(value: Vec<u8>) -> Self {
        Self(value)
    }
}

impl From<String> for Passphrase {
    fn from(value: String) -> Self {
        Self(value.into_bytes())
    }
}

impl Debug for Passphrase {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str("Passphrase(<redacted>)")
    }
}

#[derive(Serialize, Deserialize, Debug, PartialEq, Clone, Copy)]
#[serde(rename_all = "lowercase")]
#[serde(deny_unknown_fields)]
pub enum MakeFsType {
    Btrfs,
    Vfat,
}

impl Display for MakeFsType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(serde_variant::to_variant_name(self).unwrap_or("<unknown>"))
    }
}

/// A size in bytes, parsed from strings such as `8G`, `512MiB` or `1073741824`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ByteSize(pub u64);

pub const KIB: u64 = 1024;
pub const MIB: u64 = 1024 * KIB;
pub const GIB: u64 = 1024 * MIB;

impl ByteSize {
    pub fn bytes(self) -> u64 {
        self.0
    }

    pub fn gib(n: u64) -> Self {
        Self(n * GIB)
    }

    pub fn mib(n: u64) -> Self {
        Self(n * MIB)
    }
}

impl std::str::FromStr for ByteSize {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let s = s.trim();
        let split = s
            .find(|c: char| !c.is_ascii_digit())
            .unwrap_or(s.len());
        let (number, unit) = s.split_at(split);
        if number.is_empty() {
            anyhow::bail!("Size {s:?} does not start with a number");
        }
        let number: u64 = number.parse()?;
        let multiplier = match unit.trim() {
            "" | "B" => 1,
            "K" | "KiB" => KIB,
            "M" | "MiB" => MIB,
            "G" | "GiB" => GIB,
            "T" | "TiB" => GIB * 1024,
            other => anyhow::bail!("Unknown size unit {other:?} in {s:?}"),
        };
        number
            .checked_mul(multiplier)
            .map(ByteSize)
            .ok_or_else(|| anyhow::anyhow!("Size {s:?} is too large"))
    }
}

impl Display for ByteSize {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let bytes = self.0;
        if bytes != 0 && bytes % GIB == 0 {
            write!(f, "{}G", bytes / GIB)
        } else if bytes != 0 && bytes % MIB == 0 {
            write!(f, "{}M", bytes / MIB)
        } else if bytes != 0 && bytes % KIB == 0 {
            write!(f, "{}K", bytes / KIB)
        } else {
            write!(f, "{bytes}")
        }
    }
}
