//! VaultId: Shareable identifier for an encrypted vault.
//!
//! Wraps 8 random bytes (as a u64) and displays as `mg-xxxx-xxxx-xxxx-xxxx`.
//! The ID is generated once when a vault is created and handed to other
//! devices out-of-band so they can join. It also salts the key derivation.

use std::fmt::{self, Display, Formatter};
use std::str::FromStr;
use thiserror::Error;

/// Prefix shared by all vault IDs.
const PREFIX: &str = "mg-";

#[derive(Debug, Error)]
pub enum VaultIdError {
    #[error("Invalid vault ID format: expected mg-xxxx-xxxx-xxxx-xxxx")]
    InvalidFormat,
    #[error("Invalid hex: {0}")]
    InvalidHex(#[from] std::num::ParseIntError),
}

/// Identifier of an encrypted vault.
///
/// # Examples
/// ```
/// use sync_core::VaultId;
///
/// let id = VaultId::generate();
/// let parsed: VaultId = id.to_string().parse().unwrap();
/// assert_eq!(id, parsed);
///
/// let fixed: VaultId = "mg-a1b2-c3d4-e5f6-7890".parse().unwrap();
/// assert_eq!(fixed.as_u64(), 0xa1b2c3d4e5f67890);
/// ```
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct VaultId(u64);

impl VaultId {
    /// Generate a new random vault ID from 8 bytes of secure randomness.
    pub fn generate() -> Self {
        use rand::Rng;
        Self(rand::rng().random())
    }

    pub fn as_u64(&self) -> u64 {
        self.0
    }
}

/// Generate a new vault ID in its string form.
pub fn generate_vault_id() -> String {
    VaultId::generate().to_string()
}

impl Display for VaultId {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        let hex = format!("{:016x}", self.0);
        write!(
            f,
            "{}{}-{}-{}-{}",
            PREFIX,
            &hex[0..4],
            &hex[4..8],
            &hex[8..12],
            &hex[12..16]
        )
    }
}

impl FromStr for VaultId {
    type Err = VaultIdError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let s = s.trim().to_ascii_lowercase();
        let groups = s.strip_prefix(PREFIX).ok_or(VaultIdError::InvalidFormat)?;

        let parts: Vec<&str> = groups.split('-').collect();
        if parts.len() != 4
            || parts
                .iter()
                .any(|p| p.len() != 4 || !p.chars().all(|c| c.is_ascii_hexdigit()))
        {
            return Err(VaultIdError::InvalidFormat);
        }

        let id = u64::from_str_radix(&parts.concat(), 16)?;
        Ok(Self(id))
    }
}

impl From<u64> for VaultId {
    fn from(id: u64) -> Self {
        Self(id)
    }
}

// Serialize in display form so settings files stay readable
impl serde::Serialize for VaultId {
    fn serialize<S: serde::Serializer>(&self, s: S) -> Result<S::Ok, S::Error> {
        s.serialize_str(&self.to_string())
    }
}

impl<'de> serde::Deserialize<'de> for VaultId {
    fn deserialize<D: serde::Deserializer<'de>>(d: D) -> Result<Self, D::Error> {
        let s = String::deserialize(d)?;
        s.parse().map_err(serde::de::Error::custom)
    }
}
