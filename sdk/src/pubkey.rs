//! Ed25519 public keys as used to identify leaders and validators.

use {
    serde::{Deserialize, Serialize},
    std::{fmt, str::FromStr},
    thiserror::Error,
};

pub const PUBKEY_BYTES: usize = 32;

#[derive(
    Clone, Copy, Default, Eq, Hash, Ord, PartialEq, PartialOrd, Serialize, Deserialize,
)]
pub struct Pubkey(pub(crate) [u8; PUBKEY_BYTES]);

impl AsRef<[u8]> for Pubkey {
    fn as_ref(&self) -> &[u8] {
        &self.0[..]
    }
}

impl From<[u8; PUBKEY_BYTES]> for Pubkey {
    #[inline]
    fn from(from: [u8; PUBKEY_BYTES]) -> Self {
        Self(from)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ParsePubkeyError {
    #[error("string decoded to wrong size for pubkey")]
    WrongSize,
    #[error("failed to decode string to pubkey")]
    Invalid,
}

impl TryFrom<&[u8]> for Pubkey {
    type Error = std::array::TryFromSliceError;

    #[inline]
    fn try_from(pubkey: &[u8]) -> Result<Self, Self::Error> {
        <[u8; PUBKEY_BYTES]>::try_from(pubkey).map(Self::from)
    }
}

impl FromStr for Pubkey {
    type Err = ParsePubkeyError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let bytes = bs58::decode(s)
            .into_vec()
            .map_err(|_| ParsePubkeyError::Invalid)?;
        <[u8; PUBKEY_BYTES]>::try_from(bytes)
            .map(Self)
            .map_err(|_| ParsePubkeyError::WrongSize)
    }
}

impl fmt::Debug for Pubkey {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(f, "{}", bs58::encode(self.0).into_string())
    }
}

impl fmt::Display for Pubkey {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(f, "{}", bs58::encode(self.0).into_string())
    }
}

impl Pubkey {
    pub const fn new_from_array(pubkey_array: [u8; PUBKEY_BYTES]) -> Self {
        Self(pubkey_array)
    }

    pub fn to_bytes(self) -> [u8; PUBKEY_BYTES] {
        self.0
    }

    /// New random Pubkey for tests and benchmarks.
    pub fn new_unique() -> Self {
        use std::sync::atomic::{AtomicU64, Ordering};
        static I: AtomicU64 = AtomicU64::new(1);

        let mut b = [0u8; PUBKEY_BYTES];
        let i = I.fetch_add(1, Ordering::Relaxed);
        // Use big-endian to ensure the generated keys are ordered.
        b[0..8].copy_from_slice(&i.to_be_bytes());
        Self::new_from_array(b)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_pubkey_fromstr() {
        let pubkey = Pubkey::new_unique();
        let pubkey_base58_str = format!("{pubkey}");
        assert_eq!(pubkey_base58_str.parse::<Pubkey>(), Ok(pubkey));
    }

    #[test]
    fn test_new_unique_is_unique() {
        assert_ne!(Pubkey::new_unique(), Pubkey::new_unique());
    }
}
