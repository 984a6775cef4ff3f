//! Ed25519 signatures and signing keypairs.

use {
    crate::pubkey::Pubkey,
    ed25519_dalek::{Signer as _, Verifier as _},
    rand::rngs::OsRng,
    serde::{Deserialize, Serialize},
    std::fmt,
};

pub const SIGNATURE_BYTES: usize = 64;

#[derive(Clone, Copy, Eq, Hash, Ord, PartialEq, PartialOrd, Serialize, Deserialize)]
pub struct Signature(#[serde(with = "serde_big_array")] [u8; SIGNATURE_BYTES]);

// Serde does not derive for arrays past 32 elements; encode the
// signature as a fixed-size tuple of two halves instead.
mod serde_big_array {
    use {
        serde::{Deserialize, Deserializer, Serialize, Serializer},
        std::convert::TryInto,
    };

    pub fn serialize<S: Serializer>(
        bytes: &[u8; super::SIGNATURE_BYTES],
        serializer: S,
    ) -> Result<S::Ok, S::Error> {
        let halves: (&[u8; 32], &[u8; 32]) = (
            bytes[..32].try_into().unwrap(),
            bytes[32..].try_into().unwrap(),
        );
        halves.serialize(serializer)
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(
        deserializer: D,
    ) -> Result<[u8; super::SIGNATURE_BYTES], D::Error> {
        let halves: ([u8; 32], [u8; 32]) = Deserialize::deserialize(deserializer)?;
        let mut out = [0u8; super::SIGNATURE_BYTES];
        out[..32].copy_from_slice(&halves.0);
        out[32..].copy_from_slice(&halves.1);
        Ok(out)
    }
}

impl Default for Signature {
    fn default() -> Self {
        Self([0u8; SIGNATURE_BYTES])
    }
}

impl AsRef<[u8]> for Signature {
    fn as_ref(&self) -> &[u8] {
        &self.0[..]
    }
}

impl From<[u8; SIGNATURE_BYTES]> for Signature {
    #[inline]
    fn from(signature: [u8; SIGNATURE_BYTES]) -> Self {
        Self(signature)
    }
}

impl From<Signature> for [u8; SIGNATURE_BYTES] {
    fn from(signature: Signature) -> Self {
        signature.0
    }
}

impl TryFrom<&[u8]> for Signature {
    type Error = std::array::TryFromSliceError;

    #[inline]
    fn try_from(signature: &[u8]) -> Result<Self, Self::Error> {
        <[u8; SIGNATURE_BYTES]>::try_from(signature).map(Self::from)
    }
}

impl fmt::Debug for Signature {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(f, "{}", bs58::encode(self.0).into_string())
    }
}

impl fmt::Display for Signature {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(f, "{}", bs58::encode(self.0).into_string())
    }
}

impl Signature {
    #[must_use]
    pub fn verify(&self, pubkey: &Pubkey, message: &[u8]) -> bool {
        let Ok(pubkey) = ed25519_dalek::VerifyingKey::from_bytes(&pubkey.0) else {
            return false;
        };
        let signature = ed25519_dalek::Signature::from_bytes(&self.0);
        pubkey.verify(message, &signature).is_ok()
    }
}

/// A vanilla Ed25519 key pair.
pub struct Keypair(ed25519_dalek::SigningKey);

impl Keypair {
    /// Constructs a new, random `Keypair` using `OsRng`.
    pub fn new() -> Self {
        Self(ed25519_dalek::SigningKey::generate(&mut OsRng))
    }

    /// Recovers a `Keypair` from a 32-byte secret seed.
    pub fn from_seed(seed: &[u8; 32]) -> Self {
        Self(ed25519_dalek::SigningKey::from_bytes(seed))
    }

    pub fn pubkey(&self) -> Pubkey {
        Pubkey::new_from_array(self.0.verifying_key().to_bytes())
    }

    pub fn sign_message(&self, message: &[u8]) -> Signature {
        Signature(self.0.sign(message).to_bytes())
    }
}

impl Default for Keypair {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_sign_verify() {
        let keypair = Keypair::new();
        let message = b"hello shreds";
        let signature = keypair.sign_message(message);
        assert!(signature.verify(&keypair.pubkey(), message));
        assert!(!signature.verify(&keypair.pubkey(), b"hello shred"));
        assert!(!signature.verify(&Pubkey::new_unique(), message));
    }

    #[test]
    fn test_signature_bincode_compat() {
        let keypair = Keypair::new();
        let signature = keypair.sign_message(b"x");
        let bytes = bincode::serialize(&signature).unwrap();
        // Fixed width on the wire, no length prefix.
        assert_eq!(bytes.len(), SIGNATURE_BYTES);
        assert_eq!(
            bincode::deserialize::<Signature>(&bytes).unwrap(),
            signature
        );
    }
}
