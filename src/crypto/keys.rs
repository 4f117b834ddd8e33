//! Identity keys.
//!
//! Every peer is identified by an Ed25519 keypair. The same key material
//! doubles as the X25519 static key of the Noise handshake: the public key
//! maps to its Montgomery form and the secret key to its scalar bytes, so a
//! peer's public key is both its signing identity and its handshake identity.

use std::fmt;
use std::str::FromStr;

use ed25519_dalek::{Signature, Signer, SigningKey, Verifier, VerifyingKey};
use rand::rngs::OsRng;
use serde::de::{self, Deserializer};
use serde::{Deserialize, Serialize, Serializer};
use thiserror::Error;
use zeroize::Zeroizing;

use crate::core::{PUBLIC_KEY_SIZE, SECRET_KEY_SIZE, SIGNATURE_SIZE};

/// Key parsing and verification errors.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum KeyError {
    /// Input is not valid hex.
    #[error("invalid hex encoding")]
    InvalidHex,

    /// Decoded input has the wrong length.
    #[error("invalid length: expected {expected}, got {actual}")]
    InvalidLength {
        /// Expected length.
        expected: usize,
        /// Actual length.
        actual: usize,
    },

    /// Bytes are not a valid Ed25519 point.
    #[error("invalid public key")]
    InvalidKey,

    /// Signature does not verify.
    #[error("invalid signature")]
    InvalidSignature,
}

/// A peer's public key.
#[derive(Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Default)]
pub struct PubKey([u8; PUBLIC_KEY_SIZE]);

impl PubKey {
    /// Wrap raw key bytes. Validity is checked lazily by the operations
    /// that need a curve point.
    pub fn from_bytes(bytes: [u8; PUBLIC_KEY_SIZE]) -> Self {
        Self(bytes)
    }

    /// Parse from a byte slice.
    pub fn from_slice(bytes: &[u8]) -> Result<Self, KeyError> {
        let arr: [u8; PUBLIC_KEY_SIZE] =
            bytes.try_into().map_err(|_| KeyError::InvalidLength {
                expected: PUBLIC_KEY_SIZE,
                actual: bytes.len(),
            })?;
        Ok(Self(arr))
    }

    /// Get the raw bytes.
    pub fn as_bytes(&self) -> &[u8; PUBLIC_KEY_SIZE] {
        &self.0
    }

    /// The all-zero key.
    pub fn is_null(&self) -> bool {
        self.0 == [0u8; PUBLIC_KEY_SIZE]
    }

    /// X25519 public key used as the Noise static key.
    pub fn to_x25519(&self) -> Result<[u8; PUBLIC_KEY_SIZE], KeyError> {
        let key = VerifyingKey::from_bytes(&self.0).map_err(|_| KeyError::InvalidKey)?;
        Ok(key.to_montgomery().to_bytes())
    }

    /// Verify `sig` over `msg`.
    pub fn verify(&self, msg: &[u8], sig: &Sig) -> Result<(), KeyError> {
        let key = VerifyingKey::from_bytes(&self.0).map_err(|_| KeyError::InvalidKey)?;
        key.verify(msg, &Signature::from_bytes(&sig.0))
            .map_err(|_| KeyError::InvalidSignature)
    }
}

impl fmt::Display for PubKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&hex::encode(self.0))
    }
}

impl fmt::Debug for PubKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "PubKey({})", hex::encode(&self.0[..8]))
    }
}

impl FromStr for PubKey {
    type Err = KeyError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let bytes = hex::decode(s).map_err(|_| KeyError::InvalidHex)?;
        Self::from_slice(&bytes)
    }
}

impl Serialize for PubKey {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(&self.to_string())
    }
}

impl<'de> Deserialize<'de> for PubKey {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let s = String::deserialize(deserializer)?;
        s.parse().map_err(de::Error::custom)
    }
}

/// An Ed25519 signature.
#[derive(Clone, Copy, PartialEq, Eq)]
pub struct Sig([u8; SIGNATURE_SIZE]);

impl Sig {
    /// Wrap raw signature bytes.
    pub fn from_bytes(bytes: [u8; SIGNATURE_SIZE]) -> Self {
        Self(bytes)
    }

    /// Get the raw bytes.
    pub fn as_bytes(&self) -> &[u8; SIGNATURE_SIZE] {
        &self.0
    }
}

impl fmt::Debug for Sig {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Sig({}..)", hex::encode(&self.0[..8]))
    }
}

impl FromStr for Sig {
    type Err = KeyError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let bytes = hex::decode(s).map_err(|_| KeyError::InvalidHex)?;
        let arr: [u8; SIGNATURE_SIZE] =
            bytes.as_slice().try_into().map_err(|_| KeyError::InvalidLength {
                expected: SIGNATURE_SIZE,
                actual: bytes.len(),
            })?;
        Ok(Self(arr))
    }
}

impl Serialize for Sig {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(&hex::encode(self.0))
    }
}

impl<'de> Deserialize<'de> for Sig {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let s = String::deserialize(deserializer)?;
        s.parse().map_err(de::Error::custom)
    }
}

/// A long-term identity keypair.
///
/// The secret key is zeroized on drop.
#[derive(Clone)]
pub struct Keypair {
    signing: SigningKey,
    public: PubKey,
}

impl Keypair {
    /// Generate a new random keypair.
    pub fn generate() -> Self {
        Self::from_signing_key(SigningKey::generate(&mut OsRng))
    }

    /// Restore a keypair from its 32-byte secret seed.
    pub fn from_secret_bytes(secret: &[u8; SECRET_KEY_SIZE]) -> Self {
        Self::from_signing_key(SigningKey::from_bytes(secret))
    }

    fn from_signing_key(signing: SigningKey) -> Self {
        let public = PubKey(signing.verifying_key().to_bytes());
        Self { signing, public }
    }

    /// Get the public key.
    pub fn public_key(&self) -> PubKey {
        self.public
    }

    /// Get the secret seed.
    ///
    /// # Security
    /// Handle with care - this exposes sensitive key material.
    pub fn secret_bytes(&self) -> Zeroizing<[u8; SECRET_KEY_SIZE]> {
        Zeroizing::new(self.signing.to_bytes())
    }

    /// X25519 private key used as the Noise static key.
    pub fn noise_private_key(&self) -> Zeroizing<[u8; SECRET_KEY_SIZE]> {
        Zeroizing::new(self.signing.to_scalar_bytes())
    }

    /// Sign `msg`.
    pub fn sign(&self, msg: &[u8]) -> Sig {
        Sig(self.signing.sign(msg).to_bytes())
    }
}

impl fmt::Debug for Keypair {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Keypair")
            .field("public", &self.public)
            .field("secret", &"[REDACTED]")
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_keypair_generation() {
        let kp1 = Keypair::generate();
        let kp2 = Keypair::generate();

        assert_ne!(kp1.public_key(), kp2.public_key());
        assert_ne!(*kp1.secret_bytes(), *kp2.secret_bytes());
    }

    #[test]
    fn test_keypair_restore() {
        let kp = Keypair::generate();
        let restored = Keypair::from_secret_bytes(&kp.secret_bytes());
        assert_eq!(kp.public_key(), restored.public_key());
    }

    #[test]
    fn test_sign_verify() {
        let kp = Keypair::generate();
        let sig = kp.sign(b"entry bytes");
        assert!(kp.public_key().verify(b"entry bytes", &sig).is_ok());
        assert_eq!(
            kp.public_key().verify(b"other bytes", &sig),
            Err(KeyError::InvalidSignature)
        );

        let other = Keypair::generate();
        assert!(other.public_key().verify(b"entry bytes", &sig).is_err());
    }

    #[test]
    fn test_x25519_mapping() {
        let kp = Keypair::generate();
        let x = kp.public_key().to_x25519().unwrap();
        assert_ne!(&x, kp.public_key().as_bytes());
        assert_eq!(x, kp.public_key().to_x25519().unwrap());
    }

    #[test]
    fn test_pubkey_hex_roundtrip() {
        let pk = Keypair::generate().public_key();
        let parsed: PubKey = pk.to_string().parse().unwrap();
        assert_eq!(pk, parsed);

        assert_eq!("zz".parse::<PubKey>(), Err(KeyError::InvalidHex));
        assert_eq!(
            "abcd".parse::<PubKey>(),
            Err(KeyError::InvalidLength {
                expected: PUBLIC_KEY_SIZE,
                actual: 2
            })
        );
    }

    #[test]
    fn test_pubkey_json() {
        let pk = Keypair::generate().public_key();
        let json = serde_json::to_string(&pk).unwrap();
        assert_eq!(json, format!("\"{pk}\""));
        let back: PubKey = serde_json::from_str(&json).unwrap();
        assert_eq!(back, pk);
    }
}
