//! On-chain style identities for the client and the server.
//!
//! Both sides are identified by a 20-byte [`Address`]: the last 20 bytes of the
//! keccak-256 hash of the uncompressed secp256k1 public key (without the `0x04`
//! SEC1 tag). The client additionally holds its secret key and signs usage
//! tickets with it.

use std::fmt;
use std::str::FromStr;

use k256::ecdsa::{RecoveryId, Signature as EcdsaSignature, SigningKey, VerifyingKey};
use sha3::{Digest, Keccak256};

use crate::error::{ProtocolError, Result};

/// Length of an address in bytes.
pub const ADDRESS_LENGTH: usize = 20;

/// Length of a secp256k1 secret key in bytes.
pub const SECRET_KEY_LENGTH: usize = 32;

/// Length of a recoverable signature: recovery id + r + s.
pub const SIGNATURE_LENGTH: usize = 65;

/// Computes the keccak-256 digest of `data`.
pub fn keccak256(data: &[u8]) -> [u8; 32] {
    Keccak256::digest(data).into()
}

/// A 20-byte account address.
#[derive(Clone, Copy, PartialEq, Eq, Hash, Default)]
pub struct Address(pub [u8; ADDRESS_LENGTH]);

impl Address {
    /// The all-zero address.
    pub const ZERO: Address = Address([0u8; ADDRESS_LENGTH]);

    /// Creates an address from raw bytes.
    pub fn from_bytes(bytes: [u8; ADDRESS_LENGTH]) -> Self {
        Self(bytes)
    }

    /// Creates an address from a slice, which must be exactly 20 bytes.
    pub fn from_slice(bytes: &[u8]) -> Result<Self> {
        let arr: [u8; ADDRESS_LENGTH] = bytes.try_into().map_err(|_| {
            ProtocolError::Deserialization(format!(
                "address must be {} bytes, got {}",
                ADDRESS_LENGTH,
                bytes.len()
            ))
        })?;
        Ok(Self(arr))
    }

    /// Returns the raw bytes of this address.
    pub fn as_bytes(&self) -> &[u8; ADDRESS_LENGTH] {
        &self.0
    }

    /// Derives an address from a SEC1 encoded secp256k1 public key.
    ///
    /// Accepts compressed (33 bytes) and uncompressed (65 bytes) encodings as
    /// well as the bare 64-byte `x || y` form.
    pub fn from_public_key(public_key: &[u8]) -> Result<Self> {
        let key = match public_key.len() {
            64 => {
                let mut tagged = [0u8; 65];
                tagged[0] = 0x04;
                tagged[1..].copy_from_slice(public_key);
                VerifyingKey::from_sec1_bytes(&tagged)
            }
            _ => VerifyingKey::from_sec1_bytes(public_key),
        }
        .map_err(|e| ProtocolError::InvalidPublicKey(e.to_string()))?;
        Ok(Self::from_verifying_key(&key))
    }

    fn from_verifying_key(key: &VerifyingKey) -> Self {
        let point = key.to_encoded_point(false);
        let hash = keccak256(&point.as_bytes()[1..]);
        let mut addr = [0u8; ADDRESS_LENGTH];
        addr.copy_from_slice(&hash[32 - ADDRESS_LENGTH..]);
        Self(addr)
    }

    /// Left-pads the address to a 32-byte word.
    pub fn to_word(&self) -> [u8; 32] {
        let mut word = [0u8; 32];
        word[32 - ADDRESS_LENGTH..].copy_from_slice(&self.0);
        word
    }
}

impl fmt::Display for Address {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "0x{}", hex::encode(self.0))
    }
}

impl fmt::Debug for Address {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Address({})", self)
    }
}

impl FromStr for Address {
    type Err = ProtocolError;

    /// Parses 40 hex characters, with or without a `0x` prefix.
    fn from_str(s: &str) -> Result<Self> {
        let digits = s.strip_prefix("0x").unwrap_or(s);
        let bytes = hex::decode(digits)
            .map_err(|e| ProtocolError::Deserialization(format!("invalid address hex: {}", e)))?;
        Self::from_slice(&bytes)
    }
}

/// The identity of this client, including its secret key.
#[derive(Clone)]
pub struct ClientIdentity {
    signing_key: SigningKey,
    address: Address,
}

impl ClientIdentity {
    /// Creates an identity from raw secret key bytes.
    ///
    /// Big-endian scalars shorter than 32 bytes are left-padded, since key
    /// exports commonly strip leading zeros.
    pub fn from_secret_key_bytes(bytes: &[u8]) -> Result<Self> {
        if bytes.is_empty() || bytes.len() > SECRET_KEY_LENGTH {
            return Err(ProtocolError::InvalidPrivateKey(format!(
                "secret key must be 1..={} bytes, got {}",
                SECRET_KEY_LENGTH,
                bytes.len()
            )));
        }
        let mut padded = [0u8; SECRET_KEY_LENGTH];
        padded[SECRET_KEY_LENGTH - bytes.len()..].copy_from_slice(bytes);

        let signing_key = SigningKey::from_slice(&padded)
            .map_err(|e| ProtocolError::InvalidPrivateKey(e.to_string()))?;
        let address = Address::from_verifying_key(signing_key.verifying_key());
        Ok(Self {
            signing_key,
            address,
        })
    }

    /// Returns the address derived from this identity's public key.
    pub fn address(&self) -> Address {
        self.address
    }

    /// Returns the uncompressed SEC1 public key (65 bytes).
    pub fn public_key_bytes(&self) -> Vec<u8> {
        self.signing_key
            .verifying_key()
            .to_encoded_point(false)
            .as_bytes()
            .to_vec()
    }

    /// Signs a 32-byte digest, returning `[recovery_id, r, s]`.
    pub fn sign_digest(&self, digest: &[u8; 32]) -> Result<[u8; SIGNATURE_LENGTH]> {
        let (signature, recovery_id) = self.signing_key.sign_prehash_recoverable(digest)?;
        let mut out = [0u8; SIGNATURE_LENGTH];
        out[0] = recovery_id.to_byte();
        out[1..].copy_from_slice(&signature.to_bytes());
        Ok(out)
    }
}

impl fmt::Debug for ClientIdentity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ClientIdentity")
            .field("address", &self.address)
            .field("secret_key", &"[REDACTED]")
            .finish()
    }
}

/// Recovers the signer address of a `[recovery_id, r, s]` signature.
pub fn recover_signer(digest: &[u8; 32], signature: &[u8]) -> Result<Address> {
    if signature.len() != SIGNATURE_LENGTH {
        return Err(ProtocolError::Signing(format!(
            "signature must be {} bytes, got {}",
            SIGNATURE_LENGTH,
            signature.len()
        )));
    }
    let recovery_id = RecoveryId::from_byte(signature[0])
        .ok_or_else(|| ProtocolError::Signing(format!("invalid recovery id {}", signature[0])))?;
    let sig = EcdsaSignature::from_slice(&signature[1..])?;
    let key = VerifyingKey::recover_from_prehash(digest, &sig, recovery_id)?;
    Ok(Address::from_verifying_key(&key))
}
