use k256::ecdsa::{signature::Verifier, Signature, VerifyingKey};
use ripemd::Ripemd160;
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use thiserror::Error;

use std::fmt;
use std::str::FromStr;

/// Version byte prefixed to every address payload
pub const ADDRESS_VERSION: u8 = 0x00;

/// Number of checksum bytes appended to an address payload
pub const ADDRESS_CHECKSUM_LEN: usize = 4;

/// Length of a serialized signature (r || s, 32 bytes each)
pub const SIGNATURE_LEN: usize = 64;

/// Length of a raw public key (x || y, 32 bytes each)
pub const PUBLIC_KEY_LEN: usize = 64;

/// Errors that can occur during cryptographic operations
#[derive(Debug, Error)]
pub enum CryptoError {
    #[error("Invalid public key: {0}")]
    InvalidPublicKey(String),

    #[error("Invalid signature: {0}")]
    InvalidSignature(String),

    #[error("Invalid address: {0}")]
    InvalidAddress(String),

    #[error("Decoding error: {0}")]
    DecodingError(String),
}

/// A digest used as block identity, transaction identity and chain linkage.
///
/// The byte sequence may be empty: the genesis block has no parent and the
/// coinbase sentinel input spends nothing.
#[derive(Clone, Default, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct Hash(Vec<u8>);

impl Hash {
    /// Creates an empty hash
    pub fn empty() -> Self {
        Hash(Vec::new())
    }

    /// Wraps raw digest bytes
    pub fn from_bytes(bytes: impl Into<Vec<u8>>) -> Self {
        Hash(bytes.into())
    }

    /// Parses a hex encoded hash
    pub fn from_hex(s: &str) -> Result<Self, CryptoError> {
        hex::decode(s)
            .map(Hash)
            .map_err(|e| CryptoError::DecodingError(e.to_string()))
    }

    pub fn as_bytes(&self) -> &[u8] {
        &self.0
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    pub fn to_hex(&self) -> String {
        hex::encode(&self.0)
    }
}

impl AsRef<[u8]> for Hash {
    fn as_ref(&self) -> &[u8] {
        &self.0
    }
}

impl fmt::Display for Hash {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.to_hex())
    }
}

impl fmt::Debug for Hash {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Hash({})", self.to_hex())
    }
}

/// Computes the SHA-256 digest of the given bytes
pub fn hash256(data: &[u8]) -> Hash {
    Hash(Sha256::digest(data).to_vec())
}

/// Computes RIPEMD-160 over SHA-256 of the given bytes
pub fn hash160(data: &[u8]) -> Hash {
    let sha256_hash = Sha256::digest(data);
    Hash(Ripemd160::digest(sha256_hash).to_vec())
}

/// First four bytes of the double SHA-256 of the payload
pub fn checksum(payload: &[u8]) -> Vec<u8> {
    let digest = hash256(hash256(payload).as_bytes());
    digest.as_bytes()[..ADDRESS_CHECKSUM_LEN].to_vec()
}

/// A checksummed, base58 encoded public key hash
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Address(pub String);

impl Address {
    /// Derives the address of a raw public key
    pub fn from_public_key(public_key: &[u8]) -> Self {
        let mut payload = vec![ADDRESS_VERSION];
        payload.extend_from_slice(hash160(public_key).as_bytes());
        let check = checksum(&payload);
        payload.extend_from_slice(&check);

        Address(bs58::encode(payload).into_string())
    }

    /// Decodes the address and returns the embedded public key hash,
    /// stripped of the version byte and the checksum
    pub fn pub_key_hash(&self) -> Result<Vec<u8>, CryptoError> {
        let decoded = bs58::decode(&self.0)
            .into_vec()
            .map_err(|e| CryptoError::DecodingError(e.to_string()))?;

        if decoded.len() <= 1 + ADDRESS_CHECKSUM_LEN {
            return Err(CryptoError::InvalidAddress(format!(
                "address {} is too short",
                self.0
            )));
        }

        Ok(decoded[1..decoded.len() - ADDRESS_CHECKSUM_LEN].to_vec())
    }

    /// Checks that the trailing checksum matches the versioned payload
    pub fn validate(&self) -> bool {
        let decoded = match bs58::decode(&self.0).into_vec() {
            Ok(decoded) => decoded,
            Err(_) => return false,
        };
        if decoded.len() <= 1 + ADDRESS_CHECKSUM_LEN {
            return false;
        }

        let (payload, actual) = decoded.split_at(decoded.len() - ADDRESS_CHECKSUM_LEN);
        checksum(payload) == actual
    }
}

impl fmt::Display for Address {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl FromStr for Address {
    type Err = CryptoError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let address = Address(s.to_string());
        if !address.validate() {
            return Err(CryptoError::InvalidAddress(s.to_string()));
        }
        Ok(address)
    }
}

/// Rebuilds a verifying key from a raw `x || y` public key
///
/// # Arguments
///
/// * `public_key` - The two affine coordinates, equal length each
///
/// # Returns
///
/// The verifying key, or an error if the point is not on the curve
pub fn verifying_key_from_raw(public_key: &[u8]) -> Result<VerifyingKey, CryptoError> {
    if public_key.is_empty() || public_key.len() % 2 != 0 {
        return Err(CryptoError::InvalidPublicKey(format!(
            "expected two equal coordinates, got {} bytes",
            public_key.len()
        )));
    }

    let (x, y) = public_key.split_at(public_key.len() / 2);
    let mut sec1 = Vec::with_capacity(1 + public_key.len());
    sec1.push(0x04);
    sec1.extend_from_slice(x);
    sec1.extend_from_slice(y);

    VerifyingKey::from_sec1_bytes(&sec1).map_err(|e| CryptoError::InvalidPublicKey(e.to_string()))
}

/// Rebuilds a signature from a raw `r || s` byte string
///
/// # Arguments
///
/// * `signature` - Two 32 byte big-endian scalars
///
/// # Returns
///
/// The signature, or an error if either scalar is out of range
pub fn signature_from_raw(signature: &[u8]) -> Result<Signature, CryptoError> {
    if signature.len() != SIGNATURE_LEN {
        return Err(CryptoError::InvalidSignature(format!(
            "expected {} bytes, got {}",
            SIGNATURE_LEN,
            signature.len()
        )));
    }

    Signature::from_slice(signature).map_err(|e| CryptoError::InvalidSignature(e.to_string()))
}

/// Verifies a raw signature over a message against a raw public key
pub fn verify_signature(message: &[u8], signature: &[u8], public_key: &[u8]) -> bool {
    let verifying_key = match verifying_key_from_raw(public_key) {
        Ok(key) => key,
        Err(_) => return false,
    };
    let signature = match signature_from_raw(signature) {
        Ok(sig) => sig,
        Err(_) => return false,
    };

    verifying_key.verify(message, &signature).is_ok()
}
