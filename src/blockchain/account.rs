use k256::ecdsa::{signature::Signer, Signature, SigningKey, VerifyingKey};
use rand::rngs::OsRng;

use super::crypto::{hash160, Address, CryptoError};

/// A key pair able to lock outputs to its address and unlock them again
#[derive(Debug, Clone)]
pub struct Account {
    signing_key: SigningKey,
    /// Raw `x || y` public key
    public_key: Vec<u8>,
    address: Address,
}

impl Account {
    /// Creates an account with a random key pair
    pub fn new() -> Self {
        Self::from_signing_key(SigningKey::random(&mut OsRng))
    }

    /// Restores an account from an exported secret key
    ///
    /// # Arguments
    ///
    /// * `secret_key_bytes` - The 32 byte secret scalar
    pub fn from_secret_key(secret_key_bytes: &[u8]) -> Result<Self, CryptoError> {
        let signing_key = SigningKey::from_slice(secret_key_bytes)
            .map_err(|e| CryptoError::InvalidPublicKey(e.to_string()))?;
        Ok(Self::from_signing_key(signing_key))
    }

    fn from_signing_key(signing_key: SigningKey) -> Self {
        let verifying_key = VerifyingKey::from(&signing_key);
        let encoded = verifying_key.to_encoded_point(false);
        // drop the SEC1 0x04 tag, keep x || y
        let public_key = encoded.as_bytes()[1..].to_vec();
        let address = Address::from_public_key(&public_key);

        Account {
            signing_key,
            public_key,
            address,
        }
    }

    pub fn address(&self) -> &Address {
        &self.address
    }

    pub fn public_key(&self) -> &[u8] {
        &self.public_key
    }

    /// Signs a message, returning the fixed-length `r || s` encoding
    pub fn sign(&self, message: &[u8]) -> Vec<u8> {
        let signature: Signature = self.signing_key.sign(message);
        signature.to_bytes().to_vec()
    }

    /// Builds the unlocking witness for outputs locked to this account:
    /// a signature over `hash160(public_key)` followed by the public key
    pub fn script_sig(&self) -> Vec<u8> {
        let mut script_sig = self.sign(hash160(&self.public_key).as_bytes());
        script_sig.extend_from_slice(&self.public_key);
        script_sig
    }

    pub fn export_secret_key(&self) -> Vec<u8> {
        self.signing_key.to_bytes().to_vec()
    }
}

impl Default for Account {
    fn default() -> Self {
        Self::new()
    }
}
