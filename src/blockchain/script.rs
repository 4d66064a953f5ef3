//! Pay-to-public-key-hash script verifier.
//!
//! A locking script is the fixed template
//! `OP_DUP OP_HASH160 <address> OP_EQUALVERIFY OP_CHECKSIG`; the unlocking
//! witness is a fixed-length signature followed by the raw public key.

use thiserror::Error;

use super::crypto::{hash160, verify_signature, Address, SIGNATURE_LEN};

/// Template for locking an output to an address
const P2PKH_TEMPLATE: [&str; 2] = ["OP_DUP OP_HASH160", "OP_EQUALVERIFY OP_CHECKSIG"];

/// Errors raised while parsing or executing a script
#[derive(Debug, Error, PartialEq, Eq)]
pub enum ScriptError {
    #[error("scriptSig too short: {0} bytes")]
    MalformedScriptSig(usize),

    #[error("Invalid address literal: {0}")]
    InvalidAddress(String),

    #[error("Stack underflow")]
    StackUnderflow,

    #[error("OP_EQUALVERIFY failed")]
    EqualVerifyFailed,

    #[error("OP_CHECKSIG failed")]
    CheckSigFailed,
}

/// The closed opcode set of the script language
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Opcode {
    Dup,
    Hash160,
    EqualVerify,
    CheckSig,
    /// A literal address; pushes the embedded public key hash
    PushAddress(Vec<u8>),
}

impl Opcode {
    fn parse(token: &str) -> Result<Self, ScriptError> {
        match token {
            "OP_DUP" => Ok(Opcode::Dup),
            "OP_HASH160" => Ok(Opcode::Hash160),
            "OP_EQUALVERIFY" => Ok(Opcode::EqualVerify),
            "OP_CHECKSIG" => Ok(Opcode::CheckSig),
            literal => Address(literal.to_string())
                .pub_key_hash()
                .map(Opcode::PushAddress)
                .map_err(|_| ScriptError::InvalidAddress(literal.to_string())),
        }
    }
}

/// A parsed locking script
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Script {
    ops: Vec<Opcode>,
}

impl Script {
    /// Parses a whitespace separated opcode sequence
    pub fn parse(script_pub_key: &str) -> Result<Self, ScriptError> {
        let ops = script_pub_key
            .split_whitespace()
            .map(Opcode::parse)
            .collect::<Result<Vec<_>, _>>()?;
        Ok(Script { ops })
    }

    pub fn ops(&self) -> &[Opcode] {
        &self.ops
    }

    /// Runs the script against an unlocking witness
    pub fn execute(&self, script_sig: &[u8]) -> Result<(), ScriptError> {
        if script_sig.len() <= SIGNATURE_LEN {
            return Err(ScriptError::MalformedScriptSig(script_sig.len()));
        }
        let (signature, public_key) = script_sig.split_at(SIGNATURE_LEN);

        let mut stack: Vec<Vec<u8>> = vec![signature.to_vec(), public_key.to_vec()];

        for op in &self.ops {
            match op {
                Opcode::Dup => {
                    let top = stack.last().cloned().ok_or(ScriptError::StackUnderflow)?;
                    stack.push(top);
                }
                Opcode::Hash160 => {
                    let item = stack.pop().ok_or(ScriptError::StackUnderflow)?;
                    stack.push(hash160(&item).as_bytes().to_vec());
                }
                Opcode::EqualVerify => {
                    let a = stack.pop().ok_or(ScriptError::StackUnderflow)?;
                    let b = stack.pop().ok_or(ScriptError::StackUnderflow)?;
                    if a != b {
                        return Err(ScriptError::EqualVerifyFailed);
                    }
                }
                Opcode::CheckSig => {
                    // the challenge is the public key hash, not a transaction digest
                    let challenge = hash160(public_key);
                    if !verify_signature(challenge.as_bytes(), signature, public_key) {
                        return Err(ScriptError::CheckSigFailed);
                    }
                }
                Opcode::PushAddress(pub_key_hash) => stack.push(pub_key_hash.clone()),
            }
        }

        Ok(())
    }
}

/// Builds the locking script paying to an address
pub fn p2pkh(address: &Address) -> String {
    format!("{} {} {}", P2PKH_TEMPLATE[0], address, P2PKH_TEMPLATE[1])
}

/// Returns true if the witness satisfies the locking script.
///
/// Unparseable scripts and malformed witnesses never verify.
pub fn verify_ownership(script_sig: &[u8], script_pub_key: &str) -> bool {
    Script::parse(script_pub_key)
        .and_then(|script| script.execute(script_sig))
        .is_ok()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::blockchain::account::Account;

    #[test]
    fn test_parse_p2pkh() {
        let account = Account::new();
        let script = Script::parse(&p2pkh(account.address())).unwrap();

        assert_eq!(script.ops().len(), 5);
        assert_eq!(script.ops()[0], Opcode::Dup);
        assert_eq!(
            script.ops()[2],
            Opcode::PushAddress(account.address().pub_key_hash().unwrap())
        );
        assert_eq!(script.ops()[4], Opcode::CheckSig);
    }

    #[test]
    fn test_owner_can_unlock() {
        let account = Account::new();
        assert!(verify_ownership(&account.script_sig(), &p2pkh(account.address())));
    }

    #[test]
    fn test_other_account_cannot_unlock() {
        let owner = Account::new();
        let thief = Account::new();
        let script = Script::parse(&p2pkh(owner.address())).unwrap();

        assert_eq!(
            script.execute(&thief.script_sig()),
            Err(ScriptError::EqualVerifyFailed)
        );
    }

    #[test]
    fn test_tampered_signature_fails_checksig() {
        let account = Account::new();
        let mut script_sig = account.script_sig();
        script_sig[5] ^= 0xff;

        let script = Script::parse(&p2pkh(account.address())).unwrap();
        assert_eq!(script.execute(&script_sig), Err(ScriptError::CheckSigFailed));
    }

    #[test]
    fn test_malformed_inputs_never_verify() {
        let account = Account::new();
        let script_pub_key = p2pkh(account.address());

        assert!(!verify_ownership(&[], &script_pub_key));
        assert!(!verify_ownership(&account.script_sig()[..SIGNATURE_LEN], &script_pub_key));
        assert!(!verify_ownership(&account.script_sig(), "OP_DUP OP_HASH160 0OIl OP_EQUALVERIFY"));
    }

    #[test]
    fn test_underflow_is_an_error() {
        let account = Account::new();
        let script = Script::parse("OP_DUP OP_EQUALVERIFY OP_EQUALVERIFY").unwrap();
        assert_eq!(
            script.execute(&account.script_sig()),
            Err(ScriptError::StackUnderflow)
        );
    }
}
