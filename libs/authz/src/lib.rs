//! # cp-authz
//!
//! Signature checks that gate task intake.
//!
//! A task is accepted only if a 65-byte `r‖s‖v` secp256k1 signature over a
//! known message recovers to the expected chain address. Two message
//! framings are in use:
//!
//! - [`Framing::Raw`]: Keccak-256 of the message bytes (proof tasks,
//!   message is `node_id‖task_id`).
//! - [`Framing::PersonalSign`]: Keccak-256 of
//!   `"\x19Ethereum Signed Message:\n" + len + message` (marketplace jobs).
//!
//! A trailing `v` of 27/28 is normalized to 0/1 before recovery.

mod address;
mod error;

pub use address::Address;
pub use error::AuthzError;
pub use k256::ecdsa::SigningKey;

use k256::ecdsa::{RecoveryId, Signature, VerifyingKey};
use sha3::{Digest, Keccak256};

/// Prefix for personal-sign messages.
pub const PERSONAL_SIGN_PREFIX: &str = "\x19Ethereum Signed Message:\n";

/// How the signed message was hashed.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Framing {
    Raw,
    PersonalSign,
}

pub fn keccak256(data: &[u8]) -> [u8; 32] {
    Keccak256::digest(data).into()
}

/// Hash `message` under `framing`. This is the prehash that was signed.
pub fn message_hash(message: &[u8], framing: Framing) -> [u8; 32] {
    match framing {
        Framing::Raw => keccak256(message),
        Framing::PersonalSign => {
            let mut hasher = Keccak256::new();
            hasher.update(PERSONAL_SIGN_PREFIX.as_bytes());
            hasher.update(message.len().to_string().as_bytes());
            hasher.update(message);
            hasher.finalize().into()
        }
    }
}

fn decode_signature(signature: &str) -> Result<(Signature, RecoveryId), AuthzError> {
    let trimmed = signature.trim();
    let digits = trimmed.strip_prefix("0x").unwrap_or(trimmed);
    let bytes = hex::decode(digits).map_err(|e| AuthzError::MalformedSignature(e.to_string()))?;
    if bytes.len() != 65 {
        return Err(AuthzError::MalformedSignature(format!(
            "expected 65 bytes, got {}",
            bytes.len()
        )));
    }

    let v = match bytes[64] {
        27 | 28 => bytes[64] - 27,
        v => v,
    };
    let recovery_id = RecoveryId::from_byte(v)
        .ok_or_else(|| AuthzError::MalformedSignature(format!("invalid recovery id {v}")))?;
    let sig = Signature::from_slice(&bytes[..64]).map_err(|e| AuthzError::MalformedSignature(e.to_string()))?;
    Ok((sig, recovery_id))
}

/// Recover the signer address of `signature` (hex, optional `0x`) over `message`.
pub fn recover(message: &[u8], signature: &str, framing: Framing) -> Result<Address, AuthzError> {
    let (sig, recovery_id) = decode_signature(signature)?;
    let prehash = message_hash(message, framing);
    let key = VerifyingKey::recover_from_prehash(&prehash, &sig, recovery_id)
        .map_err(|e| AuthzError::RecoveryFailed(e.to_string()))?;
    Ok(Address::from_verifying_key(&key))
}

/// True when `signature` over `message` was produced by `expected`.
///
/// A mismatch is `Ok(false)`; malformed inputs and failed recovery are errors.
pub fn verify(expected: &str, message: &[u8], signature: &str, framing: Framing) -> Result<bool, AuthzError> {
    let expected: Address = expected.parse()?;
    Ok(recover(message, signature, framing)? == expected)
}

/// Like [`verify`] but turns a mismatch into [`AuthzError::AddressMismatch`].
pub fn ensure_signed_by(
    expected: &str,
    message: &[u8],
    signature: &str,
    framing: Framing,
) -> Result<Address, AuthzError> {
    let want: Address = expected.parse()?;
    let got = recover(message, signature, framing)?;
    if got != want {
        return Err(AuthzError::AddressMismatch {
            expected: want.to_string(),
            recovered: got.to_string(),
        });
    }
    Ok(got)
}

/// Sign `message` and return `0x`-prefixed `r‖s‖v` hex with `v` in 27/28.
pub fn sign(key: &SigningKey, message: &[u8], framing: Framing) -> Result<String, AuthzError> {
    let prehash = message_hash(message, framing);
    let (sig, recovery_id) = key
        .sign_prehash_recoverable(&prehash)
        .map_err(|e| AuthzError::MalformedSignature(e.to_string()))?;
    let mut bytes = sig.to_bytes().to_vec();
    bytes.push(recovery_id.to_byte() + 27);
    Ok(format!("0x{}", hex::encode(bytes)))
}

/// Address controlled by `key`.
pub fn address_of(key: &SigningKey) -> Address {
    Address::from_verifying_key(key.verifying_key())
}
