//! Authorization error types.

use thiserror::Error;

/// Every way a signature check can fail. Callers map all of them to an
/// authorization rejection.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum AuthzError {
    #[error("malformed signature: {0}")]
    MalformedSignature(String),

    #[error("public key recovery failed: {0}")]
    RecoveryFailed(String),

    #[error("signer {recovered} does not match expected address {expected}")]
    AddressMismatch { expected: String, recovered: String },

    #[error("malformed address '{0}'")]
    MalformedAddress(String),
}
