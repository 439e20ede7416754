//! Errors raised while building, parsing or signing staking scripts.

use thiserror::Error;

/// Errors from the staking script engine.
#[derive(Debug, Error)]
pub enum StakingError {
    #[error("no keys provided for {what}")]
    NoKeys { what: &'static str },

    #[error("duplicate key {key} in {what}")]
    DuplicateKey { what: &'static str, key: String },

    #[error("invalid quorum {quorum} for {keys} keys")]
    InvalidQuorum { quorum: u32, keys: usize },

    #[error("taproot tree construction failed: {0}")]
    TaprootBuilder(String),

    #[error("leaf script is not part of the taproot tree")]
    MissingLeaf,

    #[error("invalid tag length {0}, expected 4 bytes")]
    InvalidTagLength(usize),

    #[error("staking tx must have at least 2 outputs, got {0}")]
    NotEnoughOutputs(usize),

    #[error("transaction does not have expected op return output")]
    MissingOpReturn,

    #[error("multiple op return outputs found")]
    MultipleOpReturns,

    #[error("op return tag mismatch: expected {expected}, got {actual}")]
    TagMismatch { expected: String, actual: String },

    #[error("unsupported op return version {0}")]
    UnsupportedVersion(u8),

    #[error("invalid op return data: {0}")]
    InvalidOpReturn(String),

    #[error("staking output not found in potential staking transaction")]
    MissingStakingOutput,

    #[error("multiple staking outputs found")]
    MultipleStakingOutputs,

    #[error("simple transfer tx must have exactly one input, got {0}")]
    InvalidInputCount(usize),

    #[error("simple transfer tx must have exactly one output, got {0}")]
    InvalidOutputCount(usize),

    #[error("simple transfer tx output must have positive value")]
    ZeroValueOutput,

    #[error("pre-signed tx must not have locktime")]
    HasLockTime,

    #[error("pre-signed tx must not be replaceable")]
    Replaceable,

    #[error("pre-signed tx must not have signature script or witness")]
    AlreadySigned,

    #[error("pre-signed tx has unsupported version {0}")]
    UnsupportedTxVersion(i32),

    #[error("sighash computation failed: {0}")]
    Sighash(String),

    #[error("invalid schnorr signature: {0}")]
    InvalidSignature(#[source] bitcoin::secp256k1::Error),
}
