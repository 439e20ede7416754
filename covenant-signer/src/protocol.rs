//! HTTP wire format of the signing API.
//!
//! Every binary value travels as lowercase hex inside JSON.

use bitcoin::consensus::encode::{deserialize_hex, serialize_hex};
use bitcoin::secp256k1::{schnorr, PublicKey};
use bitcoin::{Script, ScriptBuf, Transaction};
use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Path of the signing endpoint.
pub const SIGN_UNBONDING_TX_PATH: &str = "/v1/sign-unbonding-tx";

/// Why a request body could not be turned into typed values.
///
/// The messages are returned to callers verbatim.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum RequestParseError {
    #[error("invalid request payload")]
    InvalidPayload,

    #[error("invalid staking output pk script")]
    InvalidPkScript,

    #[error("invalid covenant public key")]
    InvalidCovenantKey,

    #[error("invalid unbonding transaction")]
    InvalidUnbondingTx,

    #[error("invalid staker unbonding signature")]
    InvalidSignature,
}

/// Request to co-sign an unbonding transaction.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SignUnbondingTxRequest {
    pub staking_output_pk_script_hex: String,
    pub unbonding_tx_hex: String,
    pub staker_unbonding_sig_hex: String,
    /// 33-byte compressed key of the covenant member asked to sign
    pub covenant_public_key: String,
}

/// Decoded [`SignUnbondingTxRequest`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ParsedSignRequest {
    pub staking_output_pk_script: ScriptBuf,
    pub unbonding_tx: Transaction,
    pub staker_unbonding_sig: schnorr::Signature,
    pub covenant_public_key: PublicKey,
}

impl SignUnbondingTxRequest {
    pub fn new(
        staking_output_pk_script: &Script,
        unbonding_tx: &Transaction,
        staker_unbonding_sig: &schnorr::Signature,
        covenant_public_key: &PublicKey,
    ) -> Self {
        Self {
            staking_output_pk_script_hex: hex::encode(staking_output_pk_script.as_bytes()),
            unbonding_tx_hex: serialize_hex(unbonding_tx),
            staker_unbonding_sig_hex: hex::encode(staker_unbonding_sig.serialize()),
            covenant_public_key: hex::encode(covenant_public_key.serialize()),
        }
    }

    /// Decodes the fields in a fixed order and reports the first one that fails.
    pub fn parse(&self) -> Result<ParsedSignRequest, RequestParseError> {
        let staking_output_pk_script = hex::decode(&self.staking_output_pk_script_hex)
            .map(ScriptBuf::from_bytes)
            .map_err(|_| RequestParseError::InvalidPkScript)?;

        let covenant_public_key = parse_covenant_key(&self.covenant_public_key)?;

        let unbonding_tx: Transaction = deserialize_hex(&self.unbonding_tx_hex)
            .map_err(|_| RequestParseError::InvalidUnbondingTx)?;

        let staker_unbonding_sig = hex::decode(&self.staker_unbonding_sig_hex)
            .ok()
            .and_then(|bytes| schnorr::Signature::from_slice(&bytes).ok())
            .ok_or(RequestParseError::InvalidSignature)?;

        Ok(ParsedSignRequest {
            staking_output_pk_script,
            unbonding_tx,
            staker_unbonding_sig,
            covenant_public_key,
        })
    }
}

fn parse_covenant_key(key_hex: &str) -> Result<PublicKey, RequestParseError> {
    let bytes = hex::decode(key_hex).map_err(|_| RequestParseError::InvalidCovenantKey)?;
    if bytes.len() != 33 {
        return Err(RequestParseError::InvalidCovenantKey);
    }
    PublicKey::from_slice(&bytes).map_err(|_| RequestParseError::InvalidCovenantKey)
}

/// Covenant signature over the unbonding transaction.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SignUnbondingTxResponse {
    pub signature_hex: String,
}

impl SignUnbondingTxResponse {
    pub fn new(signature: &schnorr::Signature) -> Self {
        Self {
            signature_hex: hex::encode(signature.serialize()),
        }
    }

    pub fn signature(&self) -> Option<schnorr::Signature> {
        let bytes = hex::decode(&self.signature_hex).ok()?;
        schnorr::Signature::from_slice(&bytes).ok()
    }
}

/// Envelope of every successful response.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PublicResponse<T> {
    pub data: T,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ErrorCode {
    BadRequest,
    InternalServiceError,
    Unauthorized,
    RequestTooLarge,
}

/// Body of every error response.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ErrorResponse {
    #[serde(rename = "errorCode")]
    pub error_code: ErrorCode,
    pub message: String,
}

impl ErrorResponse {
    pub fn new(error_code: ErrorCode, message: impl Into<String>) -> Self {
        Self {
            error_code,
            message: message.into(),
        }
    }
}
