//! Decides whether an unbonding request may be signed.
//!
//! Nothing reaches the signing backend until the request has been checked
//! against the chain and the parameters active when the stake was included:
//!
//! ```text
//!   request ──► shape ──► chain lookup ──► params@inclusion ──► membership
//!                                                                   │
//!   signature ◄── backend ◄── staker sig ◄── expected output ◄── maturity,
//!                                                              parse, bounds
//! ```

use std::sync::Arc;

use bitcoin::secp256k1::{schnorr, PublicKey};
use bitcoin::{Address, Amount, CompressedPublicKey, Network, Script, Transaction, Txid};
use covenant_staking::{
    check_pre_signed_unbonding_tx_sanity, parse_v0_staking_tx, verify_transaction_sig_with_output,
    StakingError, StakingInfo, UnbondingInfo,
};
use thiserror::Error;
use tracing::{debug, info};

use crate::backend::{BackendError, ExternalBtcSigner, SigningRequest};
use crate::chain::{BtcChainInfo, ChainInfoError};
use crate::params::{BabylonParamsRetriever, ParamsError};

/// Who is at fault for a failed request.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorKind {
    /// The caller sent something that must not be signed
    InvalidRequest,
    /// The service could not reach a decision
    Internal,
}

/// Why a signing request was not signed.
#[derive(Debug, Error)]
pub enum PolicyError {
    #[error("invalid unbonding transaction: {0}")]
    MalformedUnbondingTx(#[source] StakingError),

    #[error("staking output pk script is not a taproot script")]
    NotTaprootScript,

    #[error("staking transaction is not confirmed: {0}")]
    StakingTxUnavailable(#[source] ChainInfoError),

    #[error("key {key} is not a covenant member at height {height}")]
    NotCovenantMember { key: String, height: u32 },

    #[error(
        "staking transaction {txid} has {current} confirmations, {required} required"
    )]
    NotEnoughConfirmations {
        txid: Txid,
        current: i64,
        required: u16,
    },

    #[error("invalid staking transaction: {0}")]
    InvalidStakingTx(#[source] StakingError),

    #[error("unbonding transaction spends output {actual}, staking output index is {expected}")]
    InvalidInputIndex { expected: usize, actual: u32 },

    #[error("staking time {time} outside of [{min}, {max}]")]
    StakingTimeOutOfBounds { time: u16, min: u16, max: u16 },

    #[error("staking amount {amount} outside of [{min}, {max}]")]
    StakingAmountOutOfBounds {
        amount: Amount,
        min: Amount,
        max: Amount,
    },

    #[error("unbonding output does not match expected unbonding output")]
    UnbondingOutputMismatch,

    #[error("invalid staker unbonding signature: {0}")]
    InvalidStakerSignature(#[source] StakingError),

    #[error("chain info request failed: {0}")]
    ChainInfo(#[source] ChainInfoError),

    #[error("failed to retrieve params: {0}")]
    Params(#[from] ParamsError),

    #[error("staking amount {amount} does not cover unbonding fee {fee}")]
    StakingOutputValueTooLow { amount: Amount, fee: Amount },

    #[error("failed to rebuild staking scripts: {0}")]
    ScriptReconstruction(#[source] StakingError),

    #[error("signing backend failed: {0}")]
    Backend(#[from] BackendError),
}

impl PolicyError {
    pub fn kind(&self) -> ErrorKind {
        match self {
            PolicyError::MalformedUnbondingTx(_)
            | PolicyError::NotTaprootScript
            | PolicyError::StakingTxUnavailable(_)
            | PolicyError::NotCovenantMember { .. }
            | PolicyError::NotEnoughConfirmations { .. }
            | PolicyError::InvalidStakingTx(_)
            | PolicyError::InvalidInputIndex { .. }
            | PolicyError::StakingTimeOutOfBounds { .. }
            | PolicyError::StakingAmountOutOfBounds { .. }
            | PolicyError::UnbondingOutputMismatch
            | PolicyError::InvalidStakerSignature(_) => ErrorKind::InvalidRequest,

            PolicyError::ChainInfo(_)
            | PolicyError::Params(_)
            | PolicyError::StakingOutputValueTooLow { .. }
            | PolicyError::ScriptReconstruction(_)
            | PolicyError::Backend(_) => ErrorKind::Internal,
        }
    }
}

fn chain_error(err: ChainInfoError) -> PolicyError {
    match err {
        ChainInfoError::NotFound(_) | ChainInfoError::NotInChain(_) => {
            PolicyError::StakingTxUnavailable(err)
        }
        ChainInfoError::Rpc(_) | ChainInfoError::Task(_) => PolicyError::ChainInfo(err),
    }
}

/// Validates unbonding requests and, when they hold up, obtains the covenant
/// signature from the backend.
///
/// Every collaborator is shared and read-only, so one engine serves all
/// requests concurrently.
pub struct SigningPolicyEngine {
    signer: Arc<dyn ExternalBtcSigner>,
    chain_info: Arc<dyn BtcChainInfo>,
    params: Arc<dyn BabylonParamsRetriever>,
    network: Network,
}

impl SigningPolicyEngine {
    pub fn new(
        signer: Arc<dyn ExternalBtcSigner>,
        chain_info: Arc<dyn BtcChainInfo>,
        params: Arc<dyn BabylonParamsRetriever>,
        network: Network,
    ) -> Self {
        Self {
            signer,
            chain_info,
            params,
            network,
        }
    }

    /// Signs `unbonding_tx` as `covenant_public_key` if it is a legitimate
    /// early unbonding of a mature stake paying to `staking_output_pk_script`.
    pub async fn sign_unbonding_transaction(
        &self,
        staking_output_pk_script: &Script,
        unbonding_tx: &Transaction,
        staker_unbonding_sig: &schnorr::Signature,
        covenant_public_key: &PublicKey,
    ) -> Result<schnorr::Signature, PolicyError> {
        check_pre_signed_unbonding_tx_sanity(unbonding_tx)
            .map_err(PolicyError::MalformedUnbondingTx)?;

        if !staking_output_pk_script.is_p2tr() {
            return Err(PolicyError::NotTaprootScript);
        }

        let staking_outpoint = unbonding_tx.input[0].previous_output;
        let staking_txid = staking_outpoint.txid;

        let staking_tx_info = self
            .chain_info
            .tx_by_hash(&staking_txid, staking_output_pk_script)
            .await
            .map_err(chain_error)?;

        let best_height = self
            .chain_info
            .best_block_height()
            .await
            .map_err(PolicyError::ChainInfo)?;

        let inclusion_height = staking_tx_info.inclusion_height;
        let params = self
            .params
            .params_by_height(u64::from(inclusion_height))
            .await?;

        if !params.is_covenant_member(covenant_public_key) {
            return Err(PolicyError::NotCovenantMember {
                key: hex::encode(covenant_public_key.serialize()),
                height: inclusion_height,
            });
        }

        // Both heights come from separate calls, a reorg in between can make
        // this negative.
        let confirmations = i64::from(best_height) - i64::from(inclusion_height) + 1;
        if confirmations < i64::from(params.confirmation_depth) {
            return Err(PolicyError::NotEnoughConfirmations {
                txid: staking_txid,
                current: confirmations,
                required: params.confirmation_depth,
            });
        }

        let covenant_keys = params.covenant_x_only_keys();
        let parsed = parse_v0_staking_tx(
            &staking_tx_info.tx,
            &params.magic_bytes,
            &covenant_keys,
            params.covenant_quorum,
        )
        .map_err(PolicyError::InvalidStakingTx)?;

        if staking_outpoint.vout as usize != parsed.staking_output_idx {
            return Err(PolicyError::InvalidInputIndex {
                expected: parsed.staking_output_idx,
                actual: staking_outpoint.vout,
            });
        }

        let staking_time = parsed.op_return_data.staking_time;
        if staking_time < params.min_staking_time || staking_time > params.max_staking_time {
            return Err(PolicyError::StakingTimeOutOfBounds {
                time: staking_time,
                min: params.min_staking_time,
                max: params.max_staking_time,
            });
        }

        let staking_amount = parsed.staking_output.value;
        if staking_amount < params.min_staking_amount || staking_amount > params.max_staking_amount
        {
            return Err(PolicyError::StakingAmountOutOfBounds {
                amount: staking_amount,
                min: params.min_staking_amount,
                max: params.max_staking_amount,
            });
        }

        let unbonding_value = staking_amount
            .checked_sub(params.unbonding_fee)
            .filter(|value| *value > Amount::ZERO)
            .ok_or(PolicyError::StakingOutputValueTooLow {
                amount: staking_amount,
                fee: params.unbonding_fee,
            })?;

        let staker_key = parsed.op_return_data.staker_public_key;
        let finality_provider_keys = [parsed.op_return_data.finality_provider_public_key];

        let expected_unbonding = UnbondingInfo::build(
            &staker_key,
            &finality_provider_keys,
            &covenant_keys,
            params.covenant_quorum,
            params.unbonding_time,
            unbonding_value,
        )
        .map_err(PolicyError::ScriptReconstruction)?;

        if unbonding_tx.output[0] != expected_unbonding.unbonding_output {
            return Err(PolicyError::UnbondingOutputMismatch);
        }

        let staking_info = StakingInfo::build(
            &staker_key,
            &finality_provider_keys,
            &covenant_keys,
            params.covenant_quorum,
            staking_time,
            staking_amount,
        )
        .map_err(PolicyError::ScriptReconstruction)?;

        let unbonding_path = staking_info
            .unbonding_path_spend_info()
            .map_err(PolicyError::ScriptReconstruction)?;

        verify_transaction_sig_with_output(
            unbonding_tx,
            &parsed.staking_output,
            &unbonding_path.leaf_script,
            &staker_key,
            staker_unbonding_sig,
        )
        .map_err(PolicyError::InvalidStakerSignature)?;

        debug!(
            "Unbonding of staking transaction {} passed validation",
            staking_txid
        );

        let covenant_address =
            Address::p2wpkh(&CompressedPublicKey(*covenant_public_key), self.network);

        let result = self
            .signer
            .raw_signature(&SigningRequest {
                staking_output: parsed.staking_output,
                unbonding_tx: unbonding_tx.clone(),
                covenant_public_key: *covenant_public_key,
                covenant_address,
                spend_description: unbonding_path.into(),
            })
            .await?;

        info!(
            "Signed unbonding transaction {} for staking transaction {} as covenant {}",
            unbonding_tx.compute_txid(),
            staking_txid,
            hex::encode(covenant_public_key.serialize())
        );

        Ok(result.signature)
    }
}
