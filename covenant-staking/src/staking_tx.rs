//! Identifiable (V0) staking transactions.
//!
//! A V0 staking transaction carries, next to the staking output, an
//! OP_RETURN output announcing who staked to whom and for how long:
//!
//! ```text
//! OP_RETURN OP_PUSHBYTES_71 <magic:4> <version:1> <staker:32> <fp:32> <staking_time:2 BE>
//! ```

use bitcoin::absolute::LockTime;
use bitcoin::opcodes::all::{OP_PUSHBYTES_71, OP_RETURN};
use bitcoin::script::PushBytesBuf;
use bitcoin::secp256k1::XOnlyPublicKey;
use bitcoin::transaction::Version;
use bitcoin::{Amount, ScriptBuf, Transaction, TxOut};

use crate::error::StakingError;
use crate::scripts::StakingInfo;

/// Length of the magic tag identifying the protocol instance.
pub const TAG_LEN: usize = 4;

/// Length of the OP_RETURN payload of a V0 staking transaction.
pub const V0_OP_RETURN_DATA_SIZE: usize = TAG_LEN + 1 + 32 + 32 + 2;

const V0_VERSION: u8 = 0;

/// Decoded payload of a V0 OP_RETURN output.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct V0OpReturnData {
    pub magic_bytes: [u8; TAG_LEN],
    pub version: u8,
    pub staker_public_key: XOnlyPublicKey,
    pub finality_provider_public_key: XOnlyPublicKey,
    pub staking_time: u16,
}

impl V0OpReturnData {
    pub fn new(
        magic_bytes: &[u8],
        staker_public_key: XOnlyPublicKey,
        finality_provider_public_key: XOnlyPublicKey,
        staking_time: u16,
    ) -> Result<Self, StakingError> {
        let magic_bytes: [u8; TAG_LEN] = magic_bytes
            .try_into()
            .map_err(|_| StakingError::InvalidTagLength(magic_bytes.len()))?;

        Ok(Self {
            magic_bytes,
            version: V0_VERSION,
            staker_public_key,
            finality_provider_public_key,
            staking_time,
        })
    }

    pub fn to_bytes(&self) -> [u8; V0_OP_RETURN_DATA_SIZE] {
        let mut out = [0u8; V0_OP_RETURN_DATA_SIZE];
        out[..4].copy_from_slice(&self.magic_bytes);
        out[4] = self.version;
        out[5..37].copy_from_slice(&self.staker_public_key.serialize());
        out[37..69].copy_from_slice(&self.finality_provider_public_key.serialize());
        out[69..].copy_from_slice(&self.staking_time.to_be_bytes());
        out
    }

    pub fn from_bytes(bytes: &[u8]) -> Result<Self, StakingError> {
        if bytes.len() != V0_OP_RETURN_DATA_SIZE {
            return Err(StakingError::InvalidOpReturn(format!(
                "expected {} bytes, got {}",
                V0_OP_RETURN_DATA_SIZE,
                bytes.len()
            )));
        }

        let version = bytes[4];
        if version != V0_VERSION {
            return Err(StakingError::UnsupportedVersion(version));
        }

        let mut magic_bytes = [0u8; TAG_LEN];
        magic_bytes.copy_from_slice(&bytes[..4]);

        let staker_public_key = XOnlyPublicKey::from_slice(&bytes[5..37])
            .map_err(|e| StakingError::InvalidOpReturn(format!("invalid staker key: {}", e)))?;
        let finality_provider_public_key = XOnlyPublicKey::from_slice(&bytes[37..69])
            .map_err(|e| {
                StakingError::InvalidOpReturn(format!("invalid finality provider key: {}", e))
            })?;
        let staking_time = u16::from_be_bytes([bytes[69], bytes[70]]);

        Ok(Self {
            magic_bytes,
            version,
            staker_public_key,
            finality_provider_public_key,
            staking_time,
        })
    }

    /// Decodes the payload if `output` is a well-formed V0 OP_RETURN output.
    pub fn from_tx_out(output: &TxOut) -> Result<Self, StakingError> {
        let script = output.script_pubkey.as_bytes();
        if script.len() != 2 + V0_OP_RETURN_DATA_SIZE
            || script[0] != OP_RETURN.to_u8()
            || script[1] != OP_PUSHBYTES_71.to_u8()
        {
            return Err(StakingError::InvalidOpReturn(
                "not a V0 op return output".to_string(),
            ));
        }

        Self::from_bytes(&script[2..])
    }

    pub fn to_tx_out(&self) -> Result<TxOut, StakingError> {
        let data = PushBytesBuf::try_from(self.to_bytes().to_vec())
            .map_err(|e| StakingError::InvalidOpReturn(e.to_string()))?;

        Ok(TxOut {
            value: Amount::ZERO,
            script_pubkey: ScriptBuf::new_op_return(data),
        })
    }
}

/// A staking transaction recognised as a V0 stake.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ParsedV0StakingTx {
    pub staking_output: TxOut,
    pub staking_output_idx: usize,
    pub op_return_output: TxOut,
    pub op_return_output_idx: usize,
    pub op_return_data: V0OpReturnData,
}

fn find_op_return(outputs: &[TxOut]) -> Result<(V0OpReturnData, usize), StakingError> {
    let mut found: Option<(V0OpReturnData, usize)> = None;

    for (idx, output) in outputs.iter().enumerate() {
        let Ok(data) = V0OpReturnData::from_tx_out(output) else {
            continue;
        };
        if found.is_some() {
            return Err(StakingError::MultipleOpReturns);
        }
        found = Some((data, idx));
    }

    found.ok_or(StakingError::MissingOpReturn)
}

fn find_staking_output(outputs: &[TxOut], pk_script: &ScriptBuf) -> Result<usize, StakingError> {
    let mut matches = outputs
        .iter()
        .enumerate()
        .filter(|(_, output)| output.script_pubkey == *pk_script)
        .map(|(idx, _)| idx);

    let idx = matches.next().ok_or(StakingError::MissingStakingOutput)?;
    if matches.next().is_some() {
        return Err(StakingError::MultipleStakingOutputs);
    }
    Ok(idx)
}

/// Recognises `tx` as a V0 staking transaction for the given tag and
/// covenant committee.
pub fn parse_v0_staking_tx(
    tx: &Transaction,
    expected_tag: &[u8],
    covenant_keys: &[XOnlyPublicKey],
    covenant_quorum: u32,
) -> Result<ParsedV0StakingTx, StakingError> {
    if tx.output.len() < 2 {
        return Err(StakingError::NotEnoughOutputs(tx.output.len()));
    }

    if expected_tag.len() != TAG_LEN {
        return Err(StakingError::InvalidTagLength(expected_tag.len()));
    }

    let (op_return_data, op_return_output_idx) = find_op_return(&tx.output)?;

    if op_return_data.magic_bytes[..] != *expected_tag {
        return Err(StakingError::TagMismatch {
            expected: hex::encode(expected_tag),
            actual: hex::encode(op_return_data.magic_bytes),
        });
    }

    // The amount plays no part in the script, so zero is fine for matching.
    let staking_info = StakingInfo::build(
        &op_return_data.staker_public_key,
        &[op_return_data.finality_provider_public_key],
        covenant_keys,
        covenant_quorum,
        op_return_data.staking_time,
        Amount::ZERO,
    )?;

    let staking_output_idx = find_staking_output(&tx.output, staking_info.pk_script())?;

    Ok(ParsedV0StakingTx {
        staking_output: tx.output[staking_output_idx].clone(),
        staking_output_idx,
        op_return_output: tx.output[op_return_output_idx].clone(),
        op_return_output_idx,
        op_return_data,
    })
}

/// Outputs of a V0 staking transaction and an input-less transaction carrying them.
#[derive(Debug, Clone)]
pub struct IdentifiableStakingInfo {
    pub staking_info: StakingInfo,
    pub op_return_output: TxOut,
    /// Staking output at index 0, OP_RETURN output at index 1
    pub tx: Transaction,
}

pub fn build_v0_identifiable_staking_outputs_and_tx(
    magic_bytes: &[u8],
    staker_key: &XOnlyPublicKey,
    finality_provider_key: &XOnlyPublicKey,
    covenant_keys: &[XOnlyPublicKey],
    covenant_quorum: u32,
    staking_time: u16,
    staking_amount: Amount,
) -> Result<IdentifiableStakingInfo, StakingError> {
    let staking_info = StakingInfo::build(
        staker_key,
        &[*finality_provider_key],
        covenant_keys,
        covenant_quorum,
        staking_time,
        staking_amount,
    )?;

    let op_return_output =
        V0OpReturnData::new(magic_bytes, *staker_key, *finality_provider_key, staking_time)?
            .to_tx_out()?;

    let tx = Transaction {
        version: Version::TWO,
        lock_time: LockTime::ZERO,
        input: Vec::new(),
        output: vec![
            staking_info.staking_output.clone(),
            op_return_output.clone(),
        ],
    };

    Ok(IdentifiableStakingInfo {
        staking_info,
        op_return_output,
        tx,
    })
}
