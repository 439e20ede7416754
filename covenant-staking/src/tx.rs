//! Transaction shape checks and tapscript signing over a single input.

use bitcoin::absolute::LockTime;
use bitcoin::hashes::Hash;
use bitcoin::secp256k1::{schnorr, Keypair, Message, Secp256k1, XOnlyPublicKey};
use bitcoin::sighash::{Prevouts, SighashCache, TapSighashType};
use bitcoin::taproot::{LeafVersion, TapLeafHash};
use bitcoin::{Amount, Script, Sequence, TapSighash, Transaction, TxOut};

use crate::error::StakingError;

/// One input, one output, and the output carries value.
pub fn is_simple_transfer(tx: &Transaction) -> Result<(), StakingError> {
    if tx.input.len() != 1 {
        return Err(StakingError::InvalidInputCount(tx.input.len()));
    }

    if tx.output.len() != 1 {
        return Err(StakingError::InvalidOutputCount(tx.output.len()));
    }

    if tx.output[0].value == Amount::ZERO {
        return Err(StakingError::ZeroValueOutput);
    }

    Ok(())
}

/// Checks an unbonding transaction that is still waiting for its witness.
///
/// It must be a simple transfer that is final as soon as it is signed: no
/// lock time, a final sequence and nothing in the signature slots yet.
pub fn check_pre_signed_unbonding_tx_sanity(tx: &Transaction) -> Result<(), StakingError> {
    is_simple_transfer(tx)?;

    if tx.lock_time != LockTime::ZERO {
        return Err(StakingError::HasLockTime);
    }

    let input = &tx.input[0];
    if input.sequence != Sequence::MAX {
        return Err(StakingError::Replaceable);
    }

    if !input.script_sig.is_empty() || !input.witness.is_empty() {
        return Err(StakingError::AlreadySigned);
    }

    if !(1..=2).contains(&tx.version.0) {
        return Err(StakingError::UnsupportedTxVersion(tx.version.0));
    }

    Ok(())
}

fn script_spend_sighash(
    tx: &Transaction,
    funding_output: &TxOut,
    leaf_hash: TapLeafHash,
) -> Result<TapSighash, StakingError> {
    if tx.input.len() != 1 {
        return Err(StakingError::InvalidInputCount(tx.input.len()));
    }

    let prevouts = [funding_output];
    SighashCache::new(tx)
        .taproot_script_spend_signature_hash(
            0,
            &Prevouts::All(&prevouts),
            leaf_hash,
            TapSighashType::Default,
        )
        .map_err(|e| StakingError::Sighash(e.to_string()))
}

/// Signs the only input of `tx`, which spends `funding_output` through the
/// leaf identified by `leaf_hash`, with sighash DEFAULT.
pub fn sign_tx_with_one_script_spend_input_from_tap_leaf(
    tx: &Transaction,
    funding_output: &TxOut,
    keypair: &Keypair,
    leaf_hash: TapLeafHash,
) -> Result<schnorr::Signature, StakingError> {
    let sighash = script_spend_sighash(tx, funding_output, leaf_hash)?;
    let msg = Message::from_digest(sighash.to_byte_array());

    let secp = Secp256k1::signing_only();
    Ok(secp.sign_schnorr(&msg, keypair))
}

/// Verifies `signature` by `public_key` over the only input of `tx`
/// spending `funding_output` through `leaf_script`.
pub fn verify_transaction_sig_with_output(
    tx: &Transaction,
    funding_output: &TxOut,
    leaf_script: &Script,
    public_key: &XOnlyPublicKey,
    signature: &schnorr::Signature,
) -> Result<(), StakingError> {
    let leaf_hash = TapLeafHash::from_script(leaf_script, LeafVersion::TapScript);
    let sighash = script_spend_sighash(tx, funding_output, leaf_hash)?;
    let msg = Message::from_digest(sighash.to_byte_array());

    let secp = Secp256k1::verification_only();
    secp.verify_schnorr(signature, &msg, public_key)
        .map_err(StakingError::InvalidSignature)
}
