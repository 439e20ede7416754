//! Taproot script engine for covenant-signed Bitcoin stakes.
//!
//! This crate knows how a staking output commits funds to a staker, a
//! finality provider and a covenant committee, how the matching unbonding
//! output looks, and how to sign or verify a tapscript spend of either.
//!
//! ## Script tree
//!
//! ```text
//!                 staking output (P2TR, NUMS internal key)
//!                /                                        \
//!          branch                                    slashing leaf
//!         /       \
//!  timelock leaf  unbonding leaf
//! ```
//!
//! The unbonding leaf is the one covenant members co-sign: it requires the
//! staker's signature plus a quorum of covenant signatures.

pub mod error;
pub mod scripts;
pub mod staking_tx;
pub mod tx;

pub use error::StakingError;
pub use scripts::{unspendable_key_path_internal_key, SpendInfo, StakingInfo, UnbondingInfo};
pub use staking_tx::{
    build_v0_identifiable_staking_outputs_and_tx, parse_v0_staking_tx, IdentifiableStakingInfo,
    ParsedV0StakingTx, V0OpReturnData, TAG_LEN, V0_OP_RETURN_DATA_SIZE,
};
pub use tx::{
    check_pre_signed_unbonding_tx_sanity, is_simple_transfer,
    sign_tx_with_one_script_spend_input_from_tap_leaf, verify_transaction_sig_with_output,
};
