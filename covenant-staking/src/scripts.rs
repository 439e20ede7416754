//! Staking and unbonding output construction.
//!
//! Both outputs are taproot outputs whose key path is provably unspendable,
//! so every spend has to go through one of the script leaves built here.

use bitcoin::opcodes::all::{
    OP_CHECKSIG, OP_CHECKSIGADD, OP_CHECKSIGVERIFY, OP_CSV, OP_NUMEQUAL, OP_NUMEQUALVERIFY,
};
use bitcoin::script::Builder;
use bitcoin::secp256k1::{Secp256k1, XOnlyPublicKey};
use bitcoin::taproot::{ControlBlock, LeafVersion, TapLeafHash, TaprootBuilder, TaprootSpendInfo};
use bitcoin::{Address, Amount, Network, ScriptBuf, TxOut};

use crate::error::StakingError;

/// BIP-341 NUMS point `H = lift_x(SHA256(G))`, nobody knows its discrete log.
const UNSPENDABLE_KEY_PATH: [u8; 32] = [
    0x50, 0x92, 0x9b, 0x74, 0xc1, 0xa0, 0x49, 0x54, 0xb7, 0x8b, 0x4b, 0x60, 0x35, 0xe9, 0x7a, 0x5e,
    0x07, 0x8a, 0x5a, 0x0f, 0x28, 0xec, 0x96, 0xd5, 0x47, 0xbf, 0xee, 0x9a, 0xce, 0x80, 0x3a, 0xc0,
];

/// Internal key shared by staking and unbonding outputs.
pub fn unspendable_key_path_internal_key() -> Result<XOnlyPublicKey, StakingError> {
    XOnlyPublicKey::from_slice(&UNSPENDABLE_KEY_PATH)
        .map_err(|e| StakingError::TaprootBuilder(format!("invalid internal key: {}", e)))
}

/// A revealed leaf together with the proof of its inclusion in the tree.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SpendInfo {
    /// Control block proving the leaf belongs to the output key
    pub control_block: ControlBlock,
    /// The tapscript leaf being spent
    pub leaf_script: ScriptBuf,
}

impl SpendInfo {
    pub fn leaf_version(&self) -> LeafVersion {
        LeafVersion::TapScript
    }

    /// Tapleaf hash committed to by script-path signatures.
    pub fn leaf_hash(&self) -> TapLeafHash {
        TapLeafHash::from_script(&self.leaf_script, LeafVersion::TapScript)
    }
}

/// `<key> OP_CHECKSIGVERIFY <lock_time> OP_CHECKSEQUENCEVERIFY`
pub fn timelock_script(key: &XOnlyPublicKey, lock_time: u16) -> ScriptBuf {
    Builder::new()
        .push_x_only_key(key)
        .push_opcode(OP_CHECKSIGVERIFY)
        .push_int(i64::from(lock_time))
        .push_opcode(OP_CSV)
        .into_script()
}

fn push_single_key(builder: Builder, key: &XOnlyPublicKey, with_verify: bool) -> Builder {
    let builder = builder.push_x_only_key(key);
    if with_verify {
        builder.push_opcode(OP_CHECKSIGVERIFY)
    } else {
        builder.push_opcode(OP_CHECKSIG)
    }
}

fn sorted_unique_keys(
    keys: &[XOnlyPublicKey],
    what: &'static str,
) -> Result<Vec<XOnlyPublicKey>, StakingError> {
    let mut sorted = keys.to_vec();
    sorted.sort_by_key(|k| k.serialize());

    if let Some(pair) = sorted.windows(2).find(|pair| pair[0] == pair[1]) {
        return Err(StakingError::DuplicateKey {
            what,
            key: hex::encode(pair[0].serialize()),
        });
    }

    Ok(sorted)
}

/// Appends a `threshold`-of-`keys` tapscript multisig.
///
/// Keys are sorted lexicographically by their x-only encoding, so the
/// resulting script does not depend on the order the keys were configured in.
fn push_multisig(
    builder: Builder,
    keys: &[XOnlyPublicKey],
    threshold: u32,
    with_verify: bool,
    what: &'static str,
) -> Result<Builder, StakingError> {
    if keys.is_empty() {
        return Err(StakingError::NoKeys { what });
    }

    if threshold == 0 || threshold as usize > keys.len() {
        return Err(StakingError::InvalidQuorum {
            quorum: threshold,
            keys: keys.len(),
        });
    }

    if keys.len() == 1 {
        return Ok(push_single_key(builder, &keys[0], with_verify));
    }

    let sorted = sorted_unique_keys(keys, what)?;

    let mut builder = builder.push_x_only_key(&sorted[0]).push_opcode(OP_CHECKSIG);
    for key in &sorted[1..] {
        builder = builder.push_x_only_key(key).push_opcode(OP_CHECKSIGADD);
    }
    builder = builder.push_int(i64::from(threshold));

    Ok(if with_verify {
        builder.push_opcode(OP_NUMEQUALVERIFY)
    } else {
        builder.push_opcode(OP_NUMEQUAL)
    })
}

/// The three spending conditions shared by staking and unbonding outputs.
#[derive(Debug, Clone)]
struct ScriptPaths {
    timelock: ScriptBuf,
    unbonding: ScriptBuf,
    slashing: ScriptBuf,
}

impl ScriptPaths {
    fn new(
        staker_key: &XOnlyPublicKey,
        finality_provider_keys: &[XOnlyPublicKey],
        covenant_keys: &[XOnlyPublicKey],
        covenant_quorum: u32,
        lock_time: u16,
    ) -> Result<Self, StakingError> {
        if finality_provider_keys.is_empty() {
            return Err(StakingError::NoKeys {
                what: "finality providers",
            });
        }

        let timelock = timelock_script(staker_key, lock_time);

        let unbonding = push_multisig(
            push_single_key(Builder::new(), staker_key, true),
            covenant_keys,
            covenant_quorum,
            false,
            "covenant committee",
        )?
        .into_script();

        let slashing = push_multisig(
            push_multisig(
                push_single_key(Builder::new(), staker_key, true),
                finality_provider_keys,
                1,
                true,
                "finality providers",
            )?,
            covenant_keys,
            covenant_quorum,
            false,
            "covenant committee",
        )?
        .into_script();

        Ok(Self {
            timelock,
            unbonding,
            slashing,
        })
    }
}

fn build_tree(leaves: &[(u8, &ScriptBuf)]) -> Result<TaprootSpendInfo, StakingError> {
    let secp = Secp256k1::verification_only();
    let mut builder = TaprootBuilder::new();
    for (depth, script) in leaves {
        builder = builder
            .add_leaf(*depth, (*script).clone())
            .map_err(|e| StakingError::TaprootBuilder(e.to_string()))?;
    }

    builder
        .finalize(&secp, unspendable_key_path_internal_key()?)
        .map_err(|_| StakingError::TaprootBuilder("incomplete script tree".to_string()))
}

fn spend_info_for(tree: &TaprootSpendInfo, script: &ScriptBuf) -> Result<SpendInfo, StakingError> {
    let control_block = tree
        .control_block(&(script.clone(), LeafVersion::TapScript))
        .ok_or(StakingError::MissingLeaf)?;

    Ok(SpendInfo {
        control_block,
        leaf_script: script.clone(),
    })
}

/// Staking output committing to the timelock, unbonding and slashing paths.
#[derive(Debug, Clone)]
pub struct StakingInfo {
    /// The output as it appears in the staking transaction
    pub staking_output: TxOut,
    paths: ScriptPaths,
    tree: TaprootSpendInfo,
}

impl StakingInfo {
    pub fn build(
        staker_key: &XOnlyPublicKey,
        finality_provider_keys: &[XOnlyPublicKey],
        covenant_keys: &[XOnlyPublicKey],
        covenant_quorum: u32,
        staking_time: u16,
        staking_amount: Amount,
    ) -> Result<Self, StakingError> {
        let paths = ScriptPaths::new(
            staker_key,
            finality_provider_keys,
            covenant_keys,
            covenant_quorum,
            staking_time,
        )?;

        let tree = build_tree(&[
            (2, &paths.timelock),
            (2, &paths.unbonding),
            (1, &paths.slashing),
        ])?;

        let staking_output = TxOut {
            value: staking_amount,
            script_pubkey: ScriptBuf::new_p2tr_tweaked(tree.output_key()),
        };

        Ok(Self {
            staking_output,
            paths,
            tree,
        })
    }

    pub fn pk_script(&self) -> &ScriptBuf {
        &self.staking_output.script_pubkey
    }

    pub fn address(&self, network: Network) -> Address {
        Address::p2tr_tweaked(self.tree.output_key(), network)
    }

    pub fn timelock_path_spend_info(&self) -> Result<SpendInfo, StakingError> {
        spend_info_for(&self.tree, &self.paths.timelock)
    }

    /// The covenant-quorum path spent by unbonding transactions.
    pub fn unbonding_path_spend_info(&self) -> Result<SpendInfo, StakingError> {
        spend_info_for(&self.tree, &self.paths.unbonding)
    }

    pub fn slashing_path_spend_info(&self) -> Result<SpendInfo, StakingError> {
        spend_info_for(&self.tree, &self.paths.slashing)
    }
}

/// Output of an unbonding transaction: the stake keeps its slashing path
/// but unlocks after the (shorter) unbonding time.
#[derive(Debug, Clone)]
pub struct UnbondingInfo {
    /// The single output an unbonding transaction must carry
    pub unbonding_output: TxOut,
    paths: ScriptPaths,
    tree: TaprootSpendInfo,
}

impl UnbondingInfo {
    pub fn build(
        staker_key: &XOnlyPublicKey,
        finality_provider_keys: &[XOnlyPublicKey],
        covenant_keys: &[XOnlyPublicKey],
        covenant_quorum: u32,
        unbonding_time: u16,
        unbonding_amount: Amount,
    ) -> Result<Self, StakingError> {
        let paths = ScriptPaths::new(
            staker_key,
            finality_provider_keys,
            covenant_keys,
            covenant_quorum,
            unbonding_time,
        )?;

        let tree = build_tree(&[(1, &paths.timelock), (1, &paths.slashing)])?;

        let unbonding_output = TxOut {
            value: unbonding_amount,
            script_pubkey: ScriptBuf::new_p2tr_tweaked(tree.output_key()),
        };

        Ok(Self {
            unbonding_output,
            paths,
            tree,
        })
    }

    pub fn timelock_path_spend_info(&self) -> Result<SpendInfo, StakingError> {
        spend_info_for(&self.tree, &self.paths.timelock)
    }

    pub fn slashing_path_spend_info(&self) -> Result<SpendInfo, StakingError> {
        spend_info_for(&self.tree, &self.paths.slashing)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use bitcoin::script::Instruction;

    fn random_key() -> XOnlyPublicKey {
        let secp = Secp256k1::new();
        let (_, pk) = secp.generate_keypair(&mut rand::thread_rng());
        pk.x_only_public_key().0
    }

    fn random_keys(n: usize) -> Vec<XOnlyPublicKey> {
        (0..n).map(|_| random_key()).collect()
    }

    fn output_key(script: &ScriptBuf) -> XOnlyPublicKey {
        assert!(script.is_p2tr());
        XOnlyPublicKey::from_slice(&script.as_bytes()[2..]).unwrap()
    }

    #[test]
    fn test_internal_key_is_valid_point() {
        assert!(unspendable_key_path_internal_key().is_ok());
    }

    #[test]
    fn test_timelock_script_layout() {
        let key = random_key();
        let script = timelock_script(&key, 1000);
        let ops: Vec<_> = script.instructions().collect::<Result<_, _>>().unwrap();

        assert_eq!(ops.len(), 4);
        assert!(matches!(ops[0], Instruction::PushBytes(p) if p.as_bytes() == key.serialize()));
        assert_eq!(ops[1], Instruction::Op(OP_CHECKSIGVERIFY));
        assert_eq!(ops[3], Instruction::Op(OP_CSV));
    }

    #[test]
    fn test_multisig_keys_sorted_regardless_of_input_order() {
        let keys = random_keys(3);
        let mut reversed = keys.clone();
        reversed.reverse();

        let a = push_multisig(Builder::new(), &keys, 2, false, "test").unwrap().into_script();
        let b = push_multisig(Builder::new(), &reversed, 2, false, "test").unwrap().into_script();
        assert_eq!(a, b);

        let ops: Vec<_> = a.instructions().collect::<Result<_, _>>().unwrap();
        // 3 keys, 3 checksig ops, threshold, NUMEQUAL
        assert_eq!(ops.len(), 8);
        assert_eq!(ops[1], Instruction::Op(OP_CHECKSIG));
        assert_eq!(ops[3], Instruction::Op(OP_CHECKSIGADD));
        assert_eq!(ops[5], Instruction::Op(OP_CHECKSIGADD));
        assert_eq!(ops[7], Instruction::Op(OP_NUMEQUAL));
    }

    #[test]
    fn test_multisig_single_key_uses_checksig() {
        let key = random_key();
        let script = push_multisig(Builder::new(), &[key], 1, true, "test")
            .unwrap()
            .into_script();
        let ops: Vec<_> = script.instructions().collect::<Result<_, _>>().unwrap();
        assert_eq!(ops.len(), 2);
        assert_eq!(ops[1], Instruction::Op(OP_CHECKSIGVERIFY));
    }

    #[test]
    fn test_multisig_rejects_duplicates() {
        let key = random_key();
        let err = push_multisig(Builder::new(), &[key, key], 1, false, "covenant committee")
            .map(Builder::into_script)
            .unwrap_err();
        assert!(matches!(err, StakingError::DuplicateKey { .. }));
    }

    #[test]
    fn test_multisig_rejects_bad_quorum() {
        let keys = random_keys(2);
        let err = push_multisig(Builder::new(), &keys, 3, false, "test")
            .map(Builder::into_script)
            .unwrap_err();
        assert!(matches!(err, StakingError::InvalidQuorum { quorum: 3, keys: 2 }));

        let err = push_multisig(Builder::new(), &keys, 0, false, "test")
            .map(Builder::into_script)
            .unwrap_err();
        assert!(matches!(err, StakingError::InvalidQuorum { quorum: 0, .. }));
    }

    #[test]
    fn test_staking_output_commits_to_all_paths() {
        let secp = Secp256k1::verification_only();
        let covenants = random_keys(5);
        let info = StakingInfo::build(
            &random_key(),
            &[random_key()],
            &covenants,
            3,
            1000,
            Amount::from_sat(100_000),
        )
        .unwrap();

        assert_eq!(info.staking_output.value, Amount::from_sat(100_000));
        let key = output_key(info.pk_script());

        for spend in [
            info.timelock_path_spend_info().unwrap(),
            info.unbonding_path_spend_info().unwrap(),
            info.slashing_path_spend_info().unwrap(),
        ] {
            assert!(spend
                .control_block
                .verify_taproot_commitment(&secp, key, &spend.leaf_script));
        }
    }

    #[test]
    fn test_unbonding_output_differs_from_staking_output() {
        let staker = random_key();
        let fp = random_key();
        let covenants = random_keys(3);

        let staking =
            StakingInfo::build(&staker, &[fp], &covenants, 2, 1000, Amount::from_sat(50_000))
                .unwrap();
        let unbonding =
            UnbondingInfo::build(&staker, &[fp], &covenants, 2, 1000, Amount::from_sat(50_000))
                .unwrap();

        assert_ne!(
            staking.staking_output.script_pubkey,
            unbonding.unbonding_output.script_pubkey
        );
        assert!(unbonding.unbonding_output.script_pubkey.is_p2tr());
    }

    #[test]
    fn test_unbonding_output_depends_on_unbonding_time() {
        let staker = random_key();
        let fp = random_key();
        let covenants = random_keys(3);

        let a = UnbondingInfo::build(&staker, &[fp], &covenants, 2, 100, Amount::from_sat(1))
            .unwrap();
        let b = UnbondingInfo::build(&staker, &[fp], &covenants, 2, 101, Amount::from_sat(1))
            .unwrap();

        assert_ne!(a.unbonding_output, b.unbonding_output);
    }

    #[test]
    fn test_staking_info_requires_finality_provider() {
        let err = StakingInfo::build(
            &random_key(),
            &[],
            &random_keys(3),
            2,
            1000,
            Amount::from_sat(1),
        )
        .unwrap_err();
        assert!(matches!(err, StakingError::NoKeys { .. }));
    }
}
