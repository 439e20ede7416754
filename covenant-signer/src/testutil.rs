//! Fixtures and mock collaborators shared by the unit tests.

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Mutex;

use async_trait::async_trait;
use bitcoin::absolute::LockTime;
use bitcoin::hashes::Hash;
use bitcoin::secp256k1::{schnorr, Keypair, PublicKey, Secp256k1, SecretKey, XOnlyPublicKey};
use bitcoin::transaction::Version;
use bitcoin::{
    Amount, OutPoint, Script, ScriptBuf, Sequence, Transaction, TxIn, TxOut, Txid, Witness,
};
use covenant_btcclient::{bitcoincore_rpc, RpcClientError};
use covenant_staking::{
    build_v0_identifiable_staking_outputs_and_tx, sign_tx_with_one_script_spend_input_from_tap_leaf,
    SpendInfo, StakingInfo, UnbondingInfo,
};

use crate::backend::{
    sign_with_secret, BackendError, ExternalBtcSigner, SecretKeyGuard, SigningRequest,
    SigningResult,
};
use crate::chain::{BtcChainInfo, ChainInfoError, TxInfo};
use crate::params::{BabylonParams, VersionedParams, VersionedParamsRetriever};

pub const MAGIC_BYTES: [u8; 4] = [0x01, 0x02, 0x03, 0x04];
pub const ACTIVATION_HEIGHT: u64 = 100;

fn secret_key(seed: u8) -> SecretKey {
    let mut bytes = [0u8; 32];
    bytes[31] = seed;
    SecretKey::from_slice(&bytes).unwrap()
}

/// A confirmed V0 stake guarded by a five-member covenant committee, and an
/// unbonding transaction for it already signed by the staker.
pub struct Scenario {
    covenant_keys: Vec<SecretKey>,
    pub staker: Keypair,
    pub finality_provider: XOnlyPublicKey,
    pub params: BabylonParams,
    pub staking_amount: Amount,
    pub staking_time: u16,
    pub staking_tx: Transaction,
    pub unbonding_tx: Transaction,
    pub staker_signature: schnorr::Signature,
}

impl Scenario {
    pub fn new() -> Self {
        Self::with_stake(Amount::from_sat(100_000), 1_000)
    }

    pub fn with_stake(staking_amount: Amount, staking_time: u16) -> Self {
        let secp = Secp256k1::new();
        let covenant_keys: Vec<SecretKey> = (1..=5).map(secret_key).collect();
        let staker = Keypair::from_secret_key(&secp, &secret_key(0x21));
        let finality_provider = secret_key(0x31).x_only_public_key(&secp).0;

        let params = BabylonParams {
            covenant_public_keys: covenant_keys
                .iter()
                .map(|sk| sk.public_key(&secp))
                .collect(),
            covenant_quorum: 3,
            magic_bytes: MAGIC_BYTES,
            unbonding_time: 1_000,
            unbonding_fee: Amount::from_sat(1_000),
            max_staking_amount: Amount::from_sat(300_000),
            min_staking_amount: Amount::from_sat(3_000),
            max_staking_time: 10_000,
            min_staking_time: 100,
            confirmation_depth: 10,
        };

        let mut staking_tx = build_v0_identifiable_staking_outputs_and_tx(
            &MAGIC_BYTES,
            &staker.x_only_public_key().0,
            &finality_provider,
            &params.covenant_x_only_keys(),
            params.covenant_quorum,
            staking_time,
            staking_amount,
        )
        .unwrap()
        .tx;
        staking_tx.input.push(TxIn {
            previous_output: OutPoint {
                txid: Txid::from_byte_array([0x42; 32]),
                vout: 3,
            },
            script_sig: ScriptBuf::new(),
            sequence: Sequence::MAX,
            witness: Witness::new(),
        });

        let unbonding_output = UnbondingInfo::build(
            &staker.x_only_public_key().0,
            &[finality_provider],
            &params.covenant_x_only_keys(),
            params.covenant_quorum,
            params.unbonding_time,
            staking_amount - params.unbonding_fee,
        )
        .unwrap()
        .unbonding_output;

        let unbonding_tx = Transaction {
            version: Version::TWO,
            lock_time: LockTime::ZERO,
            input: vec![TxIn {
                previous_output: OutPoint {
                    txid: staking_tx.compute_txid(),
                    vout: 0,
                },
                script_sig: ScriptBuf::new(),
                sequence: Sequence::MAX,
                witness: Witness::new(),
            }],
            output: vec![unbonding_output],
        };

        let mut scenario = Self {
            covenant_keys,
            staker,
            finality_provider,
            params,
            staking_amount,
            staking_time,
            staking_tx,
            unbonding_tx,
            staker_signature: schnorr::Signature::from_slice(&[0u8; 64]).unwrap(),
        };
        scenario.staker_signature = scenario.sign_unbonding(&scenario.unbonding_tx);
        scenario
    }

    pub fn covenant_secret_keys(&self) -> &[SecretKey] {
        &self.covenant_keys
    }

    pub fn covenant_public_keys(&self) -> Vec<PublicKey> {
        self.params.covenant_public_keys.clone()
    }

    fn staking_info(&self) -> StakingInfo {
        StakingInfo::build(
            &self.staker.x_only_public_key().0,
            &[self.finality_provider],
            &self.params.covenant_x_only_keys(),
            self.params.covenant_quorum,
            self.staking_time,
            self.staking_amount,
        )
        .unwrap()
    }

    pub fn staking_output(&self) -> TxOut {
        self.staking_tx.output[0].clone()
    }

    pub fn staking_pk_script(&self) -> ScriptBuf {
        self.staking_output().script_pubkey
    }

    pub fn unbonding_spend_info(&self) -> SpendInfo {
        self.staking_info().unbonding_path_spend_info().unwrap()
    }

    /// Staker's signature over `tx` spending the staking output through the
    /// unbonding leaf.
    pub fn sign_unbonding(&self, tx: &Transaction) -> schnorr::Signature {
        sign_tx_with_one_script_spend_input_from_tap_leaf(
            tx,
            &self.staking_output(),
            &self.staker,
            self.unbonding_spend_info().leaf_hash(),
        )
        .unwrap()
    }

    pub fn signing_request(&self, covenant_public_key: &PublicKey) -> SigningRequest {
        SigningRequest {
            staking_output: self.staking_output(),
            unbonding_tx: self.unbonding_tx.clone(),
            covenant_public_key: *covenant_public_key,
            covenant_address: bitcoin::Address::p2wpkh(
                &bitcoin::CompressedPublicKey(*covenant_public_key),
                bitcoin::Network::Regtest,
            ),
            spend_description: self.unbonding_spend_info().into(),
        }
    }

    pub fn params_retriever(&self) -> VersionedParamsRetriever {
        VersionedParamsRetriever::new(vec![VersionedParams {
            version: 0,
            activation_height: ACTIVATION_HEIGHT,
            params: self.params.clone(),
        }])
        .unwrap()
    }

    pub fn tx_info(&self, inclusion_height: u32) -> TxInfo {
        TxInfo {
            tx: self.staking_tx.clone(),
            inclusion_height,
        }
    }

    pub fn chain_info(&self, inclusion_height: u32, best_height: u32) -> MockChainInfo {
        MockChainInfo::new(
            MockTxResponse::Found(self.tx_info(inclusion_height)),
            Some(best_height),
        )
    }
}

// ==================== Mock Chain ====================

pub enum MockTxResponse {
    Found(TxInfo),
    NotFound,
    NotInChain,
    TransportFailure,
}

/// Chain source answering from fixed data and counting lookups.
pub struct MockChainInfo {
    tx: MockTxResponse,
    best_height: Option<u32>,
    tx_calls: AtomicUsize,
    height_calls: AtomicUsize,
}

impl MockChainInfo {
    /// `best_height` of `None` fails every tip lookup.
    pub fn new(tx: MockTxResponse, best_height: Option<u32>) -> Self {
        Self {
            tx,
            best_height,
            tx_calls: AtomicUsize::new(0),
            height_calls: AtomicUsize::new(0),
        }
    }

    pub fn tx_calls(&self) -> usize {
        self.tx_calls.load(Ordering::SeqCst)
    }

    pub fn height_calls(&self) -> usize {
        self.height_calls.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl BtcChainInfo for MockChainInfo {
    async fn tx_by_hash(&self, txid: &Txid, _pk_script: &Script) -> Result<TxInfo, ChainInfoError> {
        self.tx_calls.fetch_add(1, Ordering::SeqCst);
        match &self.tx {
            MockTxResponse::Found(info) => Ok(info.clone()),
            MockTxResponse::NotFound => Err(ChainInfoError::NotFound(*txid)),
            MockTxResponse::NotInChain => Err(ChainInfoError::NotInChain(*txid)),
            MockTxResponse::TransportFailure => Err(ChainInfoError::Rpc(RpcClientError::Rpc(
                bitcoincore_rpc::Error::ReturnedError("connection refused".to_string()),
            ))),
        }
    }

    async fn best_block_height(&self) -> Result<u32, ChainInfoError> {
        self.height_calls.fetch_add(1, Ordering::SeqCst);
        self.best_height
            .ok_or_else(|| ChainInfoError::Task("connection refused".to_string()))
    }
}

// ==================== Mock Signer ====================

/// Backend holding covenant secrets in memory.
pub struct MockSigner {
    keys: Vec<SecretKey>,
    fail: bool,
    calls: AtomicUsize,
    last_request: Mutex<Option<SigningRequest>>,
}

impl MockSigner {
    pub fn new(keys: Vec<SecretKey>) -> Self {
        Self {
            keys,
            fail: false,
            calls: AtomicUsize::new(0),
            last_request: Mutex::new(None),
        }
    }

    /// A backend whose wallet never produces a signature.
    pub fn failing() -> Self {
        Self {
            fail: true,
            ..Self::new(Vec::new())
        }
    }

    pub fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }

    pub fn last_request(&self) -> Option<SigningRequest> {
        self.last_request.lock().unwrap().clone()
    }
}

#[async_trait]
impl ExternalBtcSigner for MockSigner {
    async fn raw_signature(&self, request: &SigningRequest) -> Result<SigningResult, BackendError> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        *self.last_request.lock().unwrap() = Some(request.clone());

        if self.fail {
            return Err(BackendError::MissingSignature);
        }

        let secp = Secp256k1::new();
        let secret = self
            .keys
            .iter()
            .find(|sk| sk.public_key(&secp) == request.covenant_public_key)
            .ok_or_else(|| {
                BackendError::KeyMismatch(hex::encode(request.covenant_public_key.serialize()))
            })?;

        let mut secret = *secret;
        let guard = SecretKeyGuard::new(&mut secret);
        let signature = sign_with_secret(request, &guard)?;
        Ok(SigningResult { signature })
    }
}
