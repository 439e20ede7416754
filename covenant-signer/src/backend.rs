//! Signing backends holding the covenant member's key.
//!
//! The policy engine never sees key material. Once a request is judged
//! legitimate it is handed to one of these backends, chosen once at startup:
//!
//! - [`PsbtSigner`] sends a PSBT to a wallet node and reads back the
//!   tapscript signature.
//! - [`PrivKeySigner`] exports the key from a wallet node, signs locally and
//!   wipes the key before returning.

use std::sync::Arc;

use async_trait::async_trait;
use bitcoin::bip32::{DerivationPath, Fingerprint};
use bitcoin::psbt::Psbt;
use bitcoin::secp256k1::{schnorr, Keypair, PublicKey, Secp256k1, SecretKey};
use bitcoin::sighash::TapSighashType;
use bitcoin::taproot::{ControlBlock, LeafVersion, TapLeafHash};
use bitcoin::{Address, ScriptBuf, Sequence, Transaction, TxIn, TxOut, Witness};
use covenant_btcclient::{BtcClient, RpcClientError};
use covenant_staking::{is_simple_transfer, sign_tx_with_one_script_spend_input_from_tap_leaf};
use covenant_staking::{SpendInfo, StakingError};
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::debug;

/// Errors from signing backends.
#[derive(Debug, Error)]
pub enum BackendError {
    #[error("invalid unbonding transaction: {0}")]
    InvalidTransaction(#[source] StakingError),

    #[error("failed to build PSBT packet: {0}")]
    PsbtBuild(String),

    #[error("failed to sign PSBT packet: {0}")]
    PsbtSign(#[source] RpcClientError),

    #[error("no signature found in PSBT packet, wallet does not maintain covenant public key")]
    MissingSignature,

    #[error("wallet signed with sighash {0} instead of DEFAULT")]
    UnexpectedSighash(TapSighashType),

    #[error("failed to retrieve covenant key for signing: {0}")]
    KeyRetrieval(#[source] RpcClientError),

    #[error("wallet key does not match covenant public key {0}")]
    KeyMismatch(String),

    #[error("failed to sign transaction: {0}")]
    Signing(#[source] StakingError),

    #[error("bitcoind task failed: {0}")]
    Task(String),
}

/// Leaf being spent and its proof of inclusion in the output key.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SpendPathDescription {
    pub control_block: ControlBlock,
    pub leaf_script: ScriptBuf,
}

impl SpendPathDescription {
    pub fn leaf_hash(&self) -> TapLeafHash {
        TapLeafHash::from_script(&self.leaf_script, LeafVersion::TapScript)
    }
}

impl From<SpendInfo> for SpendPathDescription {
    fn from(info: SpendInfo) -> Self {
        Self {
            control_block: info.control_block,
            leaf_script: info.leaf_script,
        }
    }
}

/// Everything a backend needs to produce the covenant signature.
#[derive(Debug, Clone)]
pub struct SigningRequest {
    pub staking_output: TxOut,
    pub unbonding_tx: Transaction,
    pub covenant_public_key: PublicKey,
    /// P2WPKH address of the covenant key, used by wallet lookups
    pub covenant_address: Address,
    pub spend_description: SpendPathDescription,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SigningResult {
    pub signature: schnorr::Signature,
}

/// Produces the covenant member's signature over an approved request.
#[async_trait]
pub trait ExternalBtcSigner: Send + Sync {
    async fn raw_signature(&self, request: &SigningRequest) -> Result<SigningResult, BackendError>;
}

// ==================== PSBT Backend ====================

fn empty_key_source() -> (Fingerprint, DerivationPath) {
    (Fingerprint::from([0u8; 4]), DerivationPath::master())
}

/// Builds a single-input PSBT spending the staking output through the
/// unbonding leaf with sighash DEFAULT.
pub fn build_unbonding_psbt(request: &SigningRequest) -> Result<Psbt, BackendError> {
    let tx = &request.unbonding_tx;
    let [staking_input] = tx.input.as_slice() else {
        return Err(BackendError::PsbtBuild(format!(
            "expected 1 input, got {}",
            tx.input.len()
        )));
    };

    let unsigned = Transaction {
        version: tx.version,
        lock_time: tx.lock_time,
        input: vec![TxIn {
            previous_output: staking_input.previous_output,
            script_sig: ScriptBuf::new(),
            sequence: Sequence::MAX,
            witness: Witness::new(),
        }],
        output: tx.output.clone(),
    };

    let mut psbt =
        Psbt::from_unsigned_tx(unsigned).map_err(|e| BackendError::PsbtBuild(e.to_string()))?;

    let spend = &request.spend_description;
    let (x_only, _) = request.covenant_public_key.x_only_public_key();

    let input = &mut psbt.inputs[0];
    input.witness_utxo = Some(request.staking_output.clone());
    input.sighash_type = Some(TapSighashType::Default.into());
    input.tap_scripts.insert(
        spend.control_block.clone(),
        (spend.leaf_script.clone(), LeafVersion::TapScript),
    );
    input
        .bip32_derivation
        .insert(request.covenant_public_key, empty_key_source());
    input
        .tap_key_origins
        .insert(x_only, (vec![spend.leaf_hash()], empty_key_source()));

    Ok(psbt)
}

/// Reads the covenant key's signature for the unbonding leaf from a PSBT
/// processed by the wallet.
pub fn extract_covenant_signature(
    psbt: &Psbt,
    request: &SigningRequest,
) -> Result<schnorr::Signature, BackendError> {
    let (x_only, _) = request.covenant_public_key.x_only_public_key();
    let leaf_hash = request.spend_description.leaf_hash();

    let sig = psbt
        .inputs
        .first()
        .and_then(|input| input.tap_script_sigs.get(&(x_only, leaf_hash)))
        .ok_or(BackendError::MissingSignature)?;

    if sig.sighash_type != TapSighashType::Default {
        return Err(BackendError::UnexpectedSighash(sig.sighash_type));
    }

    Ok(sig.signature)
}

/// Delegates signing to a bitcoind wallet through `walletprocesspsbt`.
#[derive(Debug, Clone)]
pub struct PsbtSigner {
    client: Arc<BtcClient>,
}

impl PsbtSigner {
    pub fn new(client: Arc<BtcClient>) -> Self {
        Self { client }
    }
}

#[async_trait]
impl ExternalBtcSigner for PsbtSigner {
    async fn raw_signature(&self, request: &SigningRequest) -> Result<SigningResult, BackendError> {
        is_simple_transfer(&request.unbonding_tx).map_err(BackendError::InvalidTransaction)?;

        let psbt = build_unbonding_psbt(request)?;

        let client = self.client.clone();
        let signed = tokio::task::spawn_blocking(move || client.sign_psbt(&psbt))
            .await
            .map_err(|e| BackendError::Task(e.to_string()))?
            .map_err(BackendError::PsbtSign)?;

        let signature = extract_covenant_signature(&signed, request)?;
        debug!("Wallet produced covenant signature via PSBT");
        Ok(SigningResult { signature })
    }
}

// ==================== Private Key Backend ====================

/// Borrows a secret key and erases it in place when dropped.
///
/// `SecretKey` is `Copy`, so the guard holds the caller's key by reference
/// rather than a copy; dropping the guard wipes the caller's storage.
pub struct SecretKeyGuard<'a> {
    secret: &'a mut SecretKey,
}

impl<'a> SecretKeyGuard<'a> {
    pub fn new(secret: &'a mut SecretKey) -> Self {
        Self { secret }
    }

    pub fn secret(&self) -> &SecretKey {
        &*self.secret
    }
}

impl Drop for SecretKeyGuard<'_> {
    fn drop(&mut self) {
        self.secret.non_secure_erase();
    }
}

/// Signs the unbonding leaf locally with `secret`, which must belong to the
/// covenant key named in `request`.
pub fn sign_with_secret(
    request: &SigningRequest,
    secret: &SecretKeyGuard<'_>,
) -> Result<schnorr::Signature, BackendError> {
    let secp = Secp256k1::new();
    let mut keypair = Keypair::from_secret_key(&secp, secret.secret());

    let result = if keypair.public_key() != request.covenant_public_key {
        Err(BackendError::KeyMismatch(hex::encode(
            request.covenant_public_key.serialize(),
        )))
    } else {
        sign_tx_with_one_script_spend_input_from_tap_leaf(
            &request.unbonding_tx,
            &request.staking_output,
            &keypair,
            request.spend_description.leaf_hash(),
        )
        .map_err(BackendError::Signing)
    };

    keypair.non_secure_erase();
    result
}

/// Exports the covenant key from a bitcoind wallet (`dumpprivkey`) and
/// signs locally.
///
/// The key crosses the wire, so the node connection must be encrypted.
#[derive(Debug, Clone)]
pub struct PrivKeySigner {
    client: Arc<BtcClient>,
}

impl PrivKeySigner {
    pub fn new(client: Arc<BtcClient>) -> Self {
        Self { client }
    }
}

#[async_trait]
impl ExternalBtcSigner for PrivKeySigner {
    async fn raw_signature(&self, request: &SigningRequest) -> Result<SigningResult, BackendError> {
        is_simple_transfer(&request.unbonding_tx).map_err(BackendError::InvalidTransaction)?;

        let client = self.client.clone();
        let address = request.covenant_address.clone();
        let mut private_key = tokio::task::spawn_blocking(move || client.dump_private_key(&address))
            .await
            .map_err(|e| BackendError::Task(e.to_string()))?
            .map_err(BackendError::KeyRetrieval)?;

        let guard = SecretKeyGuard::new(&mut private_key.inner);
        let signature = sign_with_secret(request, &guard)?;
        Ok(SigningResult { signature })
    }
}

// ==================== Backend Selection ====================

/// Which backend the daemon signs with.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SignerType {
    Psbt,
    Privkey,
}

/// The configured signing backend.
#[derive(Debug, Clone)]
pub enum SignerBackend {
    Psbt(PsbtSigner),
    PrivKey(PrivKeySigner),
}

impl SignerBackend {
    pub fn new(signer_type: SignerType, client: Arc<BtcClient>) -> Self {
        match signer_type {
            SignerType::Psbt => SignerBackend::Psbt(PsbtSigner::new(client)),
            SignerType::Privkey => SignerBackend::PrivKey(PrivKeySigner::new(client)),
        }
    }
}

#[async_trait]
impl ExternalBtcSigner for SignerBackend {
    async fn raw_signature(&self, request: &SigningRequest) -> Result<SigningResult, BackendError> {
        match self {
            SignerBackend::Psbt(signer) => signer.raw_signature(request).await,
            SignerBackend::PrivKey(signer) => signer.raw_signature(request).await,
        }
    }
}
