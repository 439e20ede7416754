//! Blocking bitcoind RPC client.

use std::str::FromStr;

use bitcoin::{Address, BlockHash, PrivateKey, Psbt, Script, Transaction, Txid};
use bitcoincore_rpc::jsonrpc;
use bitcoincore_rpc::{Auth, Client, RpcApi};
use thiserror::Error;
use tracing::debug;

/// bitcoind's RPC_INVALID_ADDRESS_OR_KEY, returned for unknown transactions.
const RPC_INVALID_ADDRESS_OR_KEY: i32 = -5;

/// Errors from the bitcoind RPC client.
#[derive(Debug, Error)]
pub enum RpcClientError {
    #[error("bitcoind rpc error: {0}")]
    Rpc(#[from] bitcoincore_rpc::Error),

    #[error("failed to decode transaction {txid}: {reason}")]
    InvalidTransaction { txid: Txid, reason: String },

    #[error("wallet returned invalid psbt: {0}")]
    InvalidPsbt(String),

    #[error("block height {0} out of range")]
    HeightOutOfRange(u64),
}

/// Connection settings for a bitcoind node.
#[derive(Debug, Clone)]
pub struct BtcClientConfig {
    /// `host:port`, optionally prefixed with a scheme
    pub host: String,
    pub user: String,
    pub pass: String,
}

impl BtcClientConfig {
    /// RPC endpoint URL, defaulting to plain http.
    pub fn url(&self) -> String {
        if self.host.starts_with("http://") || self.host.starts_with("https://") {
            self.host.clone()
        } else {
            format!("http://{}", self.host)
        }
    }
}

/// A transaction included in a main chain block.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ConfirmedTx {
    pub tx: Transaction,
    pub block_hash: BlockHash,
    pub block_height: u32,
}

/// Where a transaction currently lives, as far as the node knows.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TxStatus {
    NotFound,
    InMempool(Transaction),
    InChain(ConfirmedTx),
}

/// Blocking bitcoind client.
///
/// Every call performs network IO on the calling thread; async callers
/// should move calls onto a blocking pool.
pub struct BtcClient {
    rpc: Client,
}

impl std::fmt::Debug for BtcClient {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("BtcClient").finish_non_exhaustive()
    }
}

fn is_not_found(err: &bitcoincore_rpc::Error) -> bool {
    matches!(
        err,
        bitcoincore_rpc::Error::JsonRpc(jsonrpc::Error::Rpc(e)) if e.code == RPC_INVALID_ADDRESS_OR_KEY
    )
}

impl BtcClient {
    pub fn new(config: &BtcClientConfig) -> Result<Self, RpcClientError> {
        let rpc = Client::new(
            &config.url(),
            Auth::UserPass(config.user.clone(), config.pass.clone()),
        )?;
        Ok(Self { rpc })
    }

    /// Looks up `txid` and reports whether it is unknown, in the mempool or
    /// confirmed on the main chain.
    ///
    /// A transaction without an output paying to `pk_script` is reported as
    /// not found. Requires bitcoind to run with `txindex=1`.
    pub fn tx_details(&self, txid: &Txid, pk_script: &Script) -> Result<TxStatus, RpcClientError> {
        let info = match self.rpc.get_raw_transaction_info(txid, None) {
            Ok(info) => info,
            Err(e) if is_not_found(&e) => {
                debug!("Transaction {} not known to bitcoind", txid);
                return Ok(TxStatus::NotFound);
            }
            Err(e) => return Err(e.into()),
        };

        let tx = info
            .transaction()
            .map_err(|e| RpcClientError::InvalidTransaction {
                txid: *txid,
                reason: e.to_string(),
            })?;

        if !tx.output.iter().any(|out| out.script_pubkey.as_script() == pk_script) {
            debug!("Transaction {} has no output paying to {}", txid, pk_script);
            return Ok(TxStatus::NotFound);
        }

        let Some(block_hash) = info.blockhash else {
            return Ok(TxStatus::InMempool(tx));
        };

        let header = self.rpc.get_block_header_info(&block_hash)?;
        if header.confirmations < 0 {
            debug!(
                "Transaction {} is in block {} which left the main chain",
                txid, block_hash
            );
            return Ok(TxStatus::NotFound);
        }

        let block_height = u32::try_from(header.height)
            .map_err(|_| RpcClientError::HeightOutOfRange(header.height as u64))?;

        Ok(TxStatus::InChain(ConfirmedTx {
            tx,
            block_hash,
            block_height,
        }))
    }

    /// Height of the current chain tip.
    pub fn best_block_height(&self) -> Result<u32, RpcClientError> {
        let count = self.rpc.get_block_count()?;
        u32::try_from(count).map_err(|_| RpcClientError::HeightOutOfRange(count))
    }

    /// Exports the wallet's private key for `address` (`dumpprivkey`).
    pub fn dump_private_key(&self, address: &Address) -> Result<PrivateKey, RpcClientError> {
        Ok(self.rpc.dump_private_key(address)?)
    }

    /// Has the wallet sign every input it can (`walletprocesspsbt`).
    ///
    /// The sighash type is left to the PSBT inputs themselves.
    pub fn sign_psbt(&self, psbt: &Psbt) -> Result<Psbt, RpcClientError> {
        let result = self
            .rpc
            .wallet_process_psbt(&psbt.to_string(), Some(true), None, None)?;

        Psbt::from_str(&result.psbt).map_err(|e| RpcClientError::InvalidPsbt(e.to_string()))
    }
}
