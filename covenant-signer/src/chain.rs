//! Chain facts needed to judge a stake: where it was included and how
//! deep it is buried.

use std::sync::Arc;

use async_trait::async_trait;
use bitcoin::{Script, Transaction, Txid};
use covenant_btcclient::{BtcClient, RpcClientError, TxStatus};
use thiserror::Error;
use tracing::debug;

/// Errors from chain lookups.
#[derive(Debug, Error)]
pub enum ChainInfoError {
    #[error("transaction {0} not found")]
    NotFound(Txid),

    #[error("transaction {0} is not in chain")]
    NotInChain(Txid),

    #[error("bitcoind request failed: {0}")]
    Rpc(#[from] RpcClientError),

    #[error("bitcoind task failed: {0}")]
    Task(String),
}

/// A transaction included in the canonical chain.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TxInfo {
    pub tx: Transaction,
    pub inclusion_height: u32,
}

/// Source of chain facts.
///
/// The two lookups are not atomic with respect to each other; a reorg in
/// between may leave the inclusion height above the reported tip.
#[async_trait]
pub trait BtcChainInfo: Send + Sync {
    /// Returns `txid` only if it is confirmed in the canonical chain.
    ///
    /// `pk_script` names an output the transaction must carry, which lets
    /// light clients look the transaction up by script.
    async fn tx_by_hash(&self, txid: &Txid, pk_script: &Script) -> Result<TxInfo, ChainInfoError>;

    async fn best_block_height(&self) -> Result<u32, ChainInfoError>;
}

fn tx_info_from_status(txid: Txid, status: TxStatus) -> Result<TxInfo, ChainInfoError> {
    match status {
        TxStatus::NotFound => Err(ChainInfoError::NotFound(txid)),
        TxStatus::InMempool(_) => Err(ChainInfoError::NotInChain(txid)),
        TxStatus::InChain(confirmed) => Ok(TxInfo {
            tx: confirmed.tx,
            inclusion_height: confirmed.block_height,
        }),
    }
}

/// Chain facts served by a bitcoind node with transaction indexing.
#[derive(Debug, Clone)]
pub struct BitcoindChainInfo {
    client: Arc<BtcClient>,
}

impl BitcoindChainInfo {
    pub fn new(client: Arc<BtcClient>) -> Self {
        Self { client }
    }
}

#[async_trait]
impl BtcChainInfo for BitcoindChainInfo {
    async fn tx_by_hash(&self, txid: &Txid, pk_script: &Script) -> Result<TxInfo, ChainInfoError> {
        let client = self.client.clone();
        let txid = *txid;
        let pk_script = pk_script.to_owned();

        let status = tokio::task::spawn_blocking(move || client.tx_details(&txid, &pk_script))
            .await
            .map_err(|e| ChainInfoError::Task(e.to_string()))??;

        debug!("Staking transaction {} lookup finished", txid);
        tx_info_from_status(txid, status)
    }

    async fn best_block_height(&self) -> Result<u32, ChainInfoError> {
        let client = self.client.clone();
        let height = tokio::task::spawn_blocking(move || client.best_block_height())
            .await
            .map_err(|e| ChainInfoError::Task(e.to_string()))??;
        Ok(height)
    }
}
