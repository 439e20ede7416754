//! Bitcoind JSON-RPC client for the covenant signer.
//!
//! Thin blocking wrapper over `bitcoincore_rpc` exposing the handful of
//! calls the signer needs: transaction lookups with inclusion height, the
//! chain tip, and the two wallet operations used by the signing backends.

pub mod client;

pub use client::{BtcClient, BtcClientConfig, ConfirmedTx, RpcClientError, TxStatus};

pub use bitcoincore_rpc;
