//! Remote covenant signer for Bitcoin staking.
//!
//! A covenant committee member runs this service next to a wallet holding
//! their covenant key. Stakers who want to unbond early send the unbonding
//! transaction they signed; the service checks it against the chain and the
//! staking parameters and, only if it is a legitimate unbonding of a mature
//! stake, returns the covenant member's signature.
//!
//! ## Architecture
//!
//! ```text
//! ┌────────────────┐   HTTP/JSON   ┌─────────────────────────────┐
//! │     Staker     │ ────────────► │ SignerServer                │
//! │ (SignerClient) │ ◄──────────── │  └─ SigningPolicyEngine     │
//! └────────────────┘   signature   │      ├─ BtcChainInfo ───────┼──► bitcoind (txindex)
//!                                  │      ├─ params (JSON)       │
//!                                  │      └─ SignerBackend ──────┼──► bitcoind (wallet)
//!                                  └─────────────────────────────┘
//! ```
//!
//! ## Usage
//!
//! ```bash
//! covenant-signer --config config.toml dump-cfg
//! covenant-signer --config config.toml --params global-params.json start
//! ```

pub mod auth;
pub mod backend;
pub mod chain;
pub mod config;
pub mod metrics;
pub mod params;
pub mod policy;
pub mod protocol;
pub mod server;

#[cfg(test)]
mod testutil;

pub use backend::{
    BackendError, ExternalBtcSigner, PrivKeySigner, PsbtSigner, SignerBackend, SignerType,
    SigningRequest, SigningResult, SpendPathDescription,
};
pub use chain::{BitcoindChainInfo, BtcChainInfo, ChainInfoError, TxInfo};
pub use config::{Config, ConfigError, ParsedConfig};
pub use metrics::SignerMetrics;
pub use params::{BabylonParams, BabylonParamsRetriever, ParamsError, VersionedParamsRetriever};
pub use policy::{ErrorKind, PolicyError, SigningPolicyEngine};
pub use protocol::{
    ErrorCode, ErrorResponse, PublicResponse, SignUnbondingTxRequest, SignUnbondingTxResponse,
};
pub use server::{ClientError, ServerConfig, ServerError, SignerClient, SignerServer};
