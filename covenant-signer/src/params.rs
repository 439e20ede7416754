//! Versioned staking parameters.
//!
//! The protocol's economic parameters change over time. Each version is
//! active from its activation height until the next version activates, and
//! a stake is always judged by the version active at its inclusion height.

use std::collections::HashSet;
use std::path::{Path, PathBuf};

use async_trait::async_trait;
use bitcoin::secp256k1::{PublicKey, XOnlyPublicKey};
use bitcoin::Amount;
use covenant_staking::TAG_LEN;
use serde::Deserialize;
use thiserror::Error;
use tracing::info;

/// Errors from loading or querying staking parameters.
#[derive(Debug, Error)]
pub enum ParamsError {
    #[error("no global params for height {0}")]
    NotFound(u64),

    #[error("failed to read params file {path:?}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("failed to parse params: {0}")]
    Json(#[from] serde_json::Error),

    #[error("global params must contain at least one version")]
    Empty,

    #[error("invalid params version {version}: {reason}")]
    Invalid { version: u64, reason: String },
}

/// One version of the staking parameters.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BabylonParams {
    /// Covenant committee, in configuration order
    pub covenant_public_keys: Vec<PublicKey>,
    pub covenant_quorum: u32,
    /// Tag marking staking transactions of this protocol instance
    pub magic_bytes: [u8; TAG_LEN],
    /// Relative timelock of the unbonding output, in blocks
    pub unbonding_time: u16,
    pub unbonding_fee: Amount,
    pub max_staking_amount: Amount,
    pub min_staking_amount: Amount,
    pub max_staking_time: u16,
    pub min_staking_time: u16,
    /// Blocks, counting the including block, before a stake may unbond
    pub confirmation_depth: u16,
}

impl BabylonParams {
    /// Covenant keys as they appear in tapscripts.
    pub fn covenant_x_only_keys(&self) -> Vec<XOnlyPublicKey> {
        self.covenant_public_keys
            .iter()
            .map(|pk| pk.x_only_public_key().0)
            .collect()
    }

    pub fn is_covenant_member(&self, key: &PublicKey) -> bool {
        self.covenant_public_keys.iter().any(|k| k == key)
    }
}

/// Resolves the parameter version governing a given block height.
#[async_trait]
pub trait BabylonParamsRetriever: Send + Sync {
    async fn params_by_height(&self, height: u64) -> Result<BabylonParams, ParamsError>;
}

#[derive(Debug, Deserialize)]
struct GlobalParamsFile {
    versions: Vec<VersionedParamsEntry>,
}

#[derive(Debug, Deserialize)]
struct VersionedParamsEntry {
    version: u64,
    activation_height: u64,
    tag: String,
    covenant_pks: Vec<String>,
    covenant_quorum: u32,
    unbonding_time: u64,
    unbonding_fee: u64,
    max_staking_amount: u64,
    min_staking_amount: u64,
    max_staking_time: u64,
    min_staking_time: u64,
    confirmation_depth: u64,
}

fn to_u16(version: u64, field: &str, value: u64) -> Result<u16, ParamsError> {
    u16::try_from(value).map_err(|_| ParamsError::Invalid {
        version,
        reason: format!("{} {} does not fit in 16 bits", field, value),
    })
}

impl VersionedParamsEntry {
    fn parse(self) -> Result<VersionedParams, ParamsError> {
        let version = self.version;
        let invalid = |reason: String| ParamsError::Invalid { version, reason };

        let tag = hex::decode(&self.tag).map_err(|e| invalid(format!("invalid tag: {}", e)))?;
        let magic_bytes: [u8; TAG_LEN] = tag
            .as_slice()
            .try_into()
            .map_err(|_| invalid(format!("tag must be {} bytes, got {}", TAG_LEN, tag.len())))?;

        if self.covenant_pks.is_empty() {
            return Err(invalid("empty covenant public keys".to_string()));
        }

        let mut covenant_public_keys = Vec::with_capacity(self.covenant_pks.len());
        let mut seen = HashSet::new();
        for pk_hex in &self.covenant_pks {
            let bytes = hex::decode(pk_hex)
                .map_err(|e| invalid(format!("invalid covenant key {}: {}", pk_hex, e)))?;
            if bytes.len() != 33 {
                return Err(invalid(format!(
                    "covenant key {} is not a compressed public key",
                    pk_hex
                )));
            }
            let pk = PublicKey::from_slice(&bytes)
                .map_err(|e| invalid(format!("invalid covenant key {}: {}", pk_hex, e)))?;
            // Scripts commit to x-only keys, so two keys differing only in
            // parity would collide there.
            if !seen.insert(pk.x_only_public_key().0) {
                return Err(invalid(format!("duplicate covenant key {}", pk_hex)));
            }
            covenant_public_keys.push(pk);
        }

        if self.covenant_quorum == 0 || self.covenant_quorum as usize > covenant_public_keys.len() {
            return Err(invalid(format!(
                "covenant quorum {} invalid for {} keys",
                self.covenant_quorum,
                covenant_public_keys.len()
            )));
        }

        let unbonding_time = to_u16(version, "unbonding time", self.unbonding_time)?;
        if unbonding_time == 0 {
            return Err(invalid("unbonding time must be positive".to_string()));
        }

        if self.unbonding_fee == 0 {
            return Err(invalid("unbonding fee must be positive".to_string()));
        }

        if self.min_staking_amount == 0 || self.min_staking_amount > self.max_staking_amount {
            return Err(invalid(format!(
                "invalid staking amount range [{}, {}]",
                self.min_staking_amount, self.max_staking_amount
            )));
        }

        let min_staking_time = to_u16(version, "min staking time", self.min_staking_time)?;
        let max_staking_time = to_u16(version, "max staking time", self.max_staking_time)?;
        if min_staking_time == 0 || min_staking_time > max_staking_time {
            return Err(invalid(format!(
                "invalid staking time range [{}, {}]",
                min_staking_time, max_staking_time
            )));
        }

        let confirmation_depth = to_u16(version, "confirmation depth", self.confirmation_depth)?;
        if confirmation_depth == 0 {
            return Err(invalid("confirmation depth must be positive".to_string()));
        }

        if self.unbonding_fee >= self.max_staking_amount {
            return Err(invalid(format!(
                "unbonding fee {} must be lower than max staking amount {}",
                self.unbonding_fee, self.max_staking_amount
            )));
        }

        Ok(VersionedParams {
            version,
            activation_height: self.activation_height,
            params: BabylonParams {
                covenant_public_keys,
                covenant_quorum: self.covenant_quorum,
                magic_bytes,
                unbonding_time,
                unbonding_fee: Amount::from_sat(self.unbonding_fee),
                max_staking_amount: Amount::from_sat(self.max_staking_amount),
                min_staking_amount: Amount::from_sat(self.min_staking_amount),
                max_staking_time,
                min_staking_time,
                confirmation_depth,
            },
        })
    }
}

/// A parameter version and the height it takes effect at.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct VersionedParams {
    pub version: u64,
    pub activation_height: u64,
    pub params: BabylonParams,
}

/// Parameter versions loaded once at startup and never modified.
#[derive(Debug, Clone)]
pub struct VersionedParamsRetriever {
    versions: Vec<VersionedParams>,
}

impl VersionedParamsRetriever {
    /// Validates that versions are numbered from 0 and activate at strictly
    /// increasing heights.
    pub fn new(versions: Vec<VersionedParams>) -> Result<Self, ParamsError> {
        if versions.is_empty() {
            return Err(ParamsError::Empty);
        }

        for (idx, v) in versions.iter().enumerate() {
            if v.version != idx as u64 {
                return Err(ParamsError::Invalid {
                    version: v.version,
                    reason: format!("expected version {}", idx),
                });
            }
            if idx > 0 && v.activation_height <= versions[idx - 1].activation_height {
                return Err(ParamsError::Invalid {
                    version: v.version,
                    reason: format!(
                        "activation height {} must be greater than {}",
                        v.activation_height,
                        versions[idx - 1].activation_height
                    ),
                });
            }
        }

        Ok(Self { versions })
    }

    pub fn from_json(json: &str) -> Result<Self, ParamsError> {
        let file: GlobalParamsFile = serde_json::from_str(json)?;
        let versions = file
            .versions
            .into_iter()
            .map(VersionedParamsEntry::parse)
            .collect::<Result<Vec<_>, _>>()?;
        Self::new(versions)
    }

    pub fn from_file(path: &Path) -> Result<Self, ParamsError> {
        let json = std::fs::read_to_string(path).map_err(|source| ParamsError::Io {
            path: path.to_path_buf(),
            source,
        })?;
        let retriever = Self::from_json(&json)?;
        info!(
            "Loaded {} global params versions from {:?}",
            retriever.versions.len(),
            path
        );
        Ok(retriever)
    }

    pub fn versions(&self) -> &[VersionedParams] {
        &self.versions
    }

    /// The version with the latest activation height not above `height`.
    pub fn versioned_params_at(&self, height: u64) -> Option<&VersionedParams> {
        let idx = self
            .versions
            .partition_point(|v| v.activation_height <= height);
        idx.checked_sub(1).map(|i| &self.versions[i])
    }
}

#[async_trait]
impl BabylonParamsRetriever for VersionedParamsRetriever {
    async fn params_by_height(&self, height: u64) -> Result<BabylonParams, ParamsError> {
        self.versioned_params_at(height)
            .map(|v| v.params.clone())
            .ok_or(ParamsError::NotFound(height))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use bitcoin::secp256k1::{Secp256k1, SecretKey};
    use serde_json::{json, Value};
    use std::io::Write;

    fn covenant_pk_hex(seed: u8) -> String {
        let secp = Secp256k1::new();
        let sk = SecretKey::from_slice(&[seed; 32]).unwrap();
        hex::encode(PublicKey::from_secret_key(&secp, &sk).serialize())
    }

    fn version_json(version: u64, activation_height: u64) -> Value {
        json!({
            "version": version,
            "activation_height": activation_height,
            "staking_cap": 0,
            "tag": "01020304",
            "covenant_pks": [covenant_pk_hex(1), covenant_pk_hex(2), covenant_pk_hex(3)],
            "covenant_quorum": 2,
            "unbonding_time": 1000,
            "unbonding_fee": 1000,
            "max_staking_amount": 300000,
            "min_staking_amount": 3000,
            "max_staking_time": 10000,
            "min_staking_time": 100,
            "confirmation_depth": 10
        })
    }

    fn params_json(versions: Vec<Value>) -> String {
        json!({ "versions": versions }).to_string()
    }

    fn parse_single(modify: impl FnOnce(&mut Value)) -> Result<VersionedParamsRetriever, ParamsError> {
        let mut v = version_json(0, 100);
        modify(&mut v);
        VersionedParamsRetriever::from_json(&params_json(vec![v]))
    }

    // ==================== Lookup Tests ====================

    #[test]
    fn test_parse_valid_params() {
        let retriever = parse_single(|_| {}).unwrap();
        let params = &retriever.versions()[0].params;

        assert_eq!(params.magic_bytes, [1, 2, 3, 4]);
        assert_eq!(params.covenant_public_keys.len(), 3);
        assert_eq!(params.covenant_quorum, 2);
        assert_eq!(params.unbonding_fee, Amount::from_sat(1000));
        assert_eq!(params.confirmation_depth, 10);
    }

    #[tokio::test]
    async fn test_params_by_height_selects_latest_activation() {
        let mut second = version_json(1, 200);
        second["confirmation_depth"] = json!(20);
        let retriever = VersionedParamsRetriever::from_json(&params_json(vec![
            version_json(0, 100),
            second,
        ]))
        .unwrap();

        assert!(matches!(
            retriever.params_by_height(99).await,
            Err(ParamsError::NotFound(99))
        ));
        assert_eq!(retriever.params_by_height(100).await.unwrap().confirmation_depth, 10);
        assert_eq!(retriever.params_by_height(199).await.unwrap().confirmation_depth, 10);
        assert_eq!(retriever.params_by_height(200).await.unwrap().confirmation_depth, 20);
        assert_eq!(retriever.params_by_height(u64::MAX).await.unwrap().confirmation_depth, 20);
    }

    #[test]
    fn test_covenant_membership_uses_full_key() {
        let retriever = parse_single(|_| {}).unwrap();
        let params = &retriever.versions()[0].params;

        let member = PublicKey::from_slice(&hex::decode(covenant_pk_hex(2)).unwrap()).unwrap();
        let outsider = PublicKey::from_slice(&hex::decode(covenant_pk_hex(9)).unwrap()).unwrap();

        assert!(params.is_covenant_member(&member));
        assert!(!params.is_covenant_member(&outsider));
    }

    // ==================== Validation Tests ====================

    #[test]
    fn test_rejects_empty_versions() {
        assert!(matches!(
            VersionedParamsRetriever::from_json(&params_json(vec![])),
            Err(ParamsError::Empty)
        ));
    }

    #[test]
    fn test_rejects_version_gap() {
        let result = VersionedParamsRetriever::from_json(&params_json(vec![
            version_json(0, 100),
            version_json(2, 200),
        ]));
        assert!(matches!(result, Err(ParamsError::Invalid { version: 2, .. })));
    }

    #[test]
    fn test_rejects_non_increasing_activation() {
        let result = VersionedParamsRetriever::from_json(&params_json(vec![
            version_json(0, 100),
            version_json(1, 100),
        ]));
        assert!(matches!(result, Err(ParamsError::Invalid { version: 1, .. })));
    }

    #[test]
    fn test_rejects_bad_tag() {
        assert!(parse_single(|v| v["tag"] = json!("010203")).is_err());
        assert!(parse_single(|v| v["tag"] = json!("zz020304")).is_err());
    }

    #[test]
    fn test_rejects_duplicate_covenant_keys() {
        let result = parse_single(|v| {
            v["covenant_pks"] = json!([covenant_pk_hex(1), covenant_pk_hex(1)]);
        });
        assert!(matches!(result, Err(ParamsError::Invalid { .. })));
    }

    #[test]
    fn test_rejects_uncompressed_covenant_key() {
        let secp = Secp256k1::new();
        let sk = SecretKey::from_slice(&[5u8; 32]).unwrap();
        let uncompressed = hex::encode(PublicKey::from_secret_key(&secp, &sk).serialize_uncompressed());
        assert!(parse_single(|v| v["covenant_pks"] = json!([uncompressed])).is_err());
    }

    #[test]
    fn test_rejects_quorum_above_key_count() {
        assert!(parse_single(|v| v["covenant_quorum"] = json!(4)).is_err());
        assert!(parse_single(|v| v["covenant_quorum"] = json!(0)).is_err());
    }

    #[test]
    fn test_rejects_inverted_ranges() {
        assert!(parse_single(|v| v["min_staking_amount"] = json!(400000)).is_err());
        assert!(parse_single(|v| v["min_staking_time"] = json!(20000)).is_err());
        assert!(parse_single(|v| v["max_staking_time"] = json!(70000)).is_err());
    }

    #[test]
    fn test_rejects_zero_values() {
        assert!(parse_single(|v| v["unbonding_time"] = json!(0)).is_err());
        assert!(parse_single(|v| v["unbonding_fee"] = json!(0)).is_err());
        assert!(parse_single(|v| v["confirmation_depth"] = json!(0)).is_err());
    }

    #[test]
    fn test_rejects_fee_not_below_max_amount() {
        assert!(parse_single(|v| v["unbonding_fee"] = json!(300000)).is_err());
    }

    #[test]
    fn test_load_from_file() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        file.write_all(params_json(vec![version_json(0, 100)]).as_bytes())
            .unwrap();

        let retriever = VersionedParamsRetriever::from_file(file.path()).unwrap();
        assert_eq!(retriever.versions().len(), 1);
    }

    #[test]
    fn test_load_missing_file() {
        let dir = tempfile::TempDir::new().unwrap();
        let result = VersionedParamsRetriever::from_file(&dir.path().join("missing.json"));
        assert!(matches!(result, Err(ParamsError::Io { .. })));
    }
}
