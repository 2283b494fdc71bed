use std::fs;
use std::path::Path;
use std::str::FromStr;
use bitcoin::{Address, Network as BitcoinNetwork};
use serde::Deserialize;
use crate::error::AppError;

pub const DEFAULT_FEE_RATE: u64 = 1;
pub const DEFAULT_ASSET_SCHEME: &str = "metafile";
pub const DEFAULT_PATH_PREFIX: &str = "/file";

#[derive(Deserialize, Debug, Clone)]
#[serde(rename_all = "camelCase")]
pub struct UploadConfig {
    pub network: String, // "bitcoin", "testnet", "signet", "regtest"
    pub meta_id: String,
    pub address: String,
    #[serde(default)]
    pub change_address: Option<String>,
    #[serde(default)]
    pub fee_rate: Option<u64>,
    pub finalizer_url: String,
    #[serde(default)]
    pub asset_scheme: Option<String>,
    #[serde(default)]
    pub path_prefix: Option<String>,
}

impl UploadConfig {
    pub fn from_json_str(json: &str) -> Result<Self, AppError> {
        Ok(serde_json::from_str(json)?)
    }

    pub fn from_json_file(path: &Path) -> Result<Self, AppError> {
        let content = fs::read_to_string(path).map_err(|e| {
            log::error!("設定ファイルの読み込みに失敗しました: {:?}", path);
            AppError::Io(e)
        })?;
        serde_json::from_str(&content).map_err(|e| AppError::JsonParse {
            file_path: path.to_path_buf(),
            source: e,
        })
    }

    /// アドレスとネットワークを検証して、パイプラインに渡す読み取り専用コンテキストを作る
    pub fn into_context(self) -> Result<UploadContext, AppError> {
        let network = parse_network(&self.network)?;
        let address = parse_address(&self.address, network)?;
        let change_address = match &self.change_address {
            Some(change) => parse_address(change, network)?,
            None => address.clone(),
        };
        if self.meta_id.trim().is_empty() {
            return Err(AppError::InputValidation("metaIdが空です".to_string()));
        }

        Ok(UploadContext {
            network,
            meta_id: self.meta_id,
            address,
            change_address,
            fee_rate: self.fee_rate.unwrap_or(DEFAULT_FEE_RATE),
            finalizer_url: self.finalizer_url,
            asset_scheme: self.asset_scheme.unwrap_or_else(|| DEFAULT_ASSET_SCHEME.to_string()),
            path_prefix: self.path_prefix.unwrap_or_else(|| DEFAULT_PATH_PREFIX.to_string()),
        })
    }
}

/// 並行するアップロード間で共有される読み取り専用の設定
#[derive(Debug, Clone)]
pub struct UploadContext {
    pub network: BitcoinNetwork,
    pub meta_id: String,
    pub address: Address,
    pub change_address: Address,
    pub fee_rate: u64,
    pub finalizer_url: String,
    pub asset_scheme: String,
    pub path_prefix: String,
}

pub fn parse_network(network_str: &str) -> Result<BitcoinNetwork, AppError> {
    match network_str.to_lowercase().as_str() {
        "bitcoin" | "mainnet" => Ok(BitcoinNetwork::Bitcoin),
        "testnet" => Ok(BitcoinNetwork::Testnet),
        "signet" => Ok(BitcoinNetwork::Signet),
        "regtest" => Ok(BitcoinNetwork::Regtest),
        s => Err(AppError::InputValidation(format!("無効なネットワークが指定されました: {}", s))),
    }
}

fn parse_address(address: &str, network: BitcoinNetwork) -> Result<Address, AppError> {
    let address = Address::from_str(address)?.require_network(network)?;
    Ok(address)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_utils;

    fn config_json(extra: &str) -> String {
        format!(
            r#"{{
                "network": "regtest",
                "metaId": "meta-1",
                "address": "{}",
                "finalizerUrl": "http://127.0.0.1:9/finalize"{}
            }}"#,
            test_utils::owner_address(),
            extra
        )
    }

    #[test]
    fn defaults_are_applied() {
        let ctx = UploadConfig::from_json_str(&config_json("")).unwrap().into_context().unwrap();
        assert_eq!(ctx.fee_rate, DEFAULT_FEE_RATE);
        assert_eq!(ctx.asset_scheme, "metafile");
        assert_eq!(ctx.path_prefix, "/file");
        assert_eq!(ctx.change_address, ctx.address);
        assert_eq!(ctx.network, BitcoinNetwork::Regtest);
    }

    #[test]
    fn explicit_values_override_defaults() {
        let ctx = UploadConfig::from_json_str(&config_json(
            r#", "feeRate": 5, "assetScheme": "pin", "pathPrefix": "/docs""#,
        ))
        .unwrap()
        .into_context()
        .unwrap();
        assert_eq!(ctx.fee_rate, 5);
        assert_eq!(ctx.asset_scheme, "pin");
        assert_eq!(ctx.path_prefix, "/docs");
    }

    #[test]
    fn mainnet_address_is_rejected_on_regtest() {
        let json = r#"{
            "network": "regtest",
            "metaId": "meta-1",
            "address": "1BvBMSEYstWetqTFn5Au4m4GFg7xJaNVN2",
            "finalizerUrl": "http://127.0.0.1:9/finalize"
        }"#;
        let err = UploadConfig::from_json_str(json).unwrap().into_context().unwrap_err();
        assert!(matches!(err, AppError::BitcoinAddress(_)));
    }

    #[test]
    fn unknown_network_is_rejected() {
        assert!(matches!(parse_network("litecoin"), Err(AppError::InputValidation(_))));
        assert_eq!(parse_network("MAINNET").unwrap(), BitcoinNetwork::Bitcoin);
    }

    #[test]
    fn missing_file_is_io_error() {
        let err = UploadConfig::from_json_file(Path::new("/nonexistent/uploader.json")).unwrap_err();
        assert!(matches!(err, AppError::Io(_)));
    }
}
