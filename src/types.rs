use std::fmt;
use std::str::FromStr;
use bitcoin::{Amount, OutPoint, ScriptBuf, Txid, script::Script};
use serde::Deserialize;
use crate::error::AppError;

#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub enum ScriptType {
    P2PKH,
    P2WPKH,
}

impl ScriptType {
    pub fn from_script(script: &Script) -> Result<Self, AppError> {
        if script.is_p2pkh() {
            Ok(ScriptType::P2PKH)
        } else if script.is_p2wpkh() {
            Ok(ScriptType::P2WPKH)
        } else {
            Err(AppError::UnknownScriptType { script_hex: script.to_hex_string() })
        }
    }
}

/// ウォレットから受け取るままのUTXO (ロックスクリプトは16進数)
#[derive(Deserialize, Debug, Clone)]
#[serde(rename_all = "camelCase")]
pub struct RawSpendableOutput {
    pub txid: String,
    pub vout: u32,
    pub script_pubkey_hex: String,
    pub value_sats: u64,
    pub address: String,
}

/// 検証済みのUTXO。取得後は変更されず、統合または構築段階で一度だけ消費される。
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SpendableOutput {
    pub txid: Txid,
    pub vout: u32,
    pub script_pubkey: ScriptBuf,
    pub amount: Amount,
    pub address: String,
}

impl SpendableOutput {
    pub fn out_point(&self) -> OutPoint {
        OutPoint::new(self.txid, self.vout)
    }
}

impl TryFrom<RawSpendableOutput> for SpendableOutput {
    type Error = AppError;

    fn try_from(raw: RawSpendableOutput) -> Result<Self, Self::Error> {
        let txid = Txid::from_str(&raw.txid)
            .map_err(|e| AppError::InputValidation(format!("無効なTXID形式 ({}): {}", raw.txid, e)))?;
        let script_pubkey_bytes = hex::decode(&raw.script_pubkey_hex)
            .map_err(|e| AppError::InputValidation(format!("scriptPubKeyHexのデコード失敗 ({}:{}): {}", raw.txid, raw.vout, e)))?;

        Ok(SpendableOutput {
            txid,
            vout: raw.vout,
            script_pubkey: ScriptBuf::from_bytes(script_pubkey_bytes),
            amount: Amount::from_sat(raw.value_sats),
            address: raw.address,
        })
    }
}

/// ベーストランザクションの状態。`Built -> Signed` のみこのクレートが行い、
/// 以降はファイナライザの成功報告によってのみ記録される。
#[derive(Debug, Copy, Clone, PartialEq, Eq, PartialOrd, Ord)]
pub enum BaseTxState {
    Built,
    Signed,
    Extended,
    Broadcast,
}

impl BaseTxState {
    fn next(self) -> Option<BaseTxState> {
        match self {
            BaseTxState::Built => Some(BaseTxState::Signed),
            BaseTxState::Signed => Some(BaseTxState::Extended),
            BaseTxState::Extended => Some(BaseTxState::Broadcast),
            BaseTxState::Broadcast => None,
        }
    }

    /// 一段階だけ前に進める。飛び越しや後退はエラー。
    pub fn advance(self, to: BaseTxState) -> Result<BaseTxState, AppError> {
        if self.next() == Some(to) {
            Ok(to)
        } else {
            Err(AppError::InvalidStateTransition { from: self, to })
        }
    }
}

/// `{scheme}://{txid}i{index}` 形式のコンテンツ参照
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AssetPointer {
    pub scheme: String,
    pub txid: Txid,
    pub index: u32,
}

impl AssetPointer {
    pub fn new(scheme: impl Into<String>, txid: Txid, index: u32) -> Self {
        AssetPointer { scheme: scheme.into(), txid, index }
    }

    /// `{txid}i{index}` の部分
    pub fn pin_id(&self) -> String {
        format!("{}i{}", self.txid, self.index)
    }
}

impl fmt::Display for AssetPointer {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}://{}", self.scheme, self.pin_id())
    }
}

impl FromStr for AssetPointer {
    type Err = AppError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let invalid = || AppError::InputValidation(format!("無効なアセットポインタ: {}", s));

        let (scheme, pin_id) = s.split_once("://").ok_or_else(invalid)?;
        if scheme.is_empty() {
            return Err(invalid());
        }
        let (txid, index) = pin_id.rsplit_once('i').ok_or_else(invalid)?;
        let txid = Txid::from_str(txid).map_err(|_| invalid())?;
        let index = index.parse::<u32>().map_err(|_| invalid())?;

        Ok(AssetPointer::new(scheme, txid, index))
    }
}
