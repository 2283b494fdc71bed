use std::fmt;
use std::path::PathBuf;
use bitcoin::address::ParseError as BitcoinAddressError;
use thiserror::Error;

/// パイプラインのどの段階で失敗したかを示す
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub enum Stage {
    Selection,
    Consolidation,
    BaseTransaction,
    Upload,
}

impl fmt::Display for Stage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Stage::Selection => "UTXO選択",
            Stage::Consolidation => "UTXO統合",
            Stage::BaseTransaction => "ベーストランザクション構築",
            Stage::Upload => "アップロード",
        };
        f.write_str(name)
    }
}

/// ウォレット実装が返すエラー
#[derive(Debug, Error)]
pub enum WalletError {
    #[error("ウォレットは機能 {0} をサポートしていません")]
    Unsupported(&'static str),

    #[error("ウォレットが要求を拒否しました: {0}")]
    Rejected(String),

    #[error("ウォレットエラー: {0}")]
    Other(String),
}

#[derive(Debug, Error)]
pub enum AppError {
    #[error("I/Oエラー: {0}")]
    Io(#[from] std::io::Error),

    #[error("JSONパースエラー ファイル: {file_path:?}, 詳細: {source}")]
    JsonParse {
        file_path: PathBuf,
        #[source]
        source: serde_json::Error,
    },

    #[error("JSONエラー: {0}")]
    Json(#[from] serde_json::Error),

    #[error("Bitcoinアドレスエラー: {0}")]
    BitcoinAddress(#[from] BitcoinAddressError),

    #[error("入力検証エラー: {0}")]
    InputValidation(String),

    #[error("利用可能なUTXOがありません")]
    NoFunds,

    #[error("全てのUTXO ({total} 個) がダスト下限 {dust_floor} sats 以下です")]
    NoUsableFunds { total: usize, dust_floor: u64 },

    #[error("残高不足: 利用可能な総額 {available} sats, 要求額 {required} sats")]
    InsufficientBalance { available: u64, required: u64 },

    #[error("署名機能が利用できません: {0}")]
    SignerUnavailable(String),

    #[error("署名が拒否されました (入力インデックス {input_index}): {reason}")]
    SignatureRejected { input_index: usize, reason: String },

    #[error("UTXO統合に失敗しました: {0}")]
    ConsolidationFailed(String),

    #[error("アップロードに失敗しました: {message}")]
    UploadFailed { message: String },

    #[error("契約違反: {0}")]
    ContractViolation(String),

    #[error("不明なスクリプトタイプ: {script_hex}")]
    UnknownScriptType { script_hex: String },

    #[error("不正な状態遷移: {from:?} -> {to:?}")]
    InvalidStateTransition {
        from: crate::types::BaseTxState,
        to: crate::types::BaseTxState,
    },

    #[error("内部エラー: {0}")]
    Internal(String),

    #[error(transparent)]
    Wallet(#[from] WalletError),

    #[error("{stage}段階で失敗しました ({detail}): {source}")]
    Stage {
        stage: Stage,
        detail: String,
        #[source]
        source: Box<AppError>,
    },
}

impl AppError {
    /// 段階コンテキストを剥がした元のエラー
    pub fn root(&self) -> &AppError {
        match self {
            AppError::Stage { source, .. } => source.root(),
            other => other,
        }
    }

    /// 失敗した段階 (コンテキストが付いている場合)
    pub fn stage(&self) -> Option<Stage> {
        match self {
            AppError::Stage { stage, .. } => Some(*stage),
            _ => None,
        }
    }

    pub(crate) fn in_stage(self, stage: Stage, detail: impl Into<String>) -> Self {
        AppError::Stage {
            stage,
            detail: detail.into(),
            source: Box::new(self),
        }
    }
}
