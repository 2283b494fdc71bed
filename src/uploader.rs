use std::str::FromStr;
use bitcoin::Txid;
use crate::{
    config::UploadContext,
    consolidator::ConsolidationOutcome,
    error::AppError,
    finalizer::{CREATE_OPERATION, FinalizeResponse, FinalizeSubmission, Finalizer},
    transaction::PreSignedTransaction,
    types::{AssetPointer, BaseTxState},
};

pub const DEFAULT_CONTENT_TYPE: &str = "application/octet-stream";
pub const BINARY_FLAG: &str = ";binary";

/// ファイナライザがペイロードを置く出力の位置
pub const ASSET_OUTPUT_INDEX: u32 = 0;

const TEXT_CONTENT_TYPES: &[&str] = &[
    "application/json",
    "application/javascript",
    "application/xml",
    "image/svg+xml",
];

/// アップロードするファイル
#[derive(Debug, Clone)]
pub struct UploadRequest {
    pub file_name: String,
    pub content_type: String,
    pub bytes: Vec<u8>,
    /// 省略時は `{path_prefix}/{file_name}`
    pub path: Option<String>,
}

impl UploadRequest {
    pub fn new(file_name: impl Into<String>, content_type: impl Into<String>, bytes: Vec<u8>) -> Self {
        UploadRequest {
            file_name: file_name.into(),
            content_type: content_type.into(),
            bytes,
            path: None,
        }
    }

    pub fn with_path(mut self, path: impl Into<String>) -> Self {
        self.path = Some(path.into());
        self
    }

    pub fn logical_path(&self, path_prefix: &str) -> String {
        match &self.path {
            Some(path) => path.clone(),
            None => format!("{}/{}", path_prefix.trim_end_matches('/'), self.file_name),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct UploadResult {
    pub final_txid: Txid,
    pub asset_pointer: AssetPointer,
    /// サーバーが返した状態 (あれば)
    pub status: Option<String>,
    pub state: BaseTxState,
}

/// 空白除去・小文字化し、テキスト以外には `;binary` を一度だけ付ける
pub fn normalize_content_type(content_type: &str) -> String {
    let normalized = content_type.trim().to_lowercase();
    let base = normalized.strip_suffix(BINARY_FLAG).unwrap_or(&normalized).trim();
    let base = if base.is_empty() { DEFAULT_CONTENT_TYPE } else { base };

    if is_text_content_type(base) {
        base.to_string()
    } else {
        format!("{}{}", base, BINARY_FLAG)
    }
}

fn is_text_content_type(content_type: &str) -> bool {
    let essence = content_type.split(';').next().unwrap_or("").trim();
    essence.starts_with("text/") || TEXT_CONTENT_TYPES.contains(&essence)
}

/// ファイル、署名済みベーストランザクション、(あれば) 統合トランザクションを送る
pub async fn upload<F: Finalizer>(
    finalizer: &F,
    ctx: &UploadContext,
    request: &UploadRequest,
    pre_signed: &PreSignedTransaction,
    consolidation: Option<&ConsolidationOutcome>,
) -> Result<UploadResult, AppError> {
    let content_type = normalize_content_type(&request.content_type);
    let mime_type = content_type
        .strip_suffix(BINARY_FLAG)
        .unwrap_or(&content_type)
        .to_string();

    let submission = FinalizeSubmission {
        file: request.bytes.clone(),
        file_name: request.file_name.clone(),
        mime_type,
        path: request.logical_path(&ctx.path_prefix),
        merge_tx_hex: consolidation.map(|c| c.merge_tx_hex()),
        pre_tx_hex: pre_signed.to_hex(),
        operation: CREATE_OPERATION.to_string(),
        content_type,
        meta_id: ctx.meta_id.clone(),
        address: ctx.address.to_string(),
        change_address: ctx.change_address.to_string(),
        fee_rate: ctx.fee_rate,
        total_input_amount: pre_signed.total_input_amount().to_sat(),
    };
    log::info!(
        "ファイナライザへ送信します: path={}, contentType={}, {} bytes, 統合トランザクション={}",
        submission.path,
        submission.content_type,
        submission.file.len(),
        submission.merge_tx_hex.is_some()
    );

    let response = finalizer.finalize(&submission).await?;
    interpret_response(response, ctx, pre_signed.state())
}

/// `code != 0` はサーバーのメッセージをそのまま持つ `UploadFailed`
pub fn interpret_response(
    response: FinalizeResponse,
    ctx: &UploadContext,
    state: BaseTxState,
) -> Result<UploadResult, AppError> {
    if response.code != 0 {
        let message = response
            .message
            .unwrap_or_else(|| format!("ファイナライザがコード {} を返しました", response.code));
        log::error!("ファイナライザが失敗を返しました (code {}): {}", response.code, message);
        return Err(AppError::UploadFailed { message });
    }

    let data = response.data.ok_or_else(|| AppError::UploadFailed {
        message: "ファイナライザの応答に data がありません".to_string(),
    })?;
    let final_txid = Txid::from_str(&data.tx_id).map_err(|e| AppError::UploadFailed {
        message: format!("ファイナライザが無効なTXIDを返しました ({}): {}", data.tx_id, e),
    })?;

    // 成功報告によってのみ Extended / Broadcast を記録する
    let state = state
        .advance(BaseTxState::Extended)?
        .advance(BaseTxState::Broadcast)?;

    let asset_pointer = AssetPointer::new(ctx.asset_scheme.clone(), final_txid, ASSET_OUTPUT_INDEX);
    if let Some(pin_id) = &data.pin_id {
        if *pin_id != asset_pointer.pin_id() {
            log::warn!("サーバーのpinId {} が {} と一致しません。", pin_id, asset_pointer.pin_id());
        }
    }
    log::info!("アップロード完了: {}", asset_pointer);

    Ok(UploadResult {
        final_txid,
        asset_pointer,
        status: data.status,
        state,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{
        finalizer::FinalizeData,
        test_utils::{test_context, FINAL_TXID},
    };

    #[test]
    fn content_type_normalization() {
        assert_eq!(normalize_content_type("image/png"), "image/png;binary");
        assert_eq!(normalize_content_type(" IMAGE/PNG "), "image/png;binary");
        assert_eq!(normalize_content_type("image/png;binary"), "image/png;binary");
        assert_eq!(normalize_content_type("text/html"), "text/html");
        assert_eq!(normalize_content_type("text/plain; charset=utf-8"), "text/plain; charset=utf-8");
        assert_eq!(normalize_content_type("application/json"), "application/json");
        assert_eq!(normalize_content_type("image/svg+xml"), "image/svg+xml");
        assert_eq!(normalize_content_type(""), "application/octet-stream;binary");
    }

    #[test]
    fn logical_path_defaults_to_prefix_and_name() {
        let request = UploadRequest::new("cat.png", "image/png", vec![1, 2, 3]);
        assert_eq!(request.logical_path("/file"), "/file/cat.png");
        assert_eq!(request.logical_path("/file/"), "/file/cat.png");
        assert_eq!(request.with_path("/nft/cat").logical_path("/file"), "/nft/cat");
    }

    #[test]
    fn non_zero_code_carries_server_message_verbatim() {
        let response = FinalizeResponse {
            code: 1,
            message: Some("insufficient fee".to_string()),
            data: None,
        };
        match interpret_response(response, &test_context(), BaseTxState::Signed) {
            Err(AppError::UploadFailed { message }) => assert_eq!(message, "insufficient fee"),
            other => panic!("unexpected result: {other:?}"),
        }
    }

    #[test]
    fn success_builds_asset_pointer_from_txid() {
        let response = FinalizeResponse {
            code: 0,
            message: None,
            data: Some(FinalizeData {
                tx_id: FINAL_TXID.to_string(),
                pin_id: None,
                status: Some("mempool".to_string()),
            }),
        };
        let result = interpret_response(response, &test_context(), BaseTxState::Signed).unwrap();
        assert_eq!(result.final_txid.to_string(), FINAL_TXID);
        assert_eq!(result.asset_pointer.to_string(), format!("metafile://{}i0", FINAL_TXID));
        assert_eq!(result.status.as_deref(), Some("mempool"));
        assert_eq!(result.state, BaseTxState::Broadcast);
    }

    #[test]
    fn success_without_data_or_valid_txid_fails() {
        let missing = FinalizeResponse { code: 0, message: None, data: None };
        assert!(matches!(
            interpret_response(missing, &test_context(), BaseTxState::Signed),
            Err(AppError::UploadFailed { .. })
        ));

        let bad_txid = FinalizeResponse {
            code: 0,
            message: None,
            data: Some(FinalizeData { tx_id: "zz".to_string(), pin_id: None, status: None }),
        };
        assert!(matches!(
            interpret_response(bad_txid, &test_context(), BaseTxState::Signed),
            Err(AppError::UploadFailed { .. })
        ));
    }

    #[test]
    fn unsigned_transaction_cannot_be_reported_broadcast() {
        let response = FinalizeResponse {
            code: 0,
            message: None,
            data: Some(FinalizeData { tx_id: FINAL_TXID.to_string(), pin_id: None, status: None }),
        };
        let err = interpret_response(response, &test_context(), BaseTxState::Built).unwrap_err();
        assert!(matches!(err, AppError::InvalidStateTransition { .. }));
    }
}
