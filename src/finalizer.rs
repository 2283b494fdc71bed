use std::future::Future;
use reqwest::{
    Client as HttpClient,
    multipart::{Form, Part},
};
use serde::{Deserialize, Serialize};
use crate::{config::UploadContext, error::AppError, uploader::DEFAULT_CONTENT_TYPE};

pub const CREATE_OPERATION: &str = "create";

/// ファイナライザに送るマルチパートの中身
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FinalizeSubmission {
    pub file: Vec<u8>,
    pub file_name: String,
    /// ファイルパートのMIMEタイプ (`;binary` フラグなし)
    pub mime_type: String,
    pub path: String,
    pub merge_tx_hex: Option<String>,
    pub pre_tx_hex: String,
    pub operation: String,
    /// 正規化済み。バイナリは `;binary` 付き
    pub content_type: String,
    pub meta_id: String,
    pub address: String,
    pub change_address: String,
    pub fee_rate: u64,
    pub total_input_amount: u64,
}

#[derive(Serialize, Deserialize, Debug, Clone, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct FinalizeResponse {
    pub code: i64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub message: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub data: Option<FinalizeData>,
}

#[derive(Serialize, Deserialize, Debug, Clone, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct FinalizeData {
    pub tx_id: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub pin_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub status: Option<String>,
}

/// ペイロードのコミットメント出力とおつりを追加してブロードキャストするリモート側
pub trait Finalizer: Send + Sync {
    /// トランスポートが成功すれば応答本文をそのまま返す (`code` の解釈は呼び出し側)
    fn finalize(
        &self,
        submission: &FinalizeSubmission,
    ) -> impl Future<Output = Result<FinalizeResponse, AppError>> + Send;
}

#[derive(Clone, Debug)]
pub struct HttpFinalizer {
    client: HttpClient,
    url: String,
}

impl HttpFinalizer {
    pub fn new(url: String) -> Result<Self, AppError> {
        let client = HttpClient::builder().build().map_err(transport_error)?;
        Ok(HttpFinalizer { client, url })
    }

    pub fn from_context(ctx: &UploadContext) -> Result<Self, AppError> {
        Self::new(ctx.finalizer_url.clone())
    }

    pub fn url(&self) -> &str {
        &self.url
    }

    fn build_form(submission: &FinalizeSubmission) -> Result<Form, AppError> {
        let file_part = || Part::bytes(submission.file.clone()).file_name(submission.file_name.clone());
        // contentType 欄には呼び出し側の値がそのまま残る
        let file_part = match file_part().mime_str(&submission.mime_type) {
            Ok(part) => part,
            Err(_) => {
                log::warn!(
                    "MIMEタイプ {:?} を解釈できません。ファイルパートは {} で送ります。",
                    submission.mime_type, DEFAULT_CONTENT_TYPE
                );
                file_part().mime_str(DEFAULT_CONTENT_TYPE).map_err(transport_error)?
            }
        };

        let mut form = Form::new()
            .part("file", file_part)
            .text("path", submission.path.clone());
        if let Some(merge_tx_hex) = &submission.merge_tx_hex {
            form = form.text("mergeTxHex", merge_tx_hex.clone());
        }
        Ok(form
            .text("preTxHex", submission.pre_tx_hex.clone())
            .text("operation", submission.operation.clone())
            .text("contentType", submission.content_type.clone())
            .text("metaId", submission.meta_id.clone())
            .text("address", submission.address.clone())
            .text("changeAddress", submission.change_address.clone())
            .text("feeRate", submission.fee_rate.to_string())
            .text("totalInputAmount", submission.total_input_amount.to_string()))
    }
}

impl Finalizer for HttpFinalizer {
    async fn finalize(&self, submission: &FinalizeSubmission) -> Result<FinalizeResponse, AppError> {
        let form = Self::build_form(submission)?;
        log::debug!("ファイナライザへ送信します: {} ({} bytes)", self.url, submission.file.len());

        let response = self
            .client
            .post(&self.url)
            .multipart(form)
            .send()
            .await
            .map_err(transport_error)?;

        let status = response.status();
        let body = response.text().await.map_err(transport_error)?;

        if !status.is_success() {
            log::error!("ファイナライザがHTTP {} を返しました。", status);
            let message = serde_json::from_str::<FinalizeResponse>(&body)
                .ok()
                .and_then(|r| r.message)
                .unwrap_or_else(|| format!("HTTP {}: {}", status, body));
            return Err(AppError::UploadFailed { message });
        }

        serde_json::from_str(&body).map_err(|e| AppError::UploadFailed {
            message: format!("ファイナライザの応答を解釈できません: {}", e),
        })
    }
}

fn transport_error(e: reqwest::Error) -> AppError {
    AppError::UploadFailed { message: e.to_string() }
}
