//! 見積もり → 選択 → (統合) → ベーストランザクション → アップロード を順に実行する。
//!
//! どの段階も前段の結果だけを入力にとり、失敗したらそこで中断する。再試行はしない。
//! 統合トランザクションがブロードキャストされた後に失敗した場合、元のUTXOはもう使えないので
//! 呼び出し側はパイプラインを最初から実行し直す必要がある。

use crate::{
    config::UploadContext,
    consolidator::{self, ConsolidationOutcome},
    error::{AppError, Stage},
    fee::{self, FeeEstimate},
    finalizer::Finalizer,
    selector::{self, SelectionResult},
    transaction,
    uploader::{self, UploadRequest, UploadResult},
    wallet::WalletSigner,
};

pub struct Pipeline<'a, W, F> {
    wallet: &'a W,
    finalizer: &'a F,
    ctx: &'a UploadContext,
}

impl<'a, W: WalletSigner, F: Finalizer> Pipeline<'a, W, F> {
    pub fn new(wallet: &'a W, finalizer: &'a F, ctx: &'a UploadContext) -> Self {
        Pipeline { wallet, finalizer, ctx }
    }

    pub async fn upload(&self, request: &UploadRequest) -> Result<UploadResult, AppError> {
        log::info!("アップロードを開始します: {} ({} bytes)", request.file_name, request.bytes.len());

        let estimate = self.estimate(request);
        let selection = self.select(&estimate).await?;

        let consolidation = if selection.needs_consolidation() {
            Some(self.consolidate(&selection, &estimate).await?)
        } else {
            None
        };

        let spent = match &consolidation {
            Some(outcome) => vec![outcome.merged_output.clone()],
            None => selection.selected.clone(),
        };
        let pre_signed = transaction::build_and_sign(&spent, &self.ctx.address, self.wallet)
            .await
            .map_err(|e| {
                let detail = format!(
                    "入力 {}",
                    spent.iter().map(|o| format!("{}:{}", o.txid, o.vout)).collect::<Vec<_>>().join(", ")
                );
                if consolidation.is_some() {
                    log::warn!("統合トランザクションは作成済みです。再実行時は新しいUTXOから選択してください。");
                }
                e.in_stage(Stage::BaseTransaction, detail)
            })?;

        uploader::upload(self.finalizer, self.ctx, request, &pre_signed, consolidation.as_ref())
            .await
            .map_err(|e| {
                e.in_stage(
                    Stage::Upload,
                    format!("ベーストランザクション {}, 入力額 {} sats", pre_signed.txid(), pre_signed.total_input_amount().to_sat()),
                )
            })
    }

    fn estimate(&self, request: &UploadRequest) -> FeeEstimate {
        let estimate = fee::estimate_fee(request.bytes.len() as u64, self.ctx.fee_rate);
        log::info!(
            "手数料見積もり: {} bytes × {} sats/byte = {} sats (マージン込み {} sats)",
            estimate.estimated_bytes, estimate.fee_rate_per_byte, estimate.base_fee, estimate.margined_fee
        );
        estimate
    }

    async fn select(&self, estimate: &FeeEstimate) -> Result<SelectionResult, AppError> {
        selector::select_from_wallet(self.wallet, estimate.margined_amount())
            .await
            .map_err(|e| e.in_stage(Stage::Selection, format!("必要額 {} sats", estimate.margined_fee)))
    }

    async fn consolidate(
        &self,
        selection: &SelectionResult,
        estimate: &FeeEstimate,
    ) -> Result<ConsolidationOutcome, AppError> {
        consolidator::consolidate(self.wallet, self.ctx, selection, estimate.margined_amount())
            .await
            .map_err(|e| {
                e.in_stage(
                    Stage::Consolidation,
                    format!("{} 個のUTXO, 目標額 {} sats", selection.selected.len(), estimate.margined_fee),
                )
            })
    }
}

/// 1回分のアップロードを実行する
pub async fn run_upload<W: WalletSigner, F: Finalizer>(
    wallet: &W,
    finalizer: &F,
    ctx: &UploadContext,
    request: &UploadRequest,
) -> Result<UploadResult, AppError> {
    Pipeline::new(wallet, finalizer, ctx).upload(request).await
}
