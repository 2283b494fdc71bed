//! 複数のUTXOを自分宛の1出力にまとめる。
//!
//! 入力選択・おつり計算・署名はすべてウォレットの `fund_and_sign` に任せ、ここでは
//! 欲しい出力を1つ指定するだけ。返ってきたトランザクションから自分宛の出力を探し、
//! 見つからなければ出力0を採用する (互換性のための寛容な挙動)。

use bitcoin::{Address, Amount, Network, Transaction, Txid, consensus::deserialize};
use crate::{
    config::UploadContext,
    error::{AppError, WalletError},
    selector::SelectionResult,
    types::SpendableOutput,
    wallet::{FundingOutput, WalletSigner},
};

// 自分宛の出力が見つからない時に使う位置
const FALLBACK_OUTPUT_INDEX: usize = 0;

/// 統合出力をどうやって特定したか
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub enum MergedOutputMatch {
    /// ロックスクリプトをデコードしたアドレスが自分のアドレスと一致した
    Verified,
    /// 一致する出力がなく、出力0を採用した
    Fallback,
}

#[derive(Debug, Clone)]
pub struct ConsolidationOutcome {
    pub merged_output: SpendableOutput,
    pub merge_txid: Txid,
    pub merge_tx_bytes: Vec<u8>,
    pub matched: MergedOutputMatch,
}

impl ConsolidationOutcome {
    pub fn merge_tx_hex(&self) -> String {
        hex::encode(&self.merge_tx_bytes)
    }
}

pub async fn consolidate<W: WalletSigner>(
    wallet: &W,
    ctx: &UploadContext,
    selection: &SelectionResult,
    target: Amount,
) -> Result<ConsolidationOutcome, AppError> {
    if !selection.needs_consolidation() {
        return Err(AppError::ContractViolation(format!(
            "統合は2つ以上のUTXOが選択された場合のみ行います (選択数: {})",
            selection.selected.len()
        )));
    }

    log::info!(
        "{} 個のUTXO (合計 {} sats) を {} sats の1出力に統合します。",
        selection.selected.len(), selection.total_amount.to_sat(), target.to_sat()
    );

    let requested = [FundingOutput {
        address: ctx.address.to_string(),
        amount: target,
    }];
    let signed_transactions = wallet
        .fund_and_sign(&requested, ctx.fee_rate)
        .await
        .map_err(|e| match e {
            WalletError::Unsupported(capability) => AppError::SignerUnavailable(capability.to_string()),
            other => AppError::ConsolidationFailed(other.to_string()),
        })?;

    let merge_tx_bytes = signed_transactions
        .into_iter()
        .next()
        .ok_or_else(|| AppError::ConsolidationFailed("署名済みトランザクションが返されませんでした".to_string()))?;
    let merge_tx: Transaction = deserialize(&merge_tx_bytes)
        .map_err(|e| AppError::ConsolidationFailed(format!("統合トランザクションをデコードできません: {}", e)))?;
    if merge_tx.output.is_empty() {
        return Err(AppError::ConsolidationFailed("統合トランザクションに出力がありません".to_string()));
    }

    let merge_txid = merge_tx.compute_txid();
    let (index, matched) = match locate_merged_output(&merge_tx, &ctx.address, ctx.network, target) {
        Some(index) => {
            log::info!("統合出力を特定しました: {}:{}", merge_txid, index);
            (index, MergedOutputMatch::Verified)
        }
        None => {
            log::warn!(
                "統合トランザクション {} に自分宛 ({}) の出力が見つかりません。出力 {} を統合出力として扱います (未検証)。",
                merge_txid, ctx.address, FALLBACK_OUTPUT_INDEX
            );
            (FALLBACK_OUTPUT_INDEX, MergedOutputMatch::Fallback)
        }
    };

    let output = &merge_tx.output[index];
    if output.value != target {
        log::warn!(
            "統合出力の金額 {} sats が要求額 {} sats と異なります。",
            output.value.to_sat(), target.to_sat()
        );
    }
    // デコードできないスクリプトに自分のアドレスを付けない
    let address = match Address::from_script(&output.script_pubkey, ctx.network) {
        Ok(address) => address.to_string(),
        Err(e) => {
            log::warn!(
                "統合出力 {}:{} のスクリプト {} をアドレスにデコードできません: {}",
                merge_txid, index, output.script_pubkey.to_hex_string(), e
            );
            String::new()
        }
    };

    Ok(ConsolidationOutcome {
        merged_output: SpendableOutput {
            txid: merge_txid,
            vout: index as u32,
            script_pubkey: output.script_pubkey.clone(),
            amount: output.value,
            address,
        },
        merge_txid,
        merge_tx_bytes,
        matched,
    })
}

/// 自分宛の出力の位置。複数あれば要求額と一致するものを優先し、なければ最初のもの。
pub fn locate_merged_output(
    transaction: &Transaction,
    own_address: &Address,
    network: Network,
    target: Amount,
) -> Option<usize> {
    let own: Vec<usize> = transaction
        .output
        .iter()
        .enumerate()
        .filter(|(_, output)| {
            Address::from_script(&output.script_pubkey, network)
                .map(|address| &address == own_address)
                .unwrap_or(false)
        })
        .map(|(index, _)| index)
        .collect();

    own.iter()
        .copied()
        .find(|&index| transaction.output[index].value == target)
        .or_else(|| own.first().copied())
}
