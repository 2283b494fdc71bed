use bitcoin::Amount;
use crate::{
    error::AppError,
    types::SpendableOutput,
    wallet::WalletSigner,
};

/// これ以下のUTXOは目標額と後のおつり出力を両方まかなえないため使わない
pub const DUST_FLOOR_SATS: u64 = 600;

// 最終的な受取出力のために 1 sat を残す
const RECIPIENT_RESERVE_SATS: u64 = 1;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SelectionResult {
    /// 金額の降順
    pub selected: Vec<SpendableOutput>,
    pub total_amount: Amount,
}

impl SelectionResult {
    pub fn needs_consolidation(&self) -> bool {
        self.selected.len() > 1
    }
}

/// ウォレットから全UTXOを取得して選択する
pub async fn select_from_wallet<W: WalletSigner>(
    wallet: &W,
    required: Amount,
) -> Result<SelectionResult, AppError> {
    let raw_outputs = wallet.list_spendable_outputs().await?;
    log::info!("ウォレットから {} 個のUTXOを取得しました。", raw_outputs.len());

    let listed = raw_outputs.len();
    let outputs: Vec<SpendableOutput> = raw_outputs
        .into_iter()
        .filter_map(|raw| {
            let outpoint = format!("{}:{}", raw.txid, raw.vout);
            match SpendableOutput::try_from(raw) {
                Ok(output) => Some(output),
                Err(e) => {
                    log::warn!("解釈できないUTXOを除外: {} ({})", outpoint, e);
                    None
                }
            }
        })
        .collect();

    // 一覧はあったが1つも解釈できなかった
    if listed > 0 && outputs.is_empty() {
        return Err(AppError::NoUsableFunds { total: listed, dust_floor: DUST_FLOOR_SATS });
    }

    select_outputs(outputs, required)
}

/// 大きい順に貪欲に積み上げ、`required + 1` に届いた時点で止める
pub fn select_outputs(
    outputs: Vec<SpendableOutput>,
    required: Amount,
) -> Result<SelectionResult, AppError> {
    if outputs.is_empty() {
        return Err(AppError::NoFunds);
    }

    let total = outputs.len();
    let mut usable: Vec<SpendableOutput> = outputs
        .into_iter()
        .filter(|output| {
            let keep = output.amount.to_sat() > DUST_FLOOR_SATS;
            if !keep {
                log::debug!("ダストUTXOを除外: {}:{} ({} sats)", output.txid, output.vout, output.amount.to_sat());
            }
            keep
        })
        .collect();

    if usable.is_empty() {
        return Err(AppError::NoUsableFunds { total, dust_floor: DUST_FLOOR_SATS });
    }

    // 安定ソートなので同額は元の順序を保つ
    usable.sort_by(|a, b| b.amount.cmp(&a.amount));

    let target = required.to_sat().saturating_add(RECIPIENT_RESERVE_SATS);
    let mut selected = Vec::new();
    let mut accumulated: u64 = 0;

    for output in usable.iter() {
        accumulated = accumulated.saturating_add(output.amount.to_sat());
        selected.push(output.clone());
        if accumulated >= target {
            log::info!(
                "{} 個のUTXOを選択しました。合計 {} sats (必要額 {} sats)",
                selected.len(), accumulated, target
            );
            return Ok(SelectionResult {
                selected,
                total_amount: Amount::from_sat(accumulated),
            });
        }
    }

    Err(AppError::InsufficientBalance {
        available: accumulated,
        required: target,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_utils::{ScriptedWallet, raw_spendable_output, spendable_output};

    fn amounts(result: &SelectionResult) -> Vec<u64> {
        result.selected.iter().map(|o| o.amount.to_sat()).collect()
    }

    fn outputs(values: &[u64]) -> Vec<SpendableOutput> {
        values.iter().enumerate().map(|(i, v)| spendable_output(i as u32, *v)).collect()
    }

    #[test]
    fn largest_output_alone_covers_requirement() {
        let result = select_outputs(outputs(&[3000, 5000]), Amount::from_sat(1500)).unwrap();
        assert_eq!(amounts(&result), vec![5000]);
        assert_eq!(result.total_amount.to_sat(), 5000);
        assert!(!result.needs_consolidation());
    }

    #[test]
    fn accumulates_several_outputs_when_needed() {
        let result = select_outputs(outputs(&[650, 800, 700]), Amount::from_sat(2000)).unwrap();
        assert_eq!(amounts(&result), vec![800, 700, 650]);
        assert_eq!(result.total_amount.to_sat(), 2150);
        assert!(result.needs_consolidation());
    }

    #[test]
    fn exact_requirement_without_reserve_is_not_enough() {
        let err = select_outputs(outputs(&[1000]), Amount::from_sat(1000)).unwrap_err();
        assert!(matches!(err, AppError::InsufficientBalance { available: 1000, required: 1001 }));

        let ok = select_outputs(outputs(&[1001]), Amount::from_sat(1000)).unwrap();
        assert_eq!(ok.total_amount.to_sat(), 1001);
    }

    #[test]
    fn empty_wallet_is_no_funds() {
        assert!(matches!(select_outputs(vec![], Amount::from_sat(1)), Err(AppError::NoFunds)));
    }

    #[test]
    fn dust_only_wallet_is_no_usable_funds() {
        let err = select_outputs(outputs(&[600, 500, 1]), Amount::from_sat(1)).unwrap_err();
        assert!(matches!(err, AppError::NoUsableFunds { total: 3, dust_floor: 600 }));
    }

    #[test]
    fn dust_is_excluded_even_when_it_would_cover_the_gap() {
        // 生の合計 1000 + 600 + 600 = 2200 は足りるが、ダストを除くと 1000 しかない
        let err = select_outputs(outputs(&[1000, 600, 600]), Amount::from_sat(1500)).unwrap_err();
        assert!(matches!(err, AppError::InsufficientBalance { available: 1000, required: 1501 }));
    }

    #[test]
    fn equal_amounts_keep_wallet_order() {
        let result = select_outputs(outputs(&[700, 900, 700]), Amount::from_sat(2000)).unwrap();
        let vouts: Vec<u32> = result.selected.iter().map(|o| o.vout).collect();
        assert_eq!(vouts, vec![1, 0, 2]);
    }

    #[test]
    fn selection_never_falls_below_bound() {
        let pool = [601u64, 750, 1200, 4000, 999, 10_000, 640];
        let sum: u64 = pool.iter().sum();
        for required in (0..sum + 10).step_by(37) {
            match select_outputs(outputs(&pool), Amount::from_sat(required)) {
                Ok(result) => assert!(result.total_amount.to_sat() >= required + 1),
                Err(AppError::InsufficientBalance { available, .. }) => {
                    assert_eq!(available, sum);
                    assert!(sum < required + 1);
                }
                Err(other) => panic!("unexpected error: {other:?}"),
            }
        }
    }

    #[tokio::test]
    async fn wallet_outputs_are_fetched_and_validated() {
        let wallet = ScriptedWallet::new().with_outputs(&[5000, 3000]);
        let result = select_from_wallet(&wallet, Amount::from_sat(1500)).await.unwrap();
        assert_eq!(amounts(&result), vec![5000]);
    }

    #[tokio::test]
    async fn malformed_wallet_outputs_are_skipped() {
        let mut bad_txid = raw_spendable_output(0, 9000);
        bad_txid.txid = "zz".to_string();
        let mut bad_script = raw_spendable_output(1, 8000);
        bad_script.script_pubkey_hex = "not hex".to_string();
        let wallet = ScriptedWallet::new()
            .with_raw_outputs(vec![bad_txid, bad_script, raw_spendable_output(2, 5000)]);

        let result = select_from_wallet(&wallet, Amount::from_sat(1500)).await.unwrap();
        assert_eq!(amounts(&result), vec![5000]);
        assert_eq!(result.selected[0].vout, 2);
    }

    #[tokio::test]
    async fn wallet_with_only_malformed_outputs_has_no_usable_funds() {
        let mut bad = raw_spendable_output(0, 9000);
        bad.txid = "zz".to_string();
        let wallet = ScriptedWallet::new().with_raw_outputs(vec![bad]);

        let err = select_from_wallet(&wallet, Amount::from_sat(1500)).await.unwrap_err();
        assert!(matches!(err, AppError::NoUsableFunds { total: 1, .. }), "{err:?}");
    }
}
