//! ファイルサイズと手数料率から手数料を見積もる。
//!
//! サイズは概算: 固定オーバーヘッド + 署名済み入力1つ + 出力2つ (おつり・ペイロード)
//! + ペイロードのコミットメント (メタデータ欄 + ファイル本体)。

use bitcoin::Amount;

pub const BASE_TX_BYTES: u64 = 200;
pub const SIGNED_INPUT_BYTES: u64 = 150;
pub const OUTPUT_BYTES: u64 = 34;
pub const COMMITMENT_SCRIPT_BYTES: u64 = 50;
pub const METADATA_FIELD_BYTES: u64 = 100;

// 安全マージン 20% = 6/5
const MARGIN_NUMERATOR: u64 = 6;
const MARGIN_DENOMINATOR: u64 = 5;

#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub struct FeeEstimate {
    pub estimated_bytes: u64,
    pub fee_rate_per_byte: u64,
    pub base_fee: u64,
    pub margined_fee: u64,
}

impl FeeEstimate {
    pub fn margined_amount(&self) -> Amount {
        Amount::from_sat(self.margined_fee)
    }
}

pub fn estimate_size(file_len: u64) -> u64 {
    (BASE_TX_BYTES
        + SIGNED_INPUT_BYTES
        + 2 * OUTPUT_BYTES
        + COMMITMENT_SCRIPT_BYTES
        + METADATA_FIELD_BYTES
    ).saturating_add(file_len)
}

/// `ceil(fee * 1.2)` を整数演算で
pub fn apply_margin(fee: u64) -> u64 {
    let margined = (fee as u128 * MARGIN_NUMERATOR as u128).div_ceil(MARGIN_DENOMINATOR as u128);
    u64::try_from(margined).unwrap_or(u64::MAX)
}

pub fn estimate_fee(file_len: u64, fee_rate_per_byte: u64) -> FeeEstimate {
    let estimated_bytes = estimate_size(file_len);
    let base_fee = estimated_bytes.saturating_mul(fee_rate_per_byte);
    let margined_fee = apply_margin(base_fee);

    log::debug!(
        "推定サイズ: {} bytes, 手数料率: {} sats/byte, 基本手数料: {} sats, マージン込み: {} sats",
        estimated_bytes, fee_rate_per_byte, base_fee, margined_fee
    );

    FeeEstimate {
        estimated_bytes,
        fee_rate_per_byte,
        base_fee,
        margined_fee,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn thousand_byte_file_at_one_sat_per_byte() {
        let estimate = estimate_fee(1000, 1);
        assert_eq!(estimate.estimated_bytes, 200 + 150 + 68 + 50 + 100 + 1000);
        assert_eq!(estimate.base_fee, 1568);
        // 1568 * 1.2 = 1881.6
        assert_eq!(estimate.margined_fee, 1882);
    }

    #[test]
    fn margin_rounds_up_only_when_fractional() {
        assert_eq!(apply_margin(0), 0);
        assert_eq!(apply_margin(1), 2);
        assert_eq!(apply_margin(5), 6);
        assert_eq!(apply_margin(10), 12);
        assert_eq!(apply_margin(11), 14);
    }

    #[test]
    fn zero_rate_costs_nothing() {
        for len in [0, 1, 10_000] {
            assert_eq!(estimate_fee(len, 0).margined_fee, 0);
        }
    }

    #[test]
    fn fee_grows_with_file_size() {
        for rate in [1, 2, 7] {
            let mut previous = estimate_fee(0, rate).margined_fee;
            for len in 1..2_000 {
                let fee = estimate_fee(len, rate).margined_fee;
                assert!(fee > previous, "rate {rate}, len {len}: {fee} <= {previous}");
                previous = fee;
            }
        }
    }

    #[test]
    fn huge_inputs_saturate_instead_of_overflowing() {
        let estimate = estimate_fee(u64::MAX - 1_000, u64::MAX);
        assert_eq!(estimate.base_fee, u64::MAX);
        assert_eq!(estimate.margined_fee, u64::MAX);
    }
}
