use std::future::Future;
use bitcoin::{Amount, script::Script, sighash::EcdsaSighashType};
use crate::{error::WalletError, types::RawSpendableOutput};

/// 統合トランザクションで要求する出力
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FundingOutput {
    pub address: String,
    pub amount: Amount,
}

/// 単一入力への署名要求
#[derive(Debug, Clone, Copy)]
pub struct SignInputRequest<'a> {
    pub transaction: &'a [u8],
    pub address: &'a str,
    pub input_index: usize,
    pub script_pubkey: &'a Script,
    pub amount: Amount,
    pub sighash_type: EcdsaSighashType,
}

/// 署名者が返す署名 (DER + sighashバイト) と公開鍵
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct InputSignature {
    pub signature: Vec<u8>,
    pub public_key: Vec<u8>,
}

/// 外部ウォレット。鍵の保管、UTXOの列挙、署名の生成はすべてウォレット側で行う。
pub trait WalletSigner: Send + Sync {
    fn list_spendable_outputs(
        &self,
    ) -> impl Future<Output = Result<Vec<RawSpendableOutput>, WalletError>> + Send;

    /// 指定した出力を支払うトランザクションの入力選択・おつり計算・署名をウォレットに任せる。
    /// 署名済みトランザクションのバイト列を返す。
    fn fund_and_sign(
        &self,
        outputs: &[FundingOutput],
        fee_rate: u64,
    ) -> impl Future<Output = Result<Vec<Vec<u8>>, WalletError>> + Send;

    /// 署名を拒否した場合は `Ok(None)`。署名機能自体がない場合は `WalletError::Unsupported`。
    fn sign_input(
        &self,
        request: SignInputRequest<'_>,
    ) -> impl Future<Output = Result<Option<InputSignature>, WalletError>> + Send;
}
