use bitcoin::{
    absolute::LockTime,
    consensus::encode,
    ecdsa::Signature as EcdsaSignature,
    hashes::Hash,
    script::{Builder, PushBytesBuf},
    secp256k1::{Message, Secp256k1},
    sighash::{EcdsaSighashType, SighashCache},
    transaction::Version,
    Address, Amount, PublicKey, ScriptBuf, Sequence, Transaction, TxIn, TxOut, Txid, Witness,
};

use crate::{
    error::{AppError, WalletError},
    types::{BaseTxState, ScriptType, SpendableOutput},
    wallet::{SignInputRequest, WalletSigner},
};

/// 自分宛の支払い額
pub const BASE_OUTPUT_SATS: u64 = 1;

/// この入力とこの出力だけにコミットし、後から入出力を追加できる署名タイプ
pub const BASE_SIGHASH_TYPE: EcdsaSighashType = EcdsaSighashType::SinglePlusAnyoneCanPay;

// ベーストランザクションの入力は常に1つだけ
const BASE_INPUT_INDEX: usize = 0;

/// 構築済み・未署名のベーストランザクション
#[derive(Debug, Clone)]
pub struct UnsignedBaseTransaction {
    transaction: Transaction,
    spent_output: SpendableOutput,
    script_type: ScriptType,
    state: BaseTxState,
}

/// 署名済みのベーストランザクション。ファイナライザが出力を追加して完成させる。
#[derive(Debug, Clone)]
pub struct PreSignedTransaction {
    transaction: Transaction,
    spent_output: SpendableOutput,
    sighash_type: EcdsaSighashType,
    state: BaseTxState,
}

/// 入力1つ、`pay_to` への 1 sat 出力1つのトランザクションを組み立てる
pub fn build_base_transaction(
    inputs: &[SpendableOutput],
    pay_to: &Address,
) -> Result<UnsignedBaseTransaction, AppError> {
    let spent_output = match inputs {
        [single] => single.clone(),
        _ => {
            return Err(AppError::ContractViolation(format!(
                "ベーストランザクションには入力がちょうど1つ必要です (受け取った数: {})",
                inputs.len()
            )));
        }
    };
    let script_type = ScriptType::from_script(&spent_output.script_pubkey)?;

    let transaction = Transaction {
        version: Version::TWO,
        lock_time: LockTime::ZERO,
        input: vec![TxIn {
            previous_output: spent_output.out_point(),
            script_sig: ScriptBuf::new(), // 署名前は空
            sequence: Sequence::MAX,
            witness: Witness::new(),
        }],
        output: vec![TxOut {
            value: Amount::from_sat(BASE_OUTPUT_SATS),
            script_pubkey: pay_to.script_pubkey(),
        }],
    };
    log::debug!(
        "ベーストランザクション構築: 入力 {}:{} ({} sats, {:?}), 出力 {} sat -> {}",
        spent_output.txid, spent_output.vout, spent_output.amount.to_sat(), script_type, BASE_OUTPUT_SATS, pay_to
    );

    Ok(UnsignedBaseTransaction {
        transaction,
        spent_output,
        script_type,
        state: BaseTxState::Built,
    })
}

impl UnsignedBaseTransaction {
    pub fn transaction(&self) -> &Transaction {
        &self.transaction
    }

    pub fn spent_output(&self) -> &SpendableOutput {
        &self.spent_output
    }

    pub fn state(&self) -> BaseTxState {
        self.state
    }

    /// 外部署名者に入力0の署名を依頼し、アンロックスクリプトを付けて返す
    pub async fn sign<W: WalletSigner>(
        mut self,
        wallet: &W,
        signer_address: &str,
    ) -> Result<PreSignedTransaction, AppError> {
        let unsigned_bytes = encode::serialize(&self.transaction);
        let request = SignInputRequest {
            transaction: &unsigned_bytes,
            address: signer_address,
            input_index: BASE_INPUT_INDEX,
            script_pubkey: &self.spent_output.script_pubkey,
            amount: self.spent_output.amount,
            sighash_type: BASE_SIGHASH_TYPE,
        };

        let response = match wallet.sign_input(request).await {
            Ok(Some(response)) => response,
            Ok(None) => return Err(rejected("署名者が署名を返しませんでした")),
            Err(WalletError::Unsupported(capability)) => {
                return Err(AppError::SignerUnavailable(capability.to_string()));
            }
            Err(WalletError::Rejected(reason)) | Err(WalletError::Other(reason)) => {
                return Err(rejected(reason));
            }
        };

        let signature = EcdsaSignature::from_slice(&response.signature)
            .map_err(|e| rejected(format!("署名の形式が不正です: {}", e)))?;
        if signature.sighash_type != BASE_SIGHASH_TYPE {
            return Err(rejected(format!(
                "sighashタイプが異なります: {:?} (期待値 {:?})",
                signature.sighash_type, BASE_SIGHASH_TYPE
            )));
        }
        let public_key = PublicKey::from_slice(&response.public_key)
            .map_err(|e| rejected(format!("公開鍵の形式が不正です: {}", e)))?;

        self.verify_public_key(&public_key)?;
        let message = input_sighash(
            &self.transaction,
            BASE_INPUT_INDEX,
            self.script_type,
            &self.spent_output.script_pubkey,
            self.spent_output.amount,
            BASE_SIGHASH_TYPE,
        )?;
        Secp256k1::verification_only()
            .verify_ecdsa(&message, &signature.signature, &public_key.inner)
            .map_err(|e| rejected(format!("署名の検証に失敗しました: {}", e)))?;

        let input = &mut self.transaction.input[BASE_INPUT_INDEX];
        match self.script_type {
            ScriptType::P2PKH => {
                let signature_push = PushBytesBuf::try_from(signature.to_vec())
                    .map_err(|_| AppError::Internal("P2PKH署名のPushBytes変換失敗".to_string()))?;
                input.script_sig = Builder::new()
                    .push_slice(signature_push)
                    .push_key(&public_key)
                    .into_script();
            }
            ScriptType::P2WPKH => {
                let mut witness = Witness::new();
                witness.push(signature.to_vec());
                witness.push(public_key.to_bytes());
                input.witness = witness;
            }
        }

        let state = self.state.advance(BaseTxState::Signed)?;
        log::info!("ベーストランザクションに署名しました ({:?})。", self.script_type);

        Ok(PreSignedTransaction {
            transaction: self.transaction,
            spent_output: self.spent_output,
            sighash_type: BASE_SIGHASH_TYPE,
            state,
        })
    }

    fn verify_public_key(&self, public_key: &PublicKey) -> Result<(), AppError> {
        let expected = match self.script_type {
            ScriptType::P2PKH => ScriptBuf::new_p2pkh(&public_key.pubkey_hash()),
            ScriptType::P2WPKH => {
                let wpubkey_hash = public_key
                    .wpubkey_hash()
                    .map_err(|e| rejected(format!("P2WPKHには圧縮公開鍵が必要です: {}", e)))?;
                ScriptBuf::new_p2wpkh(&wpubkey_hash)
            }
        };
        if expected != self.spent_output.script_pubkey {
            return Err(rejected("公開鍵が使用するUTXOのスクリプトと一致しません"));
        }
        Ok(())
    }
}

impl PreSignedTransaction {
    pub fn transaction(&self) -> &Transaction {
        &self.transaction
    }

    pub fn spent_output(&self) -> &SpendableOutput {
        &self.spent_output
    }

    pub fn sighash_type(&self) -> EcdsaSighashType {
        self.sighash_type
    }

    pub fn state(&self) -> BaseTxState {
        self.state
    }

    pub fn txid(&self) -> Txid {
        self.transaction.compute_txid()
    }

    pub fn raw_bytes(&self) -> Vec<u8> {
        encode::serialize(&self.transaction)
    }

    pub fn to_hex(&self) -> String {
        encode::serialize_hex(&self.transaction)
    }

    pub fn total_input_amount(&self) -> Amount {
        self.spent_output.amount
    }
}

/// `build_base_transaction` と `sign` をまとめて行う
pub async fn build_and_sign<W: WalletSigner>(
    inputs: &[SpendableOutput],
    address: &Address,
    wallet: &W,
) -> Result<PreSignedTransaction, AppError> {
    let unsigned = build_base_transaction(inputs, address)?;
    unsigned.sign(wallet, &address.to_string()).await
}

/// 入力 `input_index` の署名対象メッセージ
pub fn input_sighash(
    transaction: &Transaction,
    input_index: usize,
    script_type: ScriptType,
    script_pubkey: &ScriptBuf,
    amount: Amount,
    sighash_type: EcdsaSighashType,
) -> Result<Message, AppError> {
    let mut sighash_cache = SighashCache::new(transaction);
    let digest = match script_type {
        ScriptType::P2PKH => sighash_cache
            .legacy_signature_hash(input_index, script_pubkey, sighash_type.to_u32())
            .map_err(|e| AppError::Internal(format!("Sighash計算エラー (入力インデックス {}): {}", input_index, e)))?
            .to_byte_array(),
        ScriptType::P2WPKH => sighash_cache
            .p2wpkh_signature_hash(input_index, script_pubkey, amount, sighash_type)
            .map_err(|e| AppError::Internal(format!("Sighash計算エラー (入力インデックス {}): {}", input_index, e)))?
            .to_byte_array(),
    };
    Ok(Message::from_digest(digest))
}

fn rejected(reason: impl Into<String>) -> AppError {
    AppError::SignatureRejected {
        input_index: BASE_INPUT_INDEX,
        reason: reason.into(),
    }
}
