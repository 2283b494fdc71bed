//! テスト用の固定鍵と、台本どおりに振る舞うウォレット・ファイナライザ

use std::str::FromStr;
use std::sync::Mutex;
use bitcoin::{
    absolute::LockTime,
    consensus::{deserialize, encode},
    ecdsa::Signature as EcdsaSignature,
    secp256k1::{All, Secp256k1},
    sighash::EcdsaSighashType,
    transaction::Version,
    Address, Amount, CompressedPublicKey, Network, OutPoint, PrivateKey, PublicKey, ScriptBuf, Sequence, Transaction,
    TxIn, TxOut, Txid, Witness,
};

use crate::{
    config::UploadContext,
    error::{AppError, WalletError},
    finalizer::{FinalizeData, FinalizeResponse, FinalizeSubmission, Finalizer},
    transaction::input_sighash,
    types::{RawSpendableOutput, ScriptType, SpendableOutput},
    wallet::{FundingOutput, InputSignature, SignInputRequest, WalletSigner},
};

pub const TEST_NETWORK: Network = Network::Regtest;
pub const FUNDING_TXID: &str = "7967a5185e907a25225574544c31f7b059c1a191d65b53dcc1554d339c4f9efc";
pub const FINAL_TXID: &str = "9dcbf5a86b4e70be97fc5c953ad4111dfe0a94ea6768286e5efd6c35fd9ec9d1";

fn secp() -> Secp256k1<All> {
    Secp256k1::new()
}

fn private_key(byte: u8) -> PrivateKey {
    PrivateKey::from_slice(&[byte; 32], TEST_NETWORK).expect("valid secret key")
}

pub fn owner_private_key() -> PrivateKey {
    private_key(0x11)
}

pub fn owner_public_key() -> PublicKey {
    owner_private_key().public_key(&secp())
}

pub fn owner_address() -> Address {
    Address::p2pkh(owner_public_key(), TEST_NETWORK)
}

pub fn stranger_private_key() -> PrivateKey {
    private_key(0x22)
}

pub fn stranger_address() -> Address {
    Address::p2pkh(stranger_private_key().public_key(&secp()), TEST_NETWORK)
}

pub fn test_context() -> UploadContext {
    let address = owner_address();
    UploadContext {
        network: TEST_NETWORK,
        meta_id: "test-meta-id".to_string(),
        address: address.clone(),
        change_address: address,
        fee_rate: 1,
        finalizer_url: "http://127.0.0.1:9/finalize".to_string(),
        asset_scheme: "metafile".to_string(),
        path_prefix: "/file".to_string(),
    }
}

pub fn raw_spendable_output(vout: u32, sats: u64) -> RawSpendableOutput {
    RawSpendableOutput {
        txid: FUNDING_TXID.to_string(),
        vout,
        script_pubkey_hex: owner_address().script_pubkey().to_hex_string(),
        value_sats: sats,
        address: owner_address().to_string(),
    }
}

pub fn spendable_output(vout: u32, sats: u64) -> SpendableOutput {
    SpendableOutput::try_from(raw_spendable_output(vout, sats)).expect("valid fixture")
}

pub fn owner_p2wpkh_address() -> Address {
    let compressed = CompressedPublicKey::try_from(owner_public_key()).expect("compressed key");
    Address::p2wpkh(&compressed, TEST_NETWORK)
}

/// 所有者の鍵で使えるP2WPKHのUTXO
pub fn p2wpkh_spendable_output(vout: u32, sats: u64) -> SpendableOutput {
    let address = owner_p2wpkh_address();
    SpendableOutput::try_from(RawSpendableOutput {
        txid: FUNDING_TXID.to_string(),
        vout,
        script_pubkey_hex: address.script_pubkey().to_hex_string(),
        value_sats: sats,
        address: address.to_string(),
    })
    .expect("valid fixture")
}

/// 入力を実際の鍵で署名する (署名者側の処理)
pub fn sign_input_with_key(
    transaction: &Transaction,
    input_index: usize,
    script_pubkey: &ScriptBuf,
    amount: Amount,
    sighash_type: EcdsaSighashType,
    key: &PrivateKey,
) -> Result<InputSignature, AppError> {
    let script_type = ScriptType::from_script(script_pubkey)?;
    let message = input_sighash(transaction, input_index, script_type, script_pubkey, amount, sighash_type)?;
    let secp = secp();
    let signature = EcdsaSignature {
        signature: secp.sign_ecdsa(&message, &key.inner),
        sighash_type,
    };
    Ok(InputSignature {
        signature: signature.to_vec(),
        public_key: key.public_key(&secp).to_bytes(),
    })
}

/// `fund_and_sign` の振る舞い
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FundingBehavior {
    /// 要求した出力を `pay_index` に置き、残りをおつりにする
    Merge { pay_index: usize },
    /// 要求した出力を他人宛に書き換える
    PayElsewhere,
    /// 要求した出力に加え、おつりも自分宛にする
    ChangeToSelf,
    /// 他人宛に払い、出力0にアドレスにならないスクリプトを置く
    NonStandardFirst,
    Empty,
    Malformed,
    Fail,
}

/// `sign_input` の振る舞い
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SigningBehavior {
    Sign,
    Decline,
    Unsupported,
    WrongSighashType,
    WrongKey,
    Garbage,
    /// 署名者自体が失敗する (ポップアップを閉じた等)
    Fail,
}

#[derive(Debug, Clone)]
pub struct RecordedSignRequest {
    pub transaction: Vec<u8>,
    pub address: String,
    pub input_index: usize,
    pub amount: Amount,
    pub sighash_type: EcdsaSighashType,
}

#[derive(Debug)]
pub struct ScriptedWallet {
    outputs: Vec<RawSpendableOutput>,
    funding: FundingBehavior,
    signing: SigningBehavior,
    fund_requests: Mutex<Vec<(Vec<FundingOutput>, u64)>>,
    sign_requests: Mutex<Vec<RecordedSignRequest>>,
}

impl Default for ScriptedWallet {
    fn default() -> Self {
        Self::new()
    }
}

impl ScriptedWallet {
    pub fn new() -> Self {
        ScriptedWallet {
            outputs: Vec::new(),
            funding: FundingBehavior::Merge { pay_index: 0 },
            signing: SigningBehavior::Sign,
            fund_requests: Mutex::new(Vec::new()),
            sign_requests: Mutex::new(Vec::new()),
        }
    }

    pub fn with_outputs(mut self, amounts: &[u64]) -> Self {
        self.outputs = amounts
            .iter()
            .enumerate()
            .map(|(vout, sats)| raw_spendable_output(vout as u32, *sats))
            .collect();
        self
    }

    pub fn with_raw_outputs(mut self, outputs: Vec<RawSpendableOutput>) -> Self {
        self.outputs = outputs;
        self
    }

    pub fn with_funding(mut self, funding: FundingBehavior) -> Self {
        self.funding = funding;
        self
    }

    pub fn with_signing(mut self, signing: SigningBehavior) -> Self {
        self.signing = signing;
        self
    }

    pub fn fund_requests(&self) -> Vec<(Vec<FundingOutput>, u64)> {
        self.fund_requests.lock().expect("lock").clone()
    }

    pub fn sign_requests(&self) -> Vec<RecordedSignRequest> {
        self.sign_requests.lock().expect("lock").clone()
    }

    fn merge_transaction(&self, requested: &[FundingOutput], fee_rate: u64) -> Result<Transaction, WalletError> {
        let available: u64 = self.outputs.iter().map(|o| o.value_sats).sum();
        let requested_total: u64 = requested.iter().map(|o| o.amount.to_sat()).sum();
        let fee = 200 * fee_rate.max(1);
        let change = available
            .checked_sub(requested_total + fee)
            .ok_or_else(|| WalletError::Rejected("残高不足".to_string()))?;

        let mut payments = Vec::new();
        for output in requested {
            let address = Address::from_str(&output.address)
                .map_err(|e| WalletError::Other(e.to_string()))?
                .assume_checked();
            let address = match self.funding {
                FundingBehavior::PayElsewhere | FundingBehavior::NonStandardFirst => stranger_address(),
                _ => address,
            };
            payments.push(TxOut { value: output.amount, script_pubkey: address.script_pubkey() });
        }
        let change_address = match self.funding {
            FundingBehavior::ChangeToSelf => owner_address(),
            _ => stranger_address(),
        };
        let change_output = TxOut {
            value: Amount::from_sat(change),
            script_pubkey: change_address.script_pubkey(),
        };

        let pay_index = match self.funding {
            FundingBehavior::Merge { pay_index } => pay_index,
            _ => 1,
        };
        let mut outputs = vec![change_output];
        for payment in payments.into_iter().rev() {
            outputs.insert(pay_index.min(outputs.len()), payment);
        }
        if self.funding == FundingBehavior::NonStandardFirst {
            outputs.insert(0, TxOut {
                value: Amount::ZERO,
                script_pubkey: ScriptBuf::new_op_return([0x6du8; 4]),
            });
        }

        let funding_txid = Txid::from_str(FUNDING_TXID).map_err(|e| WalletError::Other(e.to_string()))?;
        Ok(Transaction {
            version: Version::TWO,
            lock_time: LockTime::ZERO,
            input: self
                .outputs
                .iter()
                .map(|o| TxIn {
                    previous_output: OutPoint::new(funding_txid, o.vout),
                    script_sig: ScriptBuf::new(),
                    sequence: Sequence::MAX,
                    witness: Witness::new(),
                })
                .collect(),
            output: outputs,
        })
    }
}

impl WalletSigner for ScriptedWallet {
    async fn list_spendable_outputs(&self) -> Result<Vec<RawSpendableOutput>, WalletError> {
        Ok(self.outputs.clone())
    }

    async fn fund_and_sign(
        &self,
        outputs: &[FundingOutput],
        fee_rate: u64,
    ) -> Result<Vec<Vec<u8>>, WalletError> {
        self.fund_requests.lock().expect("lock").push((outputs.to_vec(), fee_rate));
        match self.funding {
            FundingBehavior::Empty => Ok(vec![]),
            FundingBehavior::Malformed => Ok(vec![vec![0xde, 0xad, 0xbe, 0xef]]),
            FundingBehavior::Fail => Err(WalletError::Other("ウォレットに接続できません".to_string())),
            _ => Ok(vec![encode::serialize(&self.merge_transaction(outputs, fee_rate)?)]),
        }
    }

    async fn sign_input(
        &self,
        request: SignInputRequest<'_>,
    ) -> Result<Option<InputSignature>, WalletError> {
        self.sign_requests.lock().expect("lock").push(RecordedSignRequest {
            transaction: request.transaction.to_vec(),
            address: request.address.to_string(),
            input_index: request.input_index,
            amount: request.amount,
            sighash_type: request.sighash_type,
        });

        let (sighash_type, key) = match self.signing {
            SigningBehavior::Decline => return Ok(None),
            SigningBehavior::Unsupported => return Err(WalletError::Unsupported("signInput")),
            SigningBehavior::Fail => return Err(WalletError::Other("user closed popup".to_string())),
            SigningBehavior::Garbage => {
                return Ok(Some(InputSignature {
                    signature: vec![1, 2, 3],
                    public_key: owner_public_key().to_bytes(),
                }));
            }
            SigningBehavior::Sign => (request.sighash_type, owner_private_key()),
            SigningBehavior::WrongSighashType => (EcdsaSighashType::All, owner_private_key()),
            SigningBehavior::WrongKey => (request.sighash_type, stranger_private_key()),
        };

        let transaction: Transaction = deserialize(request.transaction)
            .map_err(|e| WalletError::Other(e.to_string()))?;
        let signature = sign_input_with_key(
            &transaction,
            request.input_index,
            &request.script_pubkey.to_owned(),
            request.amount,
            sighash_type,
            &key,
        )
        .map_err(|e| WalletError::Other(e.to_string()))?;
        Ok(Some(signature))
    }
}

/// 台本どおりの応答を返すファイナライザ
#[derive(Debug)]
pub struct ScriptedFinalizer {
    response: Result<FinalizeResponse, String>,
    submissions: Mutex<Vec<FinalizeSubmission>>,
}

impl ScriptedFinalizer {
    pub fn success() -> Self {
        Self::responding(FinalizeResponse {
            code: 0,
            message: None,
            data: Some(FinalizeData {
                tx_id: FINAL_TXID.to_string(),
                pin_id: Some(format!("{}i0", FINAL_TXID)),
                status: Some("broadcast".to_string()),
            }),
        })
    }

    pub fn responding(response: FinalizeResponse) -> Self {
        ScriptedFinalizer {
            response: Ok(response),
            submissions: Mutex::new(Vec::new()),
        }
    }

    pub fn failing_transport(message: &str) -> Self {
        ScriptedFinalizer {
            response: Err(message.to_string()),
            submissions: Mutex::new(Vec::new()),
        }
    }

    pub fn submissions(&self) -> Vec<FinalizeSubmission> {
        self.submissions.lock().expect("lock").clone()
    }
}

impl Finalizer for ScriptedFinalizer {
    async fn finalize(&self, submission: &FinalizeSubmission) -> Result<FinalizeResponse, AppError> {
        self.submissions.lock().expect("lock").push(submission.clone());
        self.response
            .clone()
            .map_err(|message| AppError::UploadFailed { message })
    }
}
