use alloy::{
    consensus::{TxLegacy, TypedTransaction},
    eips::Encodable2718,
    network::{Ethereum, EthereumWallet, NetworkWallet},
    primitives::{Address, Bytes, TxKind, U256},
    providers::{DynProvider, Provider, ProviderBuilder},
    signers::local::PrivateKeySigner,
    transports::{RpcError, TransportResult},
};
use async_trait::async_trait;
use std::future::IntoFuture;
use std::path::PathBuf;
use std::str::FromStr;
use std::time::Duration;
use tokio::time::timeout;
use tracing::{info, instrument, warn};

use super::SettlementClient;
use crate::error::{AppError, AppResult, SettlementError};

/// 5000 gwei
pub const DEFAULT_MAX_GAS_PRICE_WEI: u128 = 5_000_000_000_000;
/// Plain value transfer
pub const DEFAULT_GAS_LIMIT: u64 = 21_000;

#[derive(Debug, Clone)]
pub struct EvmSettlementConfig {
    pub rpc_url: String,
    pub keystore_path: PathBuf,
    pub keystore_passphrase_path: PathBuf,
    pub max_gas_price_wei: u128,
    pub gas_limit: u64,
    pub rpc_timeout: Duration,
}

/// Pays workers with legacy EIP-155 transfers signed by a local keystore key
pub struct EvmSettlementClient {
    provider: DynProvider,
    wallet: EthereumWallet,
    sender: Address,
    max_gas_price_wei: u128,
    gas_limit: u64,
    rpc_timeout: Duration,
}

impl EvmSettlementClient {
    pub fn new(provider: DynProvider, signer: PrivateKeySigner, config: &EvmSettlementConfig) -> Self {
        let sender = signer.address();
        Self {
            provider,
            wallet: EthereumWallet::from(signer),
            sender,
            max_gas_price_wei: config.max_gas_price_wei,
            gas_limit: config.gas_limit,
            rpc_timeout: config.rpc_timeout,
        }
    }

    /// Decrypt the pool keystore and connect to the RPC endpoint.
    pub fn from_keystore(config: &EvmSettlementConfig) -> AppResult<Self> {
        let passphrase = std::fs::read_to_string(&config.keystore_passphrase_path)?;
        let signer = PrivateKeySigner::decrypt_keystore(
            &config.keystore_path,
            passphrase.trim_end_matches(['\r', '\n']),
        )
        .map_err(|e| {
            AppError::Config(format!(
                "cannot decrypt keystore {}: {}",
                config.keystore_path.display(),
                e
            ))
        })?;

        let rpc_url = reqwest::Url::parse(&config.rpc_url)
            .map_err(|e| AppError::Config(format!("invalid rpc_url {}: {}", config.rpc_url, e)))?;
        let provider = ProviderBuilder::new().connect_http(rpc_url).erased();

        let client = Self::new(provider, signer, config);
        info!("Settlement account {}", client.sender());
        Ok(client)
    }

    pub fn sender(&self) -> Address {
        self.sender
    }

    async fn step<F, T>(&self, stage: &'static str, call: F) -> Result<T, SettlementError>
    where
        F: IntoFuture<Output = TransportResult<T>>,
    {
        match timeout(self.rpc_timeout, call.into_future()).await {
            Ok(Ok(value)) => Ok(value),
            Ok(Err(e)) => Err(SettlementError::Rpc {
                stage,
                message: e.to_string(),
            }),
            Err(_) => Err(SettlementError::Timeout { stage }),
        }
    }

    fn check_fee_rate(&self, gas_price: u128) -> Result<(), SettlementError> {
        if gas_price > self.max_gas_price_wei {
            return Err(SettlementError::FeeRateTooHigh {
                current: gas_price,
                cap: self.max_gas_price_wei,
            });
        }
        Ok(())
    }
}

fn parse_recipient(recipient: &str) -> Result<Address, SettlementError> {
    Address::from_str(recipient.trim())
        .map_err(|_| SettlementError::InvalidRecipient(recipient.to_string()))
}

#[async_trait]
impl SettlementClient for EvmSettlementClient {
    #[instrument(skip(self), fields(sender = %self.sender))]
    async fn send(&self, amount: i64, recipient: &str) -> Result<String, SettlementError> {
        if amount <= 0 {
            return Err(SettlementError::InvalidAmount(amount));
        }
        let to = parse_recipient(recipient)?;

        let gas_price = self.step("gas price", self.provider.get_gas_price()).await?;
        self.check_fee_rate(gas_price)?;

        let nonce = self
            .step("nonce", self.provider.get_transaction_count(self.sender).pending())
            .await?;
        let chain_id = self.step("chain id", self.provider.get_chain_id()).await?;

        let tx = TxLegacy {
            chain_id: Some(chain_id),
            nonce,
            gas_price,
            gas_limit: self.gas_limit,
            to: TxKind::Call(to),
            value: U256::from(amount as u64),
            input: Bytes::new(),
        };

        let signed = NetworkWallet::<Ethereum>::sign_transaction_from(
            &self.wallet,
            self.sender,
            TypedTransaction::Legacy(tx),
        )
        .await
        .map_err(|e| SettlementError::Signing(e.to_string()))?;
        let tx_hash = signed.tx_hash().to_string();

        // Past this point the node may have the transaction even if we never hear back.
        match timeout(
            self.rpc_timeout,
            self.provider.send_raw_transaction(&signed.encoded_2718()),
        )
        .await
        {
            Ok(Ok(_)) => {}
            Ok(Err(RpcError::ErrorResp(payload))) => {
                return Err(SettlementError::Rpc {
                    stage: "submit",
                    message: payload.to_string(),
                })
            }
            Ok(Err(e)) => {
                warn!("Submission of {} failed in transport: {}", tx_hash, e);
                return Err(SettlementError::SubmissionUnknown { tx_hash });
            }
            Err(_) => return Err(SettlementError::SubmissionUnknown { tx_hash }),
        }

        info!(
            "Submitted {} wei to {} in {} (nonce {}, gas price {})",
            amount, to, tx_hash, nonce, gas_price
        );
        Ok(tx_hash)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    // Well-known development key, never funded outside local chains.
    const DEV_KEY: &str = "ac0974bec39a17e36ba4a6b4d238ff944bacb478cbed5efcae784d7bf4f2ff80";

    fn client() -> EvmSettlementClient {
        let config = EvmSettlementConfig {
            rpc_url: "http://127.0.0.1:1".to_string(),
            keystore_path: PathBuf::new(),
            keystore_passphrase_path: PathBuf::new(),
            max_gas_price_wei: 100,
            gas_limit: DEFAULT_GAS_LIMIT,
            rpc_timeout: Duration::from_millis(200),
        };
        let provider = ProviderBuilder::new()
            .connect_http(reqwest::Url::parse(&config.rpc_url).unwrap())
            .erased();
        EvmSettlementClient::new(provider, DEV_KEY.parse().unwrap(), &config)
    }

    #[tokio::test]
    async fn test_rejects_bad_input_before_rpc() {
        let client = client();

        assert!(matches!(
            client.send(0, "0x70997970C51812dc3A010C7d01b50e0d17dc79C8").await,
            Err(SettlementError::InvalidAmount(0))
        ));
        assert!(matches!(
            client.send(10, "not-an-address").await,
            Err(SettlementError::InvalidRecipient(_))
        ));
    }

    #[test]
    fn test_fee_rate_cap() {
        let client = client();
        assert!(client.check_fee_rate(100).is_ok());
        assert!(matches!(
            client.check_fee_rate(101),
            Err(SettlementError::FeeRateTooHigh { current: 101, cap: 100 })
        ));
    }

    #[tokio::test]
    async fn test_unreachable_rpc_fails_before_signing() {
        let client = client();
        let err = client
            .send(10, "0x70997970C51812dc3A010C7d01b50e0d17dc79C8")
            .await
            .unwrap_err();

        assert!(!err.outcome_unknown());
        assert!(matches!(
            err,
            SettlementError::Rpc { stage: "gas price", .. } | SettlementError::Timeout { stage: "gas price" }
        ));
    }

    #[test]
    fn test_sender_derived_from_key() {
        assert_eq!(
            client().sender(),
            Address::from_str("0xf39Fd6e51aad88F6F4ce6aB8827279cffFb92266").unwrap()
        );
    }
}
