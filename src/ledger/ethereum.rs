use async_trait::async_trait;
use ethers::prelude::*;
use ethers::utils::{format_ether, parse_ether};
use rust_decimal::Decimal;
use std::str::FromStr;
use std::time::Duration;
use tokio::time::sleep;
use tracing::{debug, info, warn};

use crate::config::LedgerConfig;
use crate::ledger::{LedgerClient, LedgerError, LedgerOutcome};

type SignerClient = SignerMiddleware<Provider<Http>, LocalWallet>;

const CONNECT_RETRY_INTERVAL: Duration = Duration::from_secs(1);

/// Fractional digits of one ether expressed in wei.
pub const WEI_DECIMALS: u32 = 18;

/// Ledger client for an Ethereum JSON-RPC node, signing with a local custodial key.
pub struct EthereumLedger {
    client: SignerClient,
    destination: Address,
}

impl EthereumLedger {
    /// Connects to the node, waiting for it to answer, and binds the signer to its
    /// chain id.
    pub async fn new(
        rpc_url: &str,
        signer_key: &str,
        config: &LedgerConfig,
    ) -> Result<Self, LedgerError> {
        let provider = Provider::<Http>::try_from(rpc_url)
            .map_err(|e| LedgerError::Rpc(format!("Invalid RPC url {}: {}", rpc_url, e)))?;

        let destination = config
            .destination_address
            .parse::<Address>()
            .map_err(|e| {
                LedgerError::InvalidAddress(format!("{}: {}", config.destination_address, e))
            })?;

        let chain_id = wait_for_chain_id(&provider, config.connect_attempts).await?;

        let wallet = signer_key
            .parse::<LocalWallet>()
            .map_err(|e| LedgerError::Signer(e.to_string()))?
            .with_chain_id(chain_id);

        info!(
            "Connected to ledger (chain id {}), custodial account {:#x}, destination {:#x}",
            chain_id,
            wallet.address(),
            destination
        );

        Ok(Self {
            client: SignerMiddleware::new(provider, wallet),
            destination,
        })
    }
}

async fn wait_for_chain_id(provider: &Provider<Http>, attempts: u32) -> Result<u64, LedgerError> {
    let mut attempt = 0;
    loop {
        attempt += 1;
        match provider.get_chainid().await {
            Ok(chain_id) => return Ok(chain_id.as_u64()),
            Err(e) if attempt < attempts => {
                warn!(
                    "Ledger node not reachable (attempt {}/{}): {}",
                    attempt, attempts, e
                );
                sleep(CONNECT_RETRY_INTERVAL).await;
            }
            Err(e) => {
                return Err(LedgerError::Rpc(format!(
                    "Ledger node not reachable after {} attempts: {}",
                    attempts, e
                )))
            }
        }
    }
}

/// Converts an ether amount to wei. More than 18 fractional digits cannot be paid.
pub fn to_wei(amount: Decimal) -> Result<U256, LedgerError> {
    let amount = amount.normalize();
    if amount.is_sign_negative() {
        return Err(LedgerError::InvalidAmount(format!("{} is negative", amount)));
    }
    if amount.scale() > WEI_DECIMALS {
        return Err(LedgerError::InvalidAmount(format!(
            "{} has more than {} fractional digits",
            amount, WEI_DECIMALS
        )));
    }
    parse_ether(amount.to_string())
        .map_err(|e| LedgerError::InvalidAmount(format!("{}: {}", amount, e)))
}

#[async_trait]
impl LedgerClient for EthereumLedger {
    async fn submit_transfer(&self, amount: Decimal) -> Result<String, LedgerError> {
        let value = to_wei(amount)?;

        // gas price, gas limit and nonce are filled in by the signer middleware
        let request = TransactionRequest::new()
            .from(self.client.address())
            .to(self.destination)
            .value(value);

        let pending = self
            .client
            .send_transaction(request, None)
            .await
            .map_err(|e| LedgerError::Rpc(e.to_string()))?;
        let tx_hash = pending.tx_hash();

        info!(
            "Broadcast transfer of {} ETH to {:#x}: {:#x}",
            amount, self.destination, tx_hash
        );

        Ok(format!("{:#x}", tx_hash))
    }

    async fn transaction_outcome(&self, tx_ref: &str) -> Result<LedgerOutcome, LedgerError> {
        let tx_hash = tx_ref
            .parse::<H256>()
            .map_err(|e| LedgerError::InvalidReference(format!("{}: {}", tx_ref, e)))?;

        let receipt = self
            .client
            .get_transaction_receipt(tx_hash)
            .await
            .map_err(|e| LedgerError::Rpc(e.to_string()))?;

        let outcome = match receipt {
            None => LedgerOutcome::NotYetObserved,
            Some(receipt) => {
                LedgerOutcome::from_receipt_status(receipt.status.map(|status| status.as_u64()))
            }
        };
        debug!("Receipt for {}: {:?}", tx_ref, outcome);

        Ok(outcome)
    }

    async fn balance_of(&self, address: &str) -> Result<Decimal, LedgerError> {
        let account = address
            .parse::<Address>()
            .map_err(|e| LedgerError::InvalidAddress(format!("{}: {}", address, e)))?;

        let wei = self
            .client
            .get_balance(account, None)
            .await
            .map_err(|e| LedgerError::Rpc(e.to_string()))?;

        Decimal::from_str(&format_ether(wei))
            .map_err(|e| LedgerError::Rpc(format!("Balance of {} out of range: {}", address, e)))
    }

    fn custodial_address(&self) -> String {
        format!("{:#x}", self.client.address())
    }
}
