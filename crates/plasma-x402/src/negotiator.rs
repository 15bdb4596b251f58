//! Server-side payment negotiation: mints [`PaymentRequired`] offers with
//! one option per enabled (network, scheme) pair and a fee breakdown each.

use alloy::primitives::{Address, U256};
use uuid::Uuid;

use crate::constants::{NetworkConfig, SCHEME_EIP3009_TRANSFER, SCHEME_GASLESS_ROUTER};
use crate::fees::{FeeMode, FeePolicy};
use crate::payment::{PaymentOption, PaymentRequired, PAYMENT_REQUIRED_TYPE, WIRE_VERSION};
use crate::signer::random_nonce;
use crate::X402Error;

/// Default authorization deadline.
pub const DEFAULT_DEADLINE_SECS: u64 = 600;

/// Mints payment offers. Negotiation is never idempotent: every call
/// produces a fresh invoice id, and offers are never reused.
pub struct PaymentNegotiator {
    plasma: NetworkConfig,
    ethereum: NetworkConfig,
    merchant: Address,
    fees: FeePolicy,
    /// Suppress the Ethereum router option, offering the Plasma path only.
    prefer_plasma_only: bool,
}

impl PaymentNegotiator {
    pub fn new(merchant: Address, fees: FeePolicy) -> Self {
        Self {
            plasma: NetworkConfig::plasma(),
            ethereum: NetworkConfig::ethereum(),
            merchant,
            fees,
            prefer_plasma_only: false,
        }
    }

    pub fn with_networks(mut self, plasma: NetworkConfig, ethereum: NetworkConfig) -> Self {
        self.plasma = plasma;
        self.ethereum = ethereum;
        self
    }

    pub fn with_prefer_plasma_only(mut self, prefer: bool) -> Self {
        self.prefer_plasma_only = prefer;
        self
    }

    /// Build a fresh offer for `amount` atomic units.
    ///
    /// Emits the Plasma EIP-3009 option always, and the Ethereum router
    /// option unless the plasma-only flag is set. The EIP-3009 nonce is a
    /// server-suggested random value the client may override; the router
    /// nonce is the `"0"` placeholder — the authoritative counter lives
    /// on-chain and is resolved by the client.
    pub fn build_payment_required(
        &self,
        amount: U256,
        description: &str,
        deadline_secs: u64,
    ) -> Result<PaymentRequired, X402Error> {
        let now = crate::unix_now();
        let deadline = now + deadline_secs;
        let amount_str = amount.to_string();

        let mut payment_options = vec![PaymentOption {
            network: self.plasma.network.clone(),
            chain_id: self.plasma.chain_id,
            token: self.plasma.token,
            token_symbol: self.plasma.token_symbol.clone(),
            token_decimals: self.plasma.token_decimals,
            amount: amount_str.clone(),
            recipient: self.merchant,
            scheme: SCHEME_EIP3009_TRANSFER.to_string(),
            nonce: Some(random_nonce().to_string()),
            deadline: Some(deadline),
            router_contract: None,
            recommended_mode: Some(FeeMode::Direct),
            fee_breakdown: Some(self.fees.breakdown(amount, FeeMode::Direct)?),
        }];

        if !self.prefer_plasma_only {
            let router = self.ethereum.router.ok_or_else(|| {
                X402Error::Config("ethereum network config has no router contract".to_string())
            })?;
            payment_options.push(PaymentOption {
                network: self.ethereum.network.clone(),
                chain_id: self.ethereum.chain_id,
                token: self.ethereum.token,
                token_symbol: self.ethereum.token_symbol.clone(),
                token_decimals: self.ethereum.token_decimals,
                amount: amount_str,
                recipient: self.merchant,
                scheme: SCHEME_GASLESS_ROUTER.to_string(),
                nonce: Some("0".to_string()),
                deadline: Some(deadline),
                router_contract: Some(router),
                recommended_mode: Some(FeeMode::Direct),
                fee_breakdown: Some(self.fees.breakdown(amount, FeeMode::Direct)?),
            });
        }

        let invoice_id = Uuid::new_v4().to_string();
        tracing::debug!(invoice = %invoice_id, amount = %amount, "payment offer minted");

        Ok(PaymentRequired {
            kind: PAYMENT_REQUIRED_TYPE.to_string(),
            version: WIRE_VERSION,
            invoice_id,
            timestamp: now,
            payment_options,
            description: description.to_string(),
            metadata: None,
        })
    }
}
