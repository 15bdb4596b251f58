//! Wire-format messages exchanged between the resource server, the client,
//! and the facilitator. All JSON, camelCase, version-tagged.

use alloy::primitives::{Address, FixedBytes};
use serde::{Deserialize, Serialize};

use crate::fees::{FeeBreakdown, FeeMode};

/// Protocol wire version.
pub const WIRE_VERSION: u32 = 1;

/// Message type tags.
pub const PAYMENT_REQUIRED_TYPE: &str = "payment-required";
pub const PAYMENT_SUBMITTED_TYPE: &str = "payment-submitted";
pub const PAYMENT_COMPLETED_TYPE: &str = "payment-completed";

/// One way to pay: a (network, scheme) pair with amount, recipient, and
/// scheme-specific hints.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PaymentOption {
    pub network: String,
    pub chain_id: u64,
    pub token: Address,
    pub token_symbol: String,
    pub token_decimals: u32,
    /// Atomic units, decimal string.
    pub amount: String,
    pub recipient: Address,
    pub scheme: String,
    /// Server-suggested nonce. A random bytes32 hex for EIP-3009 options;
    /// the literal `"0"` placeholder for router options (the client resolves
    /// the authoritative on-chain counter).
    #[serde(skip_serializing_if = "Option::is_none")]
    pub nonce: Option<String>,
    /// Unix seconds after which the authorization must not validate.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub deadline: Option<u64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub router_contract: Option<Address>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub recommended_mode: Option<FeeMode>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub fee_breakdown: Option<FeeBreakdown>,
}

/// The 402 negotiation body. Minted fresh on every negotiation — the
/// invoice id is never reused.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PaymentRequired {
    #[serde(rename = "type")]
    pub kind: String,
    pub version: u32,
    pub invoice_id: String,
    /// Unix seconds at mint time.
    pub timestamp: u64,
    pub payment_options: Vec<PaymentOption>,
    pub description: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub metadata: Option<serde_json::Value>,
}

/// A signed authorization for one of the three message shapes.
///
/// Amounts are decimal strings of atomic units; signatures are 0x-prefixed
/// 65-byte hex in Electrum notation (v ∈ {27, 28} in the final byte).
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "camelCase", rename_all_fields = "camelCase")]
pub enum Authorization {
    /// Signed router-transfer struct (`erc20-gasless-router`).
    RouterTransfer {
        token: Address,
        from: Address,
        to: Address,
        amount: String,
        /// uint256 router counter, decimal string.
        nonce: String,
        deadline: u64,
        signature: String,
    },
    /// Signed EIP-3009 authorization (transfer or receive variant — the
    /// scheme on the envelope selects the type hash).
    Eip3009 {
        from: Address,
        to: Address,
        value: String,
        valid_after: u64,
        valid_before: u64,
        nonce: FixedBytes<32>,
        signature: String,
    },
    /// Signed payment-channel receipt.
    ChannelReceipt {
        payer: Address,
        merchant: Address,
        amount: String,
        service_id: FixedBytes<32>,
        nonce: FixedBytes<32>,
        expiry: u64,
        signature: String,
    },
}

impl Authorization {
    /// The address whose signature the facilitator must recover.
    pub fn payer(&self) -> Address {
        match self {
            Authorization::RouterTransfer { from, .. } => *from,
            Authorization::Eip3009 { from, .. } => *from,
            Authorization::ChannelReceipt { payer, .. } => *payer,
        }
    }
}

/// The client's answer to a [`PaymentRequired`]: one chosen option plus the
/// signed authorization for it.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PaymentSubmitted {
    #[serde(rename = "type")]
    pub kind: String,
    pub invoice_id: String,
    pub chosen_option: PaymentOption,
    pub authorization: Authorization,
    pub scheme: String,
}

/// Terminal settlement state.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SettlementStatus {
    Pending,
    Confirmed,
    Failed,
}

/// On-chain receipt summary attached to a completed settlement.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SettlementReceipt {
    pub transaction_hash: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub block_number: Option<u64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub gas_used: Option<String>,
    /// Failure of the best-effort post-payment mint; settlement status is
    /// unaffected when set.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub mint_error: Option<String>,
}

/// The facilitator's durable completion record — exactly one per invoice id,
/// immutable once written, safely re-queryable for reconciliation.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PaymentCompleted {
    #[serde(rename = "type")]
    pub kind: String,
    pub invoice_id: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub tx_hash: Option<String>,
    pub network: String,
    pub chain_id: u64,
    pub status: SettlementStatus,
    pub timestamp: u64,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub receipt: Option<SettlementReceipt>,
    /// Receipt-NFT token id, when a mint was part of the settlement.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub token_id: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

impl PaymentCompleted {
    /// Terminal failure record; no on-chain transaction exists.
    pub fn failed(invoice_id: &str, network: &str, chain_id: u64, error: &str) -> Self {
        Self {
            kind: PAYMENT_COMPLETED_TYPE.to_string(),
            invoice_id: invoice_id.to_string(),
            tx_hash: None,
            network: network.to_string(),
            chain_id,
            status: SettlementStatus::Failed,
            timestamp: crate::unix_now(),
            receipt: None,
            token_id: None,
            error: Some(error.to_string()),
        }
    }
}
