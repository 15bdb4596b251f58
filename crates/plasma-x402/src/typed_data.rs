//! Canonical EIP-712 document construction for the three signed message
//! shapes, plus bytes32 input normalization for wire data.
//!
//! Documents are [`alloy::dyn_abi::TypedData`] values (domain + types +
//! primaryType + message), so they serialize to the exact JSON an on-chain
//! verifying contract expects and hash to the exact digest it recovers.

use std::borrow::Cow;

use alloy::dyn_abi::TypedData;
use alloy::primitives::{Address, B256, U256};
use alloy::sol_types::Eip712Domain;

use crate::constants::{
    CHANNEL_DOMAIN_NAME, CHANNEL_DOMAIN_VERSION, ROUTER_DOMAIN_NAME, ROUTER_DOMAIN_VERSION,
};
use crate::{Receipt, ReceiveWithAuthorization, Transfer, TransferWithAuthorization, X402Error};

/// How wire-supplied bytes32 values are normalized.
///
/// Strict is the default everywhere. Lenient zero-padding must be opted into
/// explicitly; it is intended for test and dry-run harnesses that feed short
/// synthetic nonces, and it logs every padding it performs.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum Bytes32Mode {
    /// Exactly 32 bytes (64 hex chars), nothing else.
    #[default]
    Strict,
    /// Short input is left-padded with zeros; over-long input still fails.
    LenientZeroPad,
}

/// Normalize a raw byte slice into a bytes32 value.
pub fn bytes32_from_slice(bytes: &[u8], mode: Bytes32Mode) -> Result<B256, X402Error> {
    match bytes.len() {
        32 => Ok(B256::from_slice(bytes)),
        n if n < 32 && mode == Bytes32Mode::LenientZeroPad => {
            tracing::warn!(len = n, "short bytes32 value left-padded with zeros");
            let mut out = [0u8; 32];
            out[32 - n..].copy_from_slice(bytes);
            Ok(B256::new(out))
        }
        n => Err(X402Error::Validation(format!(
            "bytes32 value must be 32 bytes, got {n}"
        ))),
    }
}

/// Parse a hex-encoded bytes32 value (0x prefix optional).
pub fn parse_bytes32(input: &str, mode: Bytes32Mode) -> Result<B256, X402Error> {
    let hex_str = input.strip_prefix("0x").unwrap_or(input);
    if hex_str.is_empty() {
        return Err(X402Error::Validation("empty bytes32 value".to_string()));
    }
    let bytes = alloy::hex::decode(hex_str)
        .map_err(|e| X402Error::Validation(format!("invalid hex in bytes32 value: {e}")))?;
    bytes32_from_slice(&bytes, mode)
}

fn domain(name: &str, version: &str, chain_id: u64, verifying_contract: Address) -> Eip712Domain {
    Eip712Domain {
        name: Some(Cow::Owned(name.to_string())),
        version: Some(Cow::Owned(version.to_string())),
        chain_id: Some(U256::from(chain_id)),
        verifying_contract: Some(verifying_contract),
        salt: None,
    }
}

/// Builds the EIP-712 documents the protocol signs.
#[derive(Debug, Clone, Copy, Default)]
pub struct TypedDataBuilder {
    mode: Bytes32Mode,
}

impl TypedDataBuilder {
    pub fn new() -> Self {
        Self::default()
    }

    /// Builder that zero-pads short bytes32 wire input instead of rejecting it.
    pub fn lenient() -> Self {
        Self {
            mode: Bytes32Mode::LenientZeroPad,
        }
    }

    /// Normalize a wire-supplied bytes32 value under this builder's mode.
    pub fn bytes32(&self, input: &str) -> Result<B256, X402Error> {
        parse_bytes32(input, self.mode)
    }

    /// Router-transfer document, primaryType `Transfer`, bound to the router
    /// contract on the given chain.
    pub fn router_transfer(&self, chain_id: u64, router: Address, transfer: &Transfer) -> TypedData {
        TypedData::from_struct(
            transfer,
            Some(domain(
                ROUTER_DOMAIN_NAME,
                ROUTER_DOMAIN_VERSION,
                chain_id,
                router,
            )),
        )
    }

    /// EIP-3009 document, primaryType `TransferWithAuthorization`, bound to
    /// the token contract under its own name/version.
    pub fn transfer_with_authorization(
        &self,
        chain_id: u64,
        token: Address,
        token_name: &str,
        token_version: &str,
        auth: &TransferWithAuthorization,
    ) -> TypedData {
        TypedData::from_struct(auth, Some(domain(token_name, token_version, chain_id, token)))
    }

    /// EIP-3009 document, primaryType `ReceiveWithAuthorization`.
    pub fn receive_with_authorization(
        &self,
        chain_id: u64,
        token: Address,
        token_name: &str,
        token_version: &str,
        auth: &ReceiveWithAuthorization,
    ) -> TypedData {
        TypedData::from_struct(auth, Some(domain(token_name, token_version, chain_id, token)))
    }

    /// Channel-receipt document, primaryType `Receipt`, bound to the channel
    /// contract.
    pub fn channel_receipt(&self, chain_id: u64, channel: Address, receipt: &Receipt) -> TypedData {
        TypedData::from_struct(
            receipt,
            Some(domain(
                CHANNEL_DOMAIN_NAME,
                CHANNEL_DOMAIN_VERSION,
                chain_id,
                channel,
            )),
        )
    }
}
