//! x402 payment negotiation and settlement for Plasma and Ethereum.
//!
//! Implements the off-chain half of an HTTP 402 payment exchange: a resource
//! server advertises payment options, a client signs an EIP-712 authorization
//! for one of them, and a facilitator verifies and settles it on-chain,
//! producing a durable, idempotent completion record.
//!
//! # Three-party model
//!
//! - **Negotiator** ([`PaymentNegotiator`]) — mints [`PaymentRequired`] offers
//!   with per-scheme fee breakdowns
//! - **Client** (`x402_client::PaymentChooser`) — picks an option and signs it
//! - **Facilitator** ([`SettlementFacilitator`]) — verifies signatures,
//!   settles on-chain, persists exactly one [`PaymentCompleted`] per invoice
//!
//! # Quick example (negotiation)
//!
//! ```no_run
//! use alloy::primitives::{address, U256};
//! use x402::{FeePolicy, PaymentNegotiator, DEFAULT_DEADLINE_SECS};
//!
//! let merchant = address!("000000000000000000000000000000000000dEaD");
//! let negotiator = PaymentNegotiator::new(merchant, FeePolicy::new(10, U256::ZERO));
//! let offer = negotiator
//!     .build_payment_required(U256::from(1_000_000u64), "api access", DEFAULT_DEADLINE_SECS)
//!     .unwrap();
//! assert_eq!(offer.payment_options.len(), 2);
//! ```

pub mod constants;
pub mod error;
pub mod fees;
pub mod payment;

pub mod signer;
pub mod typed_data;

pub mod contracts;
pub mod facilitator;
pub mod negotiator;
pub mod nonce;
pub mod store;

use alloy::sol;

// EIP-712 structs for the three signed message shapes. The sol! macro derives
// SolStruct, which provides eip712_signing_hash(); serde::Serialize is needed
// so TypedData::from_struct can render the message body.
sol! {
    /// Router-mediated gasless ERC-20 transfer.
    /// Domain: {name: "PaymentRouter", version: "1", chainId, verifyingContract: router}.
    #[derive(Debug, serde::Serialize)]
    struct Transfer {
        address token;
        address from;
        address to;
        uint256 amount;
        uint256 nonce;
        uint256 deadline;
    }

    /// EIP-3009 transfer authorization.
    /// Domain: {name: token name, version: token version, chainId, verifyingContract: token}.
    #[derive(Debug, serde::Serialize)]
    struct TransferWithAuthorization {
        address from;
        address to;
        uint256 value;
        uint256 validAfter;
        uint256 validBefore;
        bytes32 nonce;
    }

    /// EIP-3009 receive authorization (same fields, distinct type hash —
    /// the receiving contract must be msg.sender on-chain).
    #[derive(Debug, serde::Serialize)]
    struct ReceiveWithAuthorization {
        address from;
        address to;
        uint256 value;
        uint256 validAfter;
        uint256 validBefore;
        bytes32 nonce;
    }

    /// Off-chain payment-channel receipt.
    /// Domain: {name: "PlasmaPaymentChannel", version: "1", chainId, verifyingContract: channel}.
    #[derive(Debug, serde::Serialize)]
    struct Receipt {
        address payer;
        address merchant;
        uint256 amount;
        bytes32 serviceId;
        bytes32 nonce;
        uint64 expiry;
    }

    /// Gasless transfer router consumed on the Ethereum path.
    #[sol(rpc)]
    interface IPaymentRouter {
        function gaslessTransfer(
            address token,
            address from,
            address to,
            uint256 amount,
            uint256 deadline,
            uint8 v,
            bytes32 r,
            bytes32 s
        ) external;
        function nonces(address owner) external view returns (uint256);
    }

    /// EIP-3009 token entry points, split-signature calling convention.
    #[sol(rpc)]
    interface IEip3009Token {
        function name() external view returns (string);
        function version() external view returns (string);
        function transferWithAuthorization(
            address from,
            address to,
            uint256 value,
            uint256 validAfter,
            uint256 validBefore,
            bytes32 nonce,
            uint8 v,
            bytes32 r,
            bytes32 s
        ) external;
        function receiveWithAuthorization(
            address from,
            address to,
            uint256 value,
            uint256 validAfter,
            uint256 validBefore,
            bytes32 nonce,
            uint8 v,
            bytes32 r,
            bytes32 s
        ) external;
    }

    /// EIP-3009 token entry points, packed 65-byte signature convention.
    #[sol(rpc)]
    interface IEip3009TokenPacked {
        function transferWithAuthorization(
            address from,
            address to,
            uint256 value,
            uint256 validAfter,
            uint256 validBefore,
            bytes32 nonce,
            bytes signature
        ) external;
        function receiveWithAuthorization(
            address from,
            address to,
            uint256 value,
            uint256 validAfter,
            uint256 validBefore,
            bytes32 nonce,
            bytes signature
        ) external;
    }

    /// Payment-channel settlement contract.
    #[sol(rpc)]
    interface IPaymentChannel {
        function settleBatch(Receipt[] receipts, bytes[] signatures) external;
    }

    /// Combined pay-and-mint router for receipt NFTs.
    #[sol(rpc)]
    interface INftReceiptRouter {
        function payAndMintReceiveAuth(
            address token,
            address payer,
            uint256 value,
            uint256 validAfter,
            uint256 validBefore,
            bytes32 nonce,
            bytes signature
        ) external returns (uint256);
        function payAndMintVRS(
            address token,
            address payer,
            uint256 value,
            uint256 validAfter,
            uint256 validBefore,
            bytes32 nonce,
            uint8 v,
            bytes32 r,
            bytes32 s
        ) external returns (uint256);
        function mintReceipt(address to) external returns (uint256);
    }
}

// Re-exports
pub use constants::*;
pub use error::X402Error;
pub use fees::{FeeBreakdown, FeeMode, FeePolicy};
pub use payment::*;

pub use facilitator::{ConfirmationPolicy, NetworkHandle, SettlementFacilitator};
pub use negotiator::{PaymentNegotiator, DEFAULT_DEADLINE_SECS};
pub use nonce::{NonceManager, SharedNonceStore};
pub use signer::{SignerConfig, SignerHandle};
pub use store::InvoiceStore;
pub use typed_data::{Bytes32Mode, TypedDataBuilder};

/// Current unix time in seconds.
pub(crate) fn unix_now() -> u64 {
    std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .map(|d| d.as_secs())
        .unwrap_or(0)
}
