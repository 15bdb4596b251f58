//! Client side of the plasma-x402 payment protocol.
//!
//! Given a [`x402::PaymentRequired`] offer, the [`PaymentChooser`] picks the
//! best option by network preference, signs the matching EIP-712 document,
//! and produces the [`x402::PaymentSubmitted`] wire message for the
//! facilitator.

pub mod chooser;

pub use chooser::{ChooserConfig, PaymentChooser};
