//! Platform fee policy.
//!
//! Fees are basis-point percentages of the payment amount, floored to integer
//! atomic units. Direct (non-channel) settlement additionally carries a
//! configurable minimum fee that covers relayer gas. Integer-only math, no
//! f64 anywhere in the pipeline.

use alloy::primitives::U256;
use serde::{Deserialize, Serialize};

use crate::X402Error;

/// Basis-point denominator.
pub const BPS_DENOMINATOR: u64 = 10_000;

/// Settlement mode the fee applies to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum FeeMode {
    /// Off-chain channel receipt; gas is amortized across a batch.
    Channel,
    /// Direct on-chain settlement; the relayer pays gas per payment.
    Direct,
}

/// Platform fee configuration.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FeePolicy {
    /// Percentage fee in basis points.
    pub fee_bps: u32,
    /// Minimum fee in atomic units for direct settlement. Zero disables the floor.
    pub direct_floor: U256,
}

impl FeePolicy {
    pub fn new(fee_bps: u32, direct_floor: U256) -> Self {
        Self {
            fee_bps,
            direct_floor,
        }
    }

    /// `floor(amount * bps / 10_000)` in atomic units.
    pub fn percent_fee(&self, amount: U256) -> Result<U256, X402Error> {
        amount
            .checked_mul(U256::from(self.fee_bps))
            .map(|scaled| scaled / U256::from(BPS_DENOMINATOR))
            .ok_or_else(|| X402Error::Validation(format!("fee overflow for amount {amount}")))
    }

    /// Compute the full fee breakdown for an amount under the given mode.
    ///
    /// Channel mode charges the percentage fee only. Direct mode charges
    /// `max(percent_fee, direct_floor)` when the floor is enabled, and
    /// reports whether the floor displaced the percentage.
    pub fn breakdown(&self, amount: U256, mode: FeeMode) -> Result<FeeBreakdown, X402Error> {
        let percent = self.percent_fee(amount)?;
        let (total, floor_applied) = match mode {
            FeeMode::Channel => (percent, false),
            FeeMode::Direct if !self.direct_floor.is_zero() => {
                let total = percent.max(self.direct_floor);
                (total, total == self.direct_floor && percent < self.direct_floor)
            }
            FeeMode::Direct => (percent, false),
        };
        Ok(FeeBreakdown {
            mode,
            fee_bps: self.fee_bps,
            percent_fee: percent.to_string(),
            floor: self.direct_floor.to_string(),
            total_fee: total.to_string(),
            floor_applied,
        })
    }
}

/// Wire-format fee breakdown attached to each payment option.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct FeeBreakdown {
    pub mode: FeeMode,
    pub fee_bps: u32,
    pub percent_fee: String,
    pub floor: String,
    pub total_fee: String,
    pub floor_applied: bool,
}

#[cfg(test)]
mod tests {
    use super::*;

    fn amount(n: u64) -> U256 {
        U256::from(n)
    }

    #[test]
    fn channel_mode_never_floors() {
        let policy = FeePolicy::new(10, amount(1500));
        let fee = policy.breakdown(amount(10_000), FeeMode::Channel).unwrap();
        assert_eq!(fee.percent_fee, "10");
        assert_eq!(fee.total_fee, "10");
        assert!(!fee.floor_applied);
    }

    #[test]
    fn direct_mode_applies_floor_below_threshold() {
        let policy = FeePolicy::new(10, amount(1500));
        let fee = policy.breakdown(amount(10_000), FeeMode::Direct).unwrap();
        assert_eq!(fee.percent_fee, "10");
        assert_eq!(fee.total_fee, "1500");
        assert!(fee.floor_applied);
    }

    #[test]
    fn direct_mode_percentage_wins_above_threshold() {
        let policy = FeePolicy::new(10, amount(1500));
        let fee = policy.breakdown(amount(2_000_000), FeeMode::Direct).unwrap();
        assert_eq!(fee.percent_fee, "2000");
        assert_eq!(fee.total_fee, "2000");
        assert!(!fee.floor_applied);
    }

    #[test]
    fn direct_mode_without_floor_is_pure_percentage() {
        let policy = FeePolicy::new(10, U256::ZERO);
        let fee = policy.breakdown(amount(1_000_000), FeeMode::Direct).unwrap();
        assert_eq!(fee.total_fee, "1000");
        assert!(!fee.floor_applied);
    }

    #[test]
    fn fee_equal_to_floor_is_not_flagged() {
        // percent == floor: the floor did not displace anything
        let policy = FeePolicy::new(10, amount(1000));
        let fee = policy.breakdown(amount(1_000_000), FeeMode::Direct).unwrap();
        assert_eq!(fee.total_fee, "1000");
        assert!(!fee.floor_applied);
    }

    #[test]
    fn percent_fee_floors_fractional_bps() {
        let policy = FeePolicy::new(10, U256::ZERO);
        // 9_999 * 10 / 10_000 = 9.999 -> 9
        assert_eq!(policy.percent_fee(amount(9_999)).unwrap(), amount(9));
    }

    #[test]
    fn zero_amount_has_zero_percent_fee() {
        let policy = FeePolicy::new(25, U256::ZERO);
        assert_eq!(policy.percent_fee(U256::ZERO).unwrap(), U256::ZERO);
    }

    #[test]
    fn breakdown_serializes_camel_case() {
        let policy = FeePolicy::new(10, amount(1500));
        let fee = policy.breakdown(amount(10_000), FeeMode::Direct).unwrap();
        let json = serde_json::to_value(&fee).unwrap();
        assert_eq!(json["mode"], "direct");
        assert_eq!(json["totalFee"], "1500");
        assert_eq!(json["floorApplied"], true);
        assert_eq!(json["feeBps"], 10);
    }
}
