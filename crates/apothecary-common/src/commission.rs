use serde::{Deserialize, Serialize};

use crate::CommonError;

/// Basis points in 100%.
pub const BPS_SCALE: i64 = 10_000;

/// A sales threshold above which a referrer earns `rate_bps`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct CommissionTier {
    pub min_sales: i64,
    pub rate_bps: u32,
}

impl CommissionTier {
    pub fn validate(&self) -> Result<(), CommonError> {
        validate_rate(self.rate_bps)
    }
}

pub fn validate_rate(rate_bps: u32) -> Result<(), CommonError> {
    if i64::from(rate_bps) > BPS_SCALE {
        return Err(CommonError::RateOutOfRange(rate_bps));
    }
    Ok(())
}

/// Pick the rate for a referrer with `lifetime_sales` of approved sales.
///
/// The tier with the highest `min_sales` not exceeding `lifetime_sales` wins;
/// tiers need not be sorted. Falls back to `base_rate_bps`.
pub fn select_rate(tiers: &[CommissionTier], lifetime_sales: i64, base_rate_bps: u32) -> u32 {
    tiers
        .iter()
        .filter(|t| t.min_sales <= lifetime_sales)
        .max_by_key(|t| t.min_sales)
        .map(|t| t.rate_bps)
        .unwrap_or(base_rate_bps)
}

/// Commission on `total` at `rate_bps`, rounded down to whole VND.
pub fn commission_amount(total: i64, rate_bps: u32) -> i64 {
    if total <= 0 {
        return 0;
    }
    total.saturating_mul(i64::from(rate_bps)) / BPS_SCALE
}

#[cfg(test)]
mod tests {
    use super::*;

    fn tiers() -> Vec<CommissionTier> {
        vec![
            CommissionTier { min_sales: 50_000_000, rate_bps: 1500 },
            CommissionTier { min_sales: 10_000_000, rate_bps: 1200 },
        ]
    }

    #[test]
    fn test_select_rate_uses_base_below_first_tier() {
        assert_eq!(select_rate(&tiers(), 9_999_999, 1000), 1000);
        assert_eq!(select_rate(&[], 1_000_000_000, 800), 800);
    }

    #[test]
    fn test_select_rate_picks_highest_reached_tier() {
        assert_eq!(select_rate(&tiers(), 10_000_000, 1000), 1200);
        assert_eq!(select_rate(&tiers(), 49_000_000, 1000), 1200);
        assert_eq!(select_rate(&tiers(), 75_000_000, 1000), 1500);
    }

    #[test]
    fn test_commission_amount_rounds_down() {
        assert_eq!(commission_amount(350_000, 1000), 35_000);
        assert_eq!(commission_amount(99_999, 1250), 12_499);
        assert_eq!(commission_amount(0, 1000), 0);
        assert_eq!(commission_amount(-5, 1000), 0);
    }

    #[test]
    fn test_rate_validation() {
        assert!(validate_rate(10_000).is_ok());
        assert_eq!(validate_rate(10_001), Err(CommonError::RateOutOfRange(10_001)));
    }
}
