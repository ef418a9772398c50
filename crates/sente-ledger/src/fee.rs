use sente_types::FeeRule;

/// Computes the fee for a financial operation in minor units.
///
/// `fee = clamp(amount * percent_bps / 10_000 + flat, min, max)`; the
/// percentage component truncates toward zero. Min is applied before max, so
/// a rule with `min > max` resolves to `max`.
pub fn compute_fee(amount_minor: u64, rule: &FeeRule) -> u64 {
    let percent_component =
        (u128::from(amount_minor) * u128::from(rule.percent_bps)) / 10_000u128;
    let percent_component = u64::try_from(percent_component).unwrap_or(u64::MAX);
    let mut fee = percent_component.saturating_add(rule.flat_minor);

    if let Some(min_minor) = rule.min_minor {
        fee = fee.max(min_minor);
    }
    if let Some(max_minor) = rule.max_minor {
        fee = fee.min(max_minor);
    }
    fee
}
