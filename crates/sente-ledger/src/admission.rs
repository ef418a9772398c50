use sente_types::BudgetState;
use thiserror::Error;

/// Which budget limit rejected an admission.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BudgetLimit {
    Total,
    Daily,
    Monthly,
}

impl BudgetLimit {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Total => "total",
            Self::Daily => "daily",
            Self::Monthly => "monthly",
        }
    }
}

/// Admission-time rejections. No side effect has occurred when one of these
/// is returned; the caller may retry after the cap changes.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum AdmissionError {
    #[error("budget exceeded for scope '{scope}' ({limit} limit)", limit = .limit.as_str())]
    BudgetExceeded { scope: String, limit: BudgetLimit },
    #[error("insufficient funds: available {available_minor}, required {required_minor}")]
    InsufficientFunds {
        available_minor: u64,
        required_minor: u64,
    },
}

/// Admits a notification dispatch of `cost_minor` against a budget scope.
///
/// A limit of `0` means unlimited. The daily and monthly checks gate the
/// dispatch count, not spend; the total limit gates cumulative spend.
pub fn admit_budget(state: &BudgetState, cost_minor: u64) -> Result<(), AdmissionError> {
    if state.limit_total > 0 && state.spent_to_date.saturating_add(cost_minor) > state.limit_total
    {
        return Err(AdmissionError::BudgetExceeded {
            scope: state.scope.clone(),
            limit: BudgetLimit::Total,
        });
    }
    if state.limit_per_day > 0 && state.count_today.saturating_add(1) > state.limit_per_day {
        return Err(AdmissionError::BudgetExceeded {
            scope: state.scope.clone(),
            limit: BudgetLimit::Daily,
        });
    }
    if state.limit_per_month > 0
        && state.count_this_month.saturating_add(1) > state.limit_per_month
    {
        return Err(AdmissionError::BudgetExceeded {
            scope: state.scope.clone(),
            limit: BudgetLimit::Monthly,
        });
    }
    Ok(())
}

/// Admits a withdrawal of `amount_minor` plus `fee_minor` against an
/// available wallet balance.
pub fn admit_balance(
    available_minor: u64,
    amount_minor: u64,
    fee_minor: u64,
) -> Result<(), AdmissionError> {
    let required_minor = amount_minor.saturating_add(fee_minor);
    if required_minor > available_minor {
        return Err(AdmissionError::InsufficientFunds {
            available_minor,
            required_minor,
        });
    }
    Ok(())
}
