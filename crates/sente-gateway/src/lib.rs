//! Financial dispatch path: mobile-money withdrawals through the payment
//! gateway, plus the settlement status tracker.
//!
//! Initiation is synchronous up to gateway acceptance; settlement arrives
//! out-of-band and is applied by the [`StatusTracker`], never by the
//! dispatch path itself.

pub mod client;
pub mod status;
pub mod withdrawal;

pub use client::{
    GatewayAcceptance, GatewayConfig, GatewayError, HttpPaymentGateway, InitiationRequest,
    PaymentGateway,
};
pub use status::{SettlementApplied, SettlementOutcome, StatusError, StatusTracker};
pub use withdrawal::{WithdrawError, WithdrawalConfig, WithdrawalReceipt, WithdrawalService};
