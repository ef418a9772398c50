//! Pure admission logic for the Sente dispatch engine.
//!
//! The fee engine and the budget/balance admission predicates live here with
//! no I/O so they can gate dispatch from any caller. These checks are the
//! only gate: once a request is admitted it proceeds to dispatch even if the
//! eventual provider attempt fails.

pub mod admission;
pub mod fee;

pub use admission::{admit_balance, admit_budget, AdmissionError, BudgetLimit};
pub use fee::compute_fee;
