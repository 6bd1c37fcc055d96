//! Engine - State, reconciliation, risk and order lifecycle

pub mod order;
pub mod reconcile;
pub mod risk;
pub mod runtime;
pub mod state;

pub use order::{CancelOutcome, OrderLifecycleManager, SubmitReceipt, SweepReport};
pub use reconcile::{Bootstrap, EngineInput, ReconcileCounts, ReconcileHandle, ReconciliationLoop};
pub use risk::{RejectReason, RiskDecision, RiskGate, SubmissionWindow};
pub use runtime::{Engine, EngineHandle};
pub use state::{AccountState, Applied, HaltReason, LocalMutation, StateReader, StateStore};
