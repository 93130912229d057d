//! Decision layer: the total-driven grid engine and its persistence gate.

pub mod engine;
pub mod persistence;

pub use engine::{CloseSignal, DecisionEngine, OpenFill};
pub use persistence::{Comparison, PersistenceGate};
