//! Spread construction: directional enumeration, closing-view rebuild,
//! and the per-pair pipeline feeding the decision engine.

pub mod calculator;
pub mod pipeline;

pub use calculator::SpreadCalculator;
pub use pipeline::{LegState, MissingLegDiagnostics, PairSignals, SpreadPipeline};
