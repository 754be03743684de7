//! Map-reduce harvesting of simulation outputs
//!
//! For each experiment, every analyzer stages experiment context and filters
//! the simulations it wants. The selected (analyzer, simulation) pairs are
//! mapped in parallel; each analyzer then reduces its own selection once all
//! pairs have finished.

mod analyzer;
mod manager;

pub use analyzer::{Analyzer, SimulationData};
pub use manager::{AnalyzeManager, AnalyzerOutcome};
