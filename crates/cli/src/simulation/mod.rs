//! Simulated fleet orchestration.

mod orchestrator;
mod stats;

pub use orchestrator::{plan_fleet, NodePlan, Simulation, SimulationConfig};
pub use stats::{NodeOutcome, SimulationStats};
