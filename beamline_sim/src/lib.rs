//! Deterministic simulation harness for the beamline telescope engine.
//!
//! Provides synthetic telescope construction, a seeded ground-truth event
//! generator, an in-memory reader, and drivers that run reconstruction
//! and alignment iterations over generated samples. The scenario module
//! hosts quantitative end-to-end checks.

pub mod oracle;
pub mod reader;
pub mod runner;
pub mod scenarios;
pub mod telescope;

pub use oracle::{Oracle, OracleConfig, SimEvent};
pub use reader::SimReader;
pub use runner::{align, reconstruct, AlignConfig, AlignMethod, RunConfig, RunSummary};
pub use scenarios::{ScenarioId, ScenarioResult, ScenarioRunner};
pub use telescope::{telescope_device, with_local_misalignment, with_shifted_sensor, TelescopeConfig};
