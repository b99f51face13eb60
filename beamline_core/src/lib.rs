//! Pixel-telescope track reconstruction and alignment engine.
//!
//! A telescope is a stack of planar pixel sensors crossed by a particle
//! beam. The engine reads per-event pixel hits, groups them into clusters,
//! reconstructs straight tracks across the stack, and iteratively corrects
//! the sensor placement until the reconstructed tracks are consistent on
//! all sensors.
//!
//! The building blocks are composed through the `pipeline` traits: a
//! `Reader` fills the per-event containers, `Processor`s reconstruct, and
//! `Analyzer`s (including the three interchangeable `Aligner`s) accumulate
//! results that are published once the event loop finishes.

pub mod aligner_correlations;
pub mod aligner_localchi2;
pub mod aligner_residuals;
pub mod clusterizer;
pub mod config;
pub mod correlations;
pub mod efficiency;
pub mod error;
pub mod event;
pub mod finder;
pub mod geometry;
pub mod histogram;
pub mod hitmapper;
pub mod io;
pub mod matcher;
pub mod pipeline;
pub mod residuals;
pub mod sensor;
pub mod stats;
pub mod tracking;

// Re-export the types that make up the public surface
pub use aligner_correlations::CorrelationsAligner;
pub use aligner_localchi2::{LocalChi2Aligner, LocalChi2PlaneFitter};
pub use aligner_residuals::ResidualsAligner;
pub use clusterizer::{Clusterizer, Connectivity};
pub use config::{Device, DeviceConfig, GeometryConfig};
pub use correlations::Correlations;
pub use efficiency::Efficiency;
pub use error::Error;
pub use event::{Cluster, Event, Hit, SensorEvent, Track, TrackState};
pub use finder::TrackFinder;
pub use geometry::{Geometry, Plane};
pub use hitmapper::HitMapper;
pub use io::{RecordReader, RecordWriter};
pub use matcher::Matcher;
pub use pipeline::{Aligner, Analyzer, EventLoop, Processor, Reader, Writer};
pub use residuals::Residuals;
pub use sensor::{DenseMask, Measurement, Region, Sensor};
pub use tracking::StraightFitter;
