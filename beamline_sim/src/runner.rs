//! Reconstruction and alignment drivers.
//!
//! A run wires the standard processor chain (hit mapping, clustering,
//! track finding, local-state fitting, matching) in front of the
//! requested analyzers. The alignment driver repeats such runs, replaying
//! the same event sample against the geometry produced by the previous
//! iteration.

use std::sync::Arc;

use serde::Serialize;
use tracing::info;

use beamline_core::config::Device;
use beamline_core::error::Error;
use beamline_core::pipeline::{Aligner, Analyzer, EventLoop, Processor, Writer};
use beamline_core::stats::StatAccumulator;
use beamline_core::{
    Clusterizer, Correlations, CorrelationsAligner, Efficiency, Event, HitMapper,
    LocalChi2Aligner, Matcher, Residuals, ResidualsAligner, StraightFitter, TrackFinder,
};

use crate::oracle::SimEvent;
use crate::reader::SimReader;

/// Reconstruction cuts.
#[derive(Debug, Clone)]
pub struct RunConfig {
    pub num_clusters_min: usize,
    pub search_sigma_max: f64,
    pub red_chi2_max: f64,
    pub distance_sigma_max: f64,
}

impl Default for RunConfig {
    fn default() -> Self {
        Self {
            num_clusters_min: 3,
            search_sigma_max: 10.0,
            red_chi2_max: -1.0,
            distance_sigma_max: 5.0,
        }
    }
}

/// Aggregated result of one reconstruction pass.
#[derive(Debug, Clone, Serialize)]
pub struct RunSummary {
    pub events: u64,
    pub tracks: u64,
    /// Tracks with a cluster on every sensor.
    pub full_length_tracks: u64,
    pub mean_track_size: f64,
    pub mean_reduced_chi2: f64,
}

struct TrackStats {
    num_sensors: usize,
    events: u64,
    tracks: u64,
    full_length: u64,
    size: StatAccumulator,
    red_chi2: StatAccumulator,
}

impl TrackStats {
    fn new(num_sensors: usize) -> Self {
        Self {
            num_sensors,
            events: 0,
            tracks: 0,
            full_length: 0,
            size: StatAccumulator::new(),
            red_chi2: StatAccumulator::new(),
        }
    }

    fn summary(&self) -> RunSummary {
        RunSummary {
            events: self.events,
            tracks: self.tracks,
            full_length_tracks: self.full_length,
            mean_track_size: self.size.avg(),
            mean_reduced_chi2: self.red_chi2.avg(),
        }
    }
}

impl Analyzer for TrackStats {
    fn name(&self) -> &str {
        "TrackStats"
    }

    fn execute(&mut self, event: &Event) -> Result<(), Error> {
        self.events += 1;
        for track in event.tracks() {
            self.tracks += 1;
            self.size.fill(track.size() as f64);
            if track.size() == self.num_sensors {
                self.full_length += 1;
            }
            if track.reduced_chi2().is_finite() {
                self.red_chi2.fill(track.reduced_chi2());
            }
        }
        Ok(())
    }

    fn finalize(&mut self) -> Result<(), Error> {
        info!(
            "reconstructed {} tracks in {} events (mean size {:.2}, mean chi2/dof {:.3})",
            self.tracks,
            self.events,
            self.size.avg(),
            self.red_chi2.avg()
        );
        Ok(())
    }
}

/// Run the processor chain over the sample and feed the analyzers.
///
/// With `with_tracking` disabled only hit mapping and clustering run,
/// which is all the correlation-based alignment needs.
pub fn run_pipeline(
    device: &Arc<Device>,
    events: &Arc<Vec<SimEvent>>,
    cfg: &RunConfig,
    with_tracking: bool,
    analyzers: &mut [&mut dyn Analyzer],
    writer: Option<&mut dyn Writer>,
) -> Result<u64, Error> {
    let mut reader = SimReader::new(events.clone());
    let hitmapper = HitMapper::new(device.clone());
    let clusterizer = Clusterizer::new(device.clone());

    let mut finder = None;
    let mut fitter = None;
    let mut matchers: Vec<Matcher> = Vec::new();
    if with_tracking {
        let ids = device.sensor_ids();
        finder = Some(TrackFinder::new(
            device.clone(),
            &ids,
            cfg.num_clusters_min,
            cfg.search_sigma_max,
            cfg.red_chi2_max,
        )?);
        fitter = Some(StraightFitter::new(device.clone()));
        matchers = ids
            .iter()
            .map(|&id| Matcher::new(device, id, cfg.distance_sigma_max))
            .collect();
    }

    let mut evloop = EventLoop::new(&mut reader);
    evloop.add_processor(&hitmapper);
    evloop.add_processor(&clusterizer);
    if let Some(finder) = finder.as_ref() {
        evloop.add_processor(finder);
    }
    if let Some(fitter) = fitter.as_ref() {
        evloop.add_processor(fitter);
    }
    for matcher in matchers.iter() {
        evloop.add_processor(matcher as &dyn Processor);
    }
    for analyzer in analyzers.iter_mut() {
        evloop.add_analyzer(&mut **analyzer);
    }
    if let Some(writer) = writer {
        evloop.set_writer(writer);
    }
    evloop.run()
}

/// Reconstruct the sample once and summarize the tracks.
///
/// The standard analyzers run alongside the summary so that their results
/// show up in the log, mirroring a full reconstruction job.
pub fn reconstruct(
    device: &Arc<Device>,
    events: &Arc<Vec<SimEvent>>,
    cfg: &RunConfig,
) -> Result<RunSummary, Error> {
    let ids = device.sensor_ids();
    let mut stats = TrackStats::new(device.num_sensors());
    let mut residuals = Residuals::new(device.clone(), &ids, 5.0, 127);
    let mut correlations = Correlations::for_all_sensors(device.clone(), 1)?;
    let mut efficiencies = ids
        .iter()
        .map(|&id| Efficiency::new(device.clone(), id, 2, 1, 2, 16))
        .collect::<Result<Vec<_>, _>>()?;

    let mut analyzers: Vec<&mut dyn Analyzer> =
        vec![&mut stats, &mut residuals, &mut correlations];
    for efficiency in efficiencies.iter_mut() {
        analyzers.push(efficiency);
    }
    run_pipeline(device, events, cfg, true, &mut analyzers, None)?;
    Ok(stats.summary())
}

/// Reconstruct the sample and persist every event to a record file.
pub fn reconstruct_to_file(
    device: &Arc<Device>,
    events: &Arc<Vec<SimEvent>>,
    cfg: &RunConfig,
    path: &std::path::Path,
) -> Result<RunSummary, Error> {
    let mut stats = TrackStats::new(device.num_sensors());
    let mut writer = beamline_core::RecordWriter::create(path, device.num_sensors())?;
    run_pipeline(device, events, cfg, true, &mut [&mut stats], Some(&mut writer))?;
    writer.finalize()?;
    Ok(stats.summary())
}

/// The interchangeable alignment strategies.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AlignMethod {
    Correlations,
    Residuals,
    LocalChi2,
}

impl std::fmt::Display for AlignMethod {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let name = match self {
            AlignMethod::Correlations => "correlations",
            AlignMethod::Residuals => "residuals",
            AlignMethod::LocalChi2 => "localchi2",
        };
        write!(f, "{name}")
    }
}

/// Alignment strategy and iteration parameters.
#[derive(Debug, Clone)]
pub struct AlignConfig {
    pub method: AlignMethod,
    /// Reference sensor for the correlation method.
    pub fixed_id: usize,
    pub align_ids: Vec<usize>,
    pub damping: f64,
    pub iterations: usize,
    pub pixel_range: f64,
    pub gamma_range: f64,
    pub bins: usize,
}

impl Default for AlignConfig {
    fn default() -> Self {
        Self {
            method: AlignMethod::LocalChi2,
            fixed_id: 0,
            align_ids: vec![],
            damping: 0.8,
            iterations: 3,
            pixel_range: 3.0,
            gamma_range: 0.1,
            bins: 127,
        }
    }
}

/// Iterate the chosen aligner over the sample.
///
/// Each iteration replays all events with the current geometry and
/// applies the aligner's corrected geometry for the next round. A solver
/// failure aborts the iteration and surfaces as an error.
pub fn align(
    device: &Arc<Device>,
    events: &Arc<Vec<SimEvent>>,
    run_cfg: &RunConfig,
    align_cfg: &AlignConfig,
) -> Result<Arc<Device>, Error> {
    let mut current = device.clone();
    for iteration in 0..align_cfg.iterations {
        info!(
            "alignment iteration {} using {}",
            iteration, align_cfg.method
        );
        let geometry = match align_cfg.method {
            AlignMethod::Correlations => {
                let mut aligner = CorrelationsAligner::new(
                    current.clone(),
                    align_cfg.fixed_id,
                    &align_cfg.align_ids,
                )?;
                run_pipeline(&current, events, run_cfg, false, &mut [&mut aligner], None)?;
                aligner.updated_geometry()?
            }
            AlignMethod::Residuals => {
                let mut aligner = ResidualsAligner::new(
                    current.clone(),
                    &align_cfg.align_ids,
                    align_cfg.damping,
                    align_cfg.pixel_range,
                    align_cfg.gamma_range,
                    align_cfg.bins,
                )?;
                run_pipeline(&current, events, run_cfg, true, &mut [&mut aligner], None)?;
                aligner.updated_geometry()?
            }
            AlignMethod::LocalChi2 => {
                let mut aligner = LocalChi2Aligner::new(
                    current.clone(),
                    &align_cfg.align_ids,
                    align_cfg.damping,
                )?;
                run_pipeline(&current, events, run_cfg, true, &mut [&mut aligner], None)?;
                aligner.updated_geometry()?
            }
        };
        current = Arc::new(current.with_geometry(geometry)?);
    }
    Ok(current)
}
