//! End-to-end validation scenarios.
//!
//! Each scenario builds a telescope, generates a deterministic event
//! sample, runs reconstruction and/or alignment, and checks quantitative
//! expectations. The scenarios double as the acceptance tests of the
//! engine.

use std::sync::Arc;

use nalgebra::{Matrix2, Matrix4, Vector4, Vector6};
use rand::Rng;
use rand::SeedableRng;
use rand_chacha::ChaCha8Rng;
use rand_distr::{Distribution, Normal};
use tracing::info;

use beamline_core::aligner_localchi2::LocalChi2PlaneFitter;
use beamline_core::event::{Cluster, TrackState};

use crate::oracle::{Oracle, OracleConfig};
use crate::runner::{align, reconstruct, AlignConfig, AlignMethod, RunConfig};
use crate::telescope::{
    telescope_device, with_local_misalignment, with_shifted_sensor, TelescopeConfig,
};

/// The available scenarios.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ScenarioId {
    /// Aligned telescope: every track is found and corrections vanish.
    PerfectTelescope,
    /// A shifted sensor is recovered by the correlation aligner.
    ShiftedSensor,
    /// The residuals aligner converges onto a small offset with damping.
    ResidualsConvergence,
    /// The local chi2 solver recovers an injected misalignment from a
    /// synthetic track sample.
    LocalChi2Synthetic,
    /// The local chi2 aligner recovers a misalignment through the full
    /// reconstruction pipeline.
    LocalChi2Pipeline,
}

impl ScenarioId {
    pub fn all() -> [ScenarioId; 5] {
        [
            ScenarioId::PerfectTelescope,
            ScenarioId::ShiftedSensor,
            ScenarioId::ResidualsConvergence,
            ScenarioId::LocalChi2Synthetic,
            ScenarioId::LocalChi2Pipeline,
        ]
    }

    pub fn name(&self) -> &'static str {
        match self {
            ScenarioId::PerfectTelescope => "perfect-telescope",
            ScenarioId::ShiftedSensor => "shifted-sensor",
            ScenarioId::ResidualsConvergence => "residuals-convergence",
            ScenarioId::LocalChi2Synthetic => "localchi2-synthetic",
            ScenarioId::LocalChi2Pipeline => "localchi2-pipeline",
        }
    }

    pub fn from_name(name: &str) -> Option<ScenarioId> {
        ScenarioId::all().into_iter().find(|s| s.name() == name)
    }
}

/// Outcome of a scenario run.
#[derive(Debug, Clone)]
pub struct ScenarioResult {
    pub scenario: ScenarioId,
    pub seed: u64,
    pub passed: bool,
    pub failures: Vec<String>,
    pub notes: Vec<String>,
}

impl ScenarioResult {
    fn new(scenario: ScenarioId, seed: u64) -> Self {
        Self {
            scenario,
            seed,
            passed: true,
            failures: Vec::new(),
            notes: Vec::new(),
        }
    }

    fn check(&mut self, condition: bool, message: impl Into<String>) {
        if !condition {
            self.passed = false;
            self.failures.push(message.into());
        }
    }

    fn note(&mut self, message: impl Into<String>) {
        self.notes.push(message.into());
    }
}

/// Runs scenarios with a fixed seed.
pub struct ScenarioRunner {
    seed: u64,
    num_events: u64,
}

impl ScenarioRunner {
    pub fn new(seed: u64) -> Self {
        Self {
            seed,
            num_events: 1000,
        }
    }

    pub fn with_events(mut self, num_events: u64) -> Self {
        self.num_events = num_events;
        self
    }

    pub fn run(&self, scenario: ScenarioId) -> ScenarioResult {
        info!("running scenario {} (seed={})", scenario.name(), self.seed);
        match scenario {
            ScenarioId::PerfectTelescope => self.run_perfect_telescope(),
            ScenarioId::ShiftedSensor => self.run_shifted_sensor(),
            ScenarioId::ResidualsConvergence => self.run_residuals_convergence(),
            ScenarioId::LocalChi2Synthetic => self.run_localchi2_synthetic(),
            ScenarioId::LocalChi2Pipeline => self.run_localchi2_pipeline(),
        }
    }

    /// Aligned three-plane telescope with one central track per event.
    fn run_perfect_telescope(&self) -> ScenarioResult {
        let mut result = ScenarioResult::new(ScenarioId::PerfectTelescope, self.seed);

        let device = telescope_device(&TelescopeConfig::default());
        let mut oracle = Oracle::new(
            self.seed,
            OracleConfig {
                beam_spot_std: 0.0,
                beam_divergence_std: 0.0,
                ..Default::default()
            },
        );
        let events = Arc::new(oracle.generate(&device, self.num_events));

        let summary = match reconstruct(&device, &events, &RunConfig::default()) {
            Ok(summary) => summary,
            Err(e) => {
                result.check(false, format!("reconstruction failed: {e}"));
                return result;
            }
        };
        result.note(format!("{} tracks", summary.tracks));
        result.check(
            summary.tracks == self.num_events,
            format!("expected {} tracks, found {}", self.num_events, summary.tracks),
        );
        result.check(
            summary.full_length_tracks == summary.tracks,
            "not every track has three clusters",
        );
        result.check(
            summary.mean_reduced_chi2 < 0.5,
            format!("mean chi2/dof {} too large", summary.mean_reduced_chi2),
        );

        // alignment of an already aligned telescope must not move it
        let align_cfg = AlignConfig {
            method: AlignMethod::LocalChi2,
            align_ids: vec![0, 1, 2],
            damping: 1.0,
            iterations: 1,
            ..Default::default()
        };
        match align(&device, &events, &RunConfig::default(), &align_cfg) {
            Ok(aligned) => {
                for sensor in 0..3 {
                    let before = device.geometry().plane(sensor).offset();
                    let after = aligned.geometry().plane(sensor).offset();
                    let moved = (after - before).norm();
                    result.check(
                        moved < 1e-3,
                        format!("sensor {sensor} moved by {moved} mm"),
                    );
                }
            }
            Err(e) => result.check(false, format!("alignment failed: {e}")),
        }
        result
    }

    /// A sensor shifted in the transverse plane is recovered by the
    /// correlation aligner with the first sensor fixed.
    fn run_shifted_sensor(&self) -> ScenarioResult {
        let mut result = ScenarioResult::new(ScenarioId::ShiftedSensor, self.seed);

        let nominal = telescope_device(&TelescopeConfig::default());
        let truth = with_shifted_sensor(&nominal, 1, 0.3, -0.2);
        let mut oracle = Oracle::new(
            self.seed,
            OracleConfig {
                beam_spot_std: 1.0,
                beam_divergence_std: 1e-4,
                ..Default::default()
            },
        );
        let events = Arc::new(oracle.generate(&truth, self.num_events));

        let align_cfg = AlignConfig {
            method: AlignMethod::Correlations,
            fixed_id: 0,
            align_ids: vec![1, 2],
            iterations: 1,
            ..Default::default()
        };
        let aligned = match align(&nominal, &events, &RunConfig::default(), &align_cfg) {
            Ok(aligned) => aligned,
            Err(e) => {
                result.check(false, format!("alignment failed: {e}"));
                return result;
            }
        };

        let pitch = 0.025;
        let offset1 = aligned.geometry().plane(1).offset();
        let offset2 = aligned.geometry().plane(2).offset();
        result.note(format!("recovered sensor 1 offset ({}, {})", offset1[0], offset1[1]));
        result.check(
            (offset1[0] - 0.3).abs() < pitch,
            format!("sensor 1 x offset {} not within one bin of 0.3", offset1[0]),
        );
        result.check(
            (offset1[1] + 0.2).abs() < pitch,
            format!("sensor 1 y offset {} not within one bin of -0.2", offset1[1]),
        );
        result.check(
            offset2[0].abs() < 2.0 * pitch && offset2[1].abs() < 2.0 * pitch,
            "sensor 2 should stay in place",
        );
        result
    }

    /// With damping 0.5 the residuals aligner approaches a known offset
    /// bias within a few iterations.
    fn run_residuals_convergence(&self) -> ScenarioResult {
        let mut result = ScenarioResult::new(ScenarioId::ResidualsConvergence, self.seed);

        let nominal = telescope_device(&TelescopeConfig::default());
        let truth = with_shifted_sensor(&nominal, 1, 0.08, 0.0);
        let mut oracle = Oracle::new(
            self.seed,
            OracleConfig {
                beam_spot_std: 1.0,
                beam_divergence_std: 1e-4,
                measurement_noise_std: 0.002,
                ..Default::default()
            },
        );
        let events = Arc::new(oracle.generate(&truth, self.num_events));

        let align_cfg = AlignConfig {
            method: AlignMethod::Residuals,
            align_ids: vec![1],
            damping: 0.5,
            iterations: 5,
            ..Default::default()
        };
        let aligned = match align(&nominal, &events, &RunConfig::default(), &align_cfg) {
            Ok(aligned) => aligned,
            Err(e) => {
                result.check(false, format!("alignment failed: {e}"));
                return result;
            }
        };

        let offset = aligned.geometry().plane(1).offset();
        result.note(format!("recovered sensor 1 offset x = {}", offset[0]));
        result.check(
            (offset[0] - 0.08).abs() < 0.01,
            format!("offset x {} did not converge to 0.08", offset[0]),
        );
        result.check(
            offset[1].abs() < 0.01,
            format!("offset y {} should stay near zero", offset[1]),
        );
        result
    }

    /// The plane fitter recovers du and dgamma from a noisy synthetic
    /// sample, without the reconstruction chain.
    fn run_localchi2_synthetic(&self) -> ScenarioResult {
        let mut result = ScenarioResult::new(ScenarioId::LocalChi2Synthetic, self.seed);

        // injected misalignment: 50 um offset and 1 mrad rotation
        let truth = Vector6::new(0.05, 0.0, 0.0, 0.0, 0.0, 1e-3);
        let sigma = 0.005;
        let num_tracks = 500;

        let mut rng = ChaCha8Rng::seed_from_u64(self.seed);
        let noise = Normal::new(0.0, sigma).unwrap();
        let weight = Matrix2::identity() / (sigma * sigma);

        let mut fitter = LocalChi2PlaneFitter::default();
        for _ in 0..num_tracks {
            let u = rng.gen_range(-8.0..8.0);
            let v = rng.gen_range(-8.0..8.0);
            let slope_u = 2e-3 * rng.gen_range(-1.0..1.0);
            let slope_v = 2e-3 * rng.gen_range(-1.0..1.0);
            let state = TrackState::new(u, v, slope_u, slope_v);

            // residuals consistent with the plane needing the correction:
            // res0 = J a, with the offset and rotation rows of the Jacobian
            let res_u = -truth[0] + truth[5] * v;
            let res_v = -truth[1] - truth[5] * u;
            let mut cluster = Cluster::new(0.0, 0.0, 0.0, 1.0, 1.0, 1.0, 0.0, 0.0);
            cluster.set_local(
                Vector4::new(
                    u + res_u + noise.sample(&mut rng),
                    v + res_v + noise.sample(&mut rng),
                    0.0,
                    0.0,
                ),
                Matrix4::zeros(),
            );
            fitter.add_track(&state, &cluster, &weight);
        }

        let Some((a, _cov, rank)) = fitter.minimize() else {
            result.check(false, "solver failed");
            return result;
        };
        result.note(format!(
            "recovered du = {:.2} um, dgamma = {:.3} mrad (rank {})",
            1e3 * a[0],
            1e3 * a[5],
            rank
        ));
        result.check(
            (0.047..=0.053).contains(&a[0]),
            format!("du {} outside [47, 53] um", a[0]),
        );
        result.check(
            (0.9e-3..=1.1e-3).contains(&a[5]),
            format!("dgamma {} outside [0.9, 1.1] mrad", a[5]),
        );
        result
    }

    /// The full pipeline recovers a local misalignment of one sensor.
    fn run_localchi2_pipeline(&self) -> ScenarioResult {
        let mut result = ScenarioResult::new(ScenarioId::LocalChi2Pipeline, self.seed);

        let nominal = telescope_device(&TelescopeConfig::default());
        let delta = Vector6::new(0.05, -0.03, 0.0, 0.0, 0.0, 0.01);
        let truth = with_local_misalignment(&nominal, 1, &delta);
        let mut oracle = Oracle::new(
            self.seed,
            OracleConfig {
                beam_spot_std: 1.5,
                beam_divergence_std: 1e-4,
                measurement_noise_std: 0.002,
                ..Default::default()
            },
        );
        let events = Arc::new(oracle.generate(&truth, self.num_events.max(1500)));

        let align_cfg = AlignConfig {
            method: AlignMethod::LocalChi2,
            align_ids: vec![1],
            damping: 0.9,
            iterations: 4,
            ..Default::default()
        };
        let aligned = match align(&nominal, &events, &RunConfig::default(), &align_cfg) {
            Ok(aligned) => aligned,
            Err(e) => {
                result.check(false, format!("alignment failed: {e}"));
                return result;
            }
        };

        let offset_error = (aligned.geometry().plane(1).offset()
            - truth.geometry().plane(1).offset())
        .norm();
        let rotation_error = (aligned.geometry().plane(1).rotation()
            - truth.geometry().plane(1).rotation())
        .norm();
        result.note(format!(
            "offset error {:.2} um, rotation error {:.2e}",
            1e3 * offset_error,
            rotation_error
        ));
        result.check(
            offset_error < 0.01,
            format!("offset error {offset_error} mm too large"),
        );
        result.check(
            rotation_error < 2e-3,
            format!("rotation error {rotation_error} too large"),
        );
        result
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn assert_passes(scenario: ScenarioId) {
        let result = ScenarioRunner::new(12345).run(scenario);
        assert!(
            result.passed,
            "scenario {} failed: {:?}",
            scenario.name(),
            result.failures
        );
    }

    #[test]
    fn perfect_telescope_passes() {
        assert_passes(ScenarioId::PerfectTelescope);
    }

    #[test]
    fn shifted_sensor_passes() {
        assert_passes(ScenarioId::ShiftedSensor);
    }

    #[test]
    fn residuals_convergence_passes() {
        assert_passes(ScenarioId::ResidualsConvergence);
    }

    #[test]
    fn localchi2_synthetic_passes() {
        assert_passes(ScenarioId::LocalChi2Synthetic);
    }

    #[test]
    fn localchi2_pipeline_passes() {
        assert_passes(ScenarioId::LocalChi2Pipeline);
    }

    #[test]
    fn scenario_names_round_trip() {
        for scenario in ScenarioId::all() {
            assert_eq!(ScenarioId::from_name(scenario.name()), Some(scenario));
        }
        assert_eq!(ScenarioId::from_name("unknown"), None);
    }
}
