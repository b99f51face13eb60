//! Straight-line track fitting.
//!
//! Tracks are fitted as two independent weighted linear regressions with
//! the longitudinal coordinate as the independent variable, either in the
//! global frame or in the local frame of a reference sensor. The
//! `StraightFitter` processor derives per-sensor unbiased local states for
//! every track in the event.

use std::sync::Arc;

use nalgebra::{Matrix3, Vector3};

use crate::config::Device;
use crate::error::Error;
use crate::event::{Event, TrackState};
use crate::geometry::Geometry;
use crate::pipeline::Processor;

/// Linear weighted regression in one dimension.
///
/// Straight from Numerical Recipes with offset = a and slope = b.
#[derive(Debug, Clone, Copy, Default)]
pub struct LineFitter1d {
    s: f64,
    sx: f64,
    sy: f64,
    sxx: f64,
    sxy: f64,
    syy: f64,
    // (unscaled) input variance, set by fit()
    cxx: f64,
}

impl LineFitter1d {
    pub fn add_point(&mut self, x: f64, y: f64, w: f64) {
        self.s += w;
        self.sx += w * x;
        self.sy += w * y;
        self.sxx += w * x * x;
        self.sxy += w * x * y;
        self.syy += w * y * y;
    }

    pub fn fit(&mut self) {
        self.cxx = self.s * self.sxx - self.sx * self.sx;
    }

    fn scaled(&self, numerator: f64) -> f64 {
        if self.cxx == 0.0 {
            f64::NAN
        } else {
            numerator / self.cxx
        }
    }

    pub fn offset(&self) -> f64 {
        self.scaled(self.sy * self.sxx - self.sx * self.sxy)
    }

    pub fn slope(&self) -> f64 {
        self.scaled(self.s * self.sxy - self.sx * self.sy)
    }

    pub fn var_offset(&self) -> f64 {
        self.scaled(self.sxx)
    }

    pub fn var_slope(&self) -> f64 {
        self.scaled(self.s)
    }

    pub fn cov(&self) -> f64 {
        self.scaled(-self.sx)
    }

    pub fn chi2(&self) -> f64 {
        self.syy
            + self.scaled(self.sxy * (2.0 * self.sx * self.sy - self.s * self.sxy)
                - self.sxx * self.sy * self.sy)
    }
}

/// Straight-line fit in three dimensions, assuming propagation along the
/// third coordinate and uncorrelated transverse uncertainties.
#[derive(Debug, Clone, Copy, Default)]
pub struct StraightFitter3d {
    line0: LineFitter1d,
    line1: LineFitter1d,
}

impl StraightFitter3d {
    /// Add a point (t0, t1, longitudinal) with transverse weights.
    pub fn add_point(&mut self, t0: f64, t1: f64, longitudinal: f64, w0: f64, w1: f64) {
        self.line0.add_point(longitudinal, t0, w0);
        self.line1.add_point(longitudinal, t1, w1);
    }

    pub fn fit(&mut self) {
        self.line0.fit();
        self.line1.fit();
    }

    /// The fitted state with offsets, slopes, and their covariances.
    pub fn state(&self) -> TrackState {
        let mut state = TrackState::new(
            self.line0.offset(),
            self.line1.offset(),
            self.line0.slope(),
            self.line1.slope(),
        );
        state.set_cov_u(self.line0.var_offset(), self.line0.var_slope(), self.line0.cov());
        state.set_cov_v(self.line1.var_offset(), self.line1.var_slope(), self.line1.cov());
        state
    }

    pub fn chi2(&self) -> f64 {
        self.line0.chi2() + self.line1.chi2()
    }
}

/// Fit the track as a straight line in the global frame.
///
/// Weights are the inverse diagonal transverse variances; the small
/// off-diagonal covariance term is ignored. The track's global state and
/// goodness of fit are overwritten with the result.
pub fn fit_track_global(event: &Event, track: &mut crate::event::Track) {
    let mut fitter = StraightFitter3d::default();
    for &(sensor, icluster) in track.clusters() {
        let cluster = event.sensor_event(sensor).cluster(icluster);
        let pos = cluster.position_global();
        let cov = cluster.cov_global();
        fitter.add_point(pos[0], pos[1], pos[2], 1.0 / cov[(0, 0)], 1.0 / cov[(1, 1)]);
    }
    fitter.fit();
    let dof = 2 * (track.size() as i32 - 2);
    track.set_global_state(fitter.state());
    track.set_goodness_of_fit(fitter.chi2(), dof);
}

fn add_cluster_in_reference(
    fitter: &mut StraightFitter3d,
    event: &Event,
    ref_rotation_t: &Matrix3<f64>,
    ref_offset: &Vector3<f64>,
    sensor: usize,
    icluster: usize,
) {
    let cluster = event.sensor_event(sensor).cluster(icluster);
    let global = cluster.position_global();
    let pos = ref_rotation_t * (Vector3::new(global[0], global[1], global[2]) - ref_offset);
    let cov3 = cluster.cov_global().fixed_view::<3, 3>(0, 0).into_owned();
    let cov = ref_rotation_t * cov3 * ref_rotation_t.transpose();
    fitter.add_point(pos[0], pos[1], pos[2], 1.0 / cov[(0, 0)], 1.0 / cov[(1, 1)]);
}

/// Fit the track in the local frame of a reference sensor.
pub fn fit_track_local(
    event: &Event,
    itrack: usize,
    geometry: &Geometry,
    reference_id: usize,
) -> TrackState {
    fit_local_impl(event, itrack, geometry, reference_id, false)
}

/// Fit the track in the local frame of a reference sensor, ignoring the
/// measurement on the reference sensor itself.
pub fn fit_track_local_unbiased(
    event: &Event,
    itrack: usize,
    geometry: &Geometry,
    reference_id: usize,
) -> TrackState {
    fit_local_impl(event, itrack, geometry, reference_id, true)
}

fn fit_local_impl(
    event: &Event,
    itrack: usize,
    geometry: &Geometry,
    reference_id: usize,
    unbiased: bool,
) -> TrackState {
    let plane = geometry.plane(reference_id);
    let rotation_t = plane.rotation().transpose();
    let offset = *plane.offset();

    let mut fitter = StraightFitter3d::default();
    for &(sensor, icluster) in event.track(itrack).clusters() {
        if unbiased && (sensor == reference_id) {
            continue;
        }
        add_cluster_in_reference(&mut fitter, event, &rotation_t, &offset, sensor, icluster);
    }
    fitter.fit();
    fitter.state()
}

/// Computes unbiased local track states on every sensor.
///
/// Runs after the track finder; the matcher, the residual analyzer, and
/// the local aligners consume the states stored here.
pub struct StraightFitter {
    device: Arc<Device>,
}

impl StraightFitter {
    pub fn new(device: Arc<Device>) -> Self {
        Self { device }
    }
}

impl Processor for StraightFitter {
    fn name(&self) -> &str {
        "StraightFitter"
    }

    fn execute(&self, event: &mut Event) -> Result<(), Error> {
        let geometry = self.device.geometry();
        for itrack in 0..event.num_tracks() {
            if !event.track(itrack).has_global_state() {
                let mut track = event.track(itrack).clone();
                fit_track_global(event, &mut track);
                *event.track_mut(itrack) = track;
            }
            for sensor_id in 0..self.device.num_sensors() {
                let state = fit_track_local_unbiased(event, itrack, geometry, sensor_id);
                event.sensor_event_mut(sensor_id).set_local_state(itrack, state);
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::event::{Cluster, Track};
    use approx::{assert_abs_diff_eq, assert_relative_eq};
    use nalgebra::{Matrix4, Vector4};

    fn event_with_line(
        zs: &[f64],
        offset: (f64, f64),
        slope: (f64, f64),
        var: f64,
    ) -> (Event, Track) {
        let mut event = Event::new(zs.len());
        event.clear(0, 0);
        let mut track = Track::new();
        for (sensor, &z) in zs.iter().enumerate() {
            let x = offset.0 + slope.0 * z;
            let y = offset.1 + slope.1 * z;
            let mut cluster = Cluster::new(0.0, 0.0, 0.0, 1.0, var, var, 0.0, 0.0);
            let mut cov = Matrix4::zeros();
            cov[(0, 0)] = var;
            cov[(1, 1)] = var;
            cluster.set_local(Vector4::new(x, y, 0.0, 0.0), cov);
            cluster.set_global(Vector4::new(x, y, z, 0.0), cov);
            let icluster = event.sensor_event_mut(sensor).add_cluster(cluster);
            track.add_cluster(sensor, icluster);
        }
        (event, track)
    }

    #[test]
    fn exact_line_is_recovered_with_zero_chi2() {
        let (event, mut track) = event_with_line(
            &[0.0, 50.0, 100.0],
            (1.0, -2.0),
            (0.01, -0.02),
            1e-4,
        );
        fit_track_global(&event, &mut track);

        let state = track.global_state();
        assert_abs_diff_eq!(state.loc0(), 1.0, epsilon = 1e-9);
        assert_abs_diff_eq!(state.loc1(), -2.0, epsilon = 1e-9);
        assert_abs_diff_eq!(state.slope_loc0(), 0.01, epsilon = 1e-12);
        assert_abs_diff_eq!(state.slope_loc1(), -0.02, epsilon = 1e-12);
        assert_abs_diff_eq!(track.chi2(), 0.0, epsilon = 1e-9);
        assert_eq!(track.degrees_of_freedom(), 2);
    }

    #[test]
    fn fit_is_idempotent_on_its_own_prediction() {
        let zs = [0.0, 30.0, 70.0, 100.0];
        let (mut event, mut track) = event_with_line(&zs, (0.5, 0.25), (-0.003, 0.007), 1e-4);
        // perturb the measurements so the first fit is not exact
        for (sensor, &z) in zs.iter().enumerate() {
            let wiggle = if sensor % 2 == 0 { 2e-3 } else { -3e-3 };
            let pos = *event.sensor_event(sensor).cluster(0).position_global();
            let cov = *event.sensor_event(sensor).cluster(0).cov_global();
            event
                .sensor_event_mut(sensor)
                .cluster_mut(0)
                .set_global(Vector4::new(pos[0] + wiggle, pos[1] - wiggle, z, 0.0), cov);
        }
        let mut track2 = track.clone();
        fit_track_global(&event, &mut track);
        let first = *track.global_state().params();

        // sample the fitted line back onto the planes and refit
        for (sensor, &z) in zs.iter().enumerate() {
            let x = first[0] + first[3] * z;
            let y = first[1] + first[4] * z;
            let cov = *event.sensor_event(sensor).cluster(0).cov_global();
            event
                .sensor_event_mut(sensor)
                .cluster_mut(0)
                .set_global(Vector4::new(x, y, z, 0.0), cov);
        }
        fit_track_global(&event, &mut track2);
        let second = *track2.global_state().params();
        for i in 0..6 {
            if first[i] != 0.0 {
                assert_relative_eq!(first[i], second[i], max_relative = 1e-9);
            }
        }
    }

    #[test]
    fn degenerate_longitudinal_positions_yield_nan() {
        let (event, mut track) = event_with_line(&[50.0, 50.0], (1.0, 1.0), (0.0, 0.0), 1e-4);
        fit_track_global(&event, &mut track);
        assert!(track.global_state().loc0().is_nan());
        assert!(track.global_state().slope_loc0().is_nan());
    }

    #[test]
    fn unbiased_local_fit_ignores_the_reference_measurement() {
        let (mut event, track) = event_with_line(
            &[0.0, 50.0, 100.0],
            (0.0, 0.0),
            (0.0, 0.0),
            1e-4,
        );
        let itrack = {
            let mut t = track.clone();
            fit_track_global(&event, &mut t);
            event.add_track(t)
        };
        // shift the measurement on the reference sensor far away
        let mut cov = Matrix4::zeros();
        cov[(0, 0)] = 1e-4;
        cov[(1, 1)] = 1e-4;
        event
            .sensor_event_mut(1)
            .cluster_mut(0)
            .set_global(Vector4::new(5.0, 5.0, 50.0, 0.0), cov);

        let geometry = Geometry::new(
            vec![
                crate::geometry::Plane::from_angles(Vector3::new(0.0, 0.0, 0.0), 0.0, 0.0, 0.0),
                crate::geometry::Plane::from_angles(Vector3::new(0.0, 0.0, 50.0), 0.0, 0.0, 0.0),
                crate::geometry::Plane::from_angles(Vector3::new(0.0, 0.0, 100.0), 0.0, 0.0, 0.0),
            ],
            Vector3::new(0.0, 0.0, 1.0),
            nalgebra::Matrix2::zeros(),
        );

        let biased = fit_track_local(&event, itrack, &geometry, 1);
        let unbiased = fit_track_local_unbiased(&event, itrack, &geometry, 1);
        // the biased fit is pulled towards the outlier, the unbiased is not
        assert!(0.1 < biased.loc0().abs());
        assert_abs_diff_eq!(unbiased.loc0(), 0.0, epsilon = 1e-9);
        assert_abs_diff_eq!(unbiased.loc1(), 0.0, epsilon = 1e-9);
    }
}
