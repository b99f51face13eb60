//! Six-parameter sensor alignment from a local chi^2 minimization.
//!
//! For every aligned sensor the track residuals are linearized in the
//! alignment parameters a = [du, dv, dw, dalpha, dbeta, dgamma],
//!
//!     res = (m - q0) - J a
//!
//! and the least-squares normal equations F a = y with F = sum J^T W J and
//! y = sum J^T W (m - q0) are accumulated over all tracks. The solve uses
//! a singular value decomposition that drops weak modes instead of
//! requiring explicit regularization.

use std::sync::Arc;

use nalgebra::{Matrix2, Matrix2x6, Matrix6, Vector6};
use tracing::{debug, error, info};

use crate::config::Device;
use crate::error::Error;
use crate::event::{Cluster, Event, TrackState};
use crate::geometry::Geometry;
use crate::pipeline::{Aligner, Analyzer};

// Map [du, dv, dw, dalpha, dbeta, dgamma] to track offset changes.
//
// Assumes the track stays constant in the global frame and the alignment
// corrections move the intersection point. The signs follow the
// convention used by `Geometry::correct_local`.
fn jacobian_offset_alignment(state: &TrackState) -> Matrix2x6<f64> {
    let offset_u = state.loc0();
    let offset_v = state.loc1();
    let slope_u = state.slope_loc0();
    let slope_v = state.slope_loc1();

    let mut jac = Matrix2x6::zeros();
    jac[(0, 0)] = -1.0; // du/ddu
    jac[(0, 2)] = slope_u; // du/ddw
    jac[(0, 3)] = slope_u * offset_v; // du/ddalpha
    jac[(0, 4)] = -slope_u * offset_u; // du/ddbeta
    jac[(0, 5)] = offset_v; // du/ddgamma
    jac[(1, 1)] = -1.0; // dv/ddv
    jac[(1, 2)] = slope_v; // dv/ddw
    jac[(1, 3)] = slope_v * offset_v; // dv/ddalpha
    jac[(1, 4)] = -slope_v * offset_u; // dv/ddbeta
    jac[(1, 5)] = -offset_u; // dv/ddgamma
    jac
}

/// Accumulates the alignment normal equations for one sensor plane.
#[derive(Debug, Clone, Default)]
pub struct LocalChi2PlaneFitter {
    fr: Matrix6<f64>,
    y: Vector6<f64>,
    num_tracks: usize,
}

impl LocalChi2PlaneFitter {
    /// Add one track-measurement pair.
    ///
    /// Returns false if any input is non-finite; such pairs would corrupt
    /// the normal equations and are not added.
    pub fn add_track(
        &mut self,
        state: &TrackState,
        measurement: &Cluster,
        weight: &Matrix2<f64>,
    ) -> bool {
        let inputs = [
            state.loc0(),
            state.loc1(),
            state.slope_loc0(),
            state.slope_loc1(),
            measurement.u(),
            measurement.v(),
            weight[(0, 0)],
            weight[(0, 1)],
            weight[(1, 0)],
            weight[(1, 1)],
        ];
        if !inputs.iter().all(|x| x.is_finite()) {
            return false;
        }

        let jac = jacobian_offset_alignment(state);
        let res0 = nalgebra::Vector2::new(
            measurement.u() - state.loc0(),
            measurement.v() - state.loc1(),
        );
        self.fr += jac.transpose() * weight * jac;
        self.y += jac.transpose() * weight * res0;
        self.num_tracks += 1;
        true
    }

    /// Number of accumulated pairs.
    pub fn num_tracks(&self) -> usize {
        self.num_tracks
    }

    /// Solve for the alignment parameters and their covariance.
    ///
    /// Singular values below 4096 times the machine precision, relative to
    /// the largest singular value, are treated as zero; at least two
    /// effective parameters are required.
    pub fn minimize(&self) -> Option<(Vector6<f64>, Matrix6<f64>, usize)> {
        debug!("num tracks: {}", self.num_tracks);

        let svd = self.fr.svd(true, true);
        // the default epsilon-sized threshold is not large enough to
        // suppress weak modes when angles and lengths mix scales
        let threshold = 4096.0 * f64::EPSILON * svd.singular_values.max();
        let rank = svd.rank(threshold);

        let a = svd.solve(&self.y, threshold).ok()?;
        let cov = svd.solve(&Matrix6::identity(), threshold).ok()?;

        // at least two effective parameters are expected
        if rank < 2 {
            return None;
        }
        Some((a, cov, rank))
    }
}

/// Aligns sensors by minimizing local track residuals.
pub struct LocalChi2Aligner {
    device: Arc<Device>,
    damping: f64,
    fitters: Vec<(usize, LocalChi2PlaneFitter)>,
}

impl LocalChi2Aligner {
    /// * `damping` scale for the applied corrections, avoids oscillations
    pub fn new(device: Arc<Device>, align_ids: &[usize], damping: f64) -> Result<Self, Error> {
        if (damping <= 0.0) || (1.0 < damping) {
            return Err(Error::config("damping must be in (0, 1]"));
        }
        let fitters = align_ids
            .iter()
            .map(|&id| (id, LocalChi2PlaneFitter::default()))
            .collect();
        Ok(Self {
            device,
            damping,
            fitters,
        })
    }
}

impl Analyzer for LocalChi2Aligner {
    fn name(&self) -> &str {
        "LocalChi2Aligner"
    }

    fn execute(&mut self, event: &Event) -> Result<(), Error> {
        for (sensor_id, fitter) in self.fitters.iter_mut() {
            let sensor_event = event.sensor_event(*sensor_id);

            for icluster in 0..sensor_event.num_clusters() {
                let cluster = sensor_event.cluster(icluster);
                let Some(itrack) = cluster.track() else {
                    continue;
                };
                let Some(state) = sensor_event.local_state(itrack) else {
                    continue;
                };

                // unbiased residuals carry both the cluster and the
                // tracking uncertainty
                let cov = cluster.uv_cov() + state.location_cov();
                let Some(weight) = cov.try_inverse() else {
                    error!(
                        "singular residual covariance event={} sensor={} track={}",
                        event.frame(),
                        sensor_id,
                        itrack
                    );
                    continue;
                };
                if !fitter.add_track(state, cluster, &weight) {
                    error!(
                        "invalid track/cluster input event={} sensor={} track={}",
                        event.frame(),
                        sensor_id,
                        itrack
                    );
                }
            }
        }
        Ok(())
    }
}

impl Aligner for LocalChi2Aligner {
    fn updated_geometry(&self) -> Result<Geometry, Error> {
        let mut geo = self.device.geometry().clone();

        for (sensor_id, fitter) in self.fitters.iter() {
            let sensor = self.device.sensor(*sensor_id);

            let Some((mut delta, cov, rank)) = fitter.minimize() else {
                return Err(Error::AlignmentFailed {
                    sensor: *sensor_id,
                    reason: format!(
                        "could not solve the alignment equations ({} tracks)",
                        fitter.num_tracks()
                    ),
                });
            };
            delta *= self.damping;

            info!(
                "{} alignment corrections (rank {}):",
                sensor.name(),
                rank
            );
            info!("  du: {:.4e} +- {:.4e}", delta[0], cov[(0, 0)].sqrt());
            info!("  dv: {:.4e} +- {:.4e}", delta[1], cov[(1, 1)].sqrt());
            info!("  dw: {:.4e} +- {:.4e}", delta[2], cov[(2, 2)].sqrt());
            info!(
                "  dalpha: {:.4e} +- {:.4e} deg",
                delta[3].to_degrees(),
                cov[(3, 3)].sqrt().to_degrees()
            );
            info!(
                "  dbeta: {:.4e} +- {:.4e} deg",
                delta[4].to_degrees(),
                cov[(4, 4)].sqrt().to_degrees()
            );
            info!(
                "  dgamma: {:.4e} +- {:.4e} deg",
                delta[5].to_degrees(),
                cov[(5, 5)].sqrt().to_degrees()
            );

            geo.correct_local(*sensor_id, &delta, &cov);
        }
        Ok(geo)
    }
}
