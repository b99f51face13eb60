//! Sensor alignment in the local plane from track residual histograms.

use std::sync::Arc;

use nalgebra::{Matrix6, Vector3, Vector6};
use tracing::info;

use crate::config::Device;
use crate::error::Error;
use crate::event::Event;
use crate::geometry::Geometry;
use crate::histogram::{Hist1, HistAxis};
use crate::pipeline::{Aligner, Analyzer};

// how many bins around the peak enter the means
const BINS_RESTRICTED: usize = 5;

struct SensorHists {
    sensor_id: usize,
    corr_u: Hist1,
    corr_v: Hist1,
    corr_gamma: Hist1,
}

/// Estimates in-plane offset and rotation corrections per sensor.
///
/// For every track-cluster pair the three correction parameters that the
/// residuals constrain are computed in closed form and histogrammed; the
/// applied correction is the restricted mean of each histogram.
pub struct ResidualsAligner {
    device: Arc<Device>,
    damping: f64,
    hists: Vec<SensorHists>,
}

impl ResidualsAligner {
    /// * `damping` scale for the applied corrections, avoids oscillations
    /// * `pixel_range` offset histogram half-range in pixel pitches
    /// * `gamma_range` rotation histogram half-range in radian
    /// * `bins` number of histogram bins
    pub fn new(
        device: Arc<Device>,
        align_ids: &[usize],
        damping: f64,
        pixel_range: f64,
        gamma_range: f64,
        bins: usize,
    ) -> Result<Self, Error> {
        if (damping <= 0.0) || (1.0 < damping) {
            return Err(Error::config("damping must be in (0, 1]"));
        }
        let mut hists = Vec::with_capacity(align_ids.len());
        for &sensor_id in align_ids {
            let sensor = device.sensor(sensor_id);
            let offset_range = pixel_range * sensor.pitch_col().hypot(sensor.pitch_row());
            hists.push(SensorHists {
                sensor_id,
                corr_u: Hist1::new(HistAxis::new(
                    -offset_range,
                    offset_range,
                    bins,
                    "Local offset u correction",
                )),
                corr_v: Hist1::new(HistAxis::new(
                    -offset_range,
                    offset_range,
                    bins,
                    "Local offset v correction",
                )),
                corr_gamma: Hist1::new(HistAxis::new(
                    -gamma_range,
                    gamma_range,
                    bins,
                    "Local rotation gamma correction",
                )),
            });
        }
        Ok(Self {
            device,
            damping,
            hists,
        })
    }
}

impl Analyzer for ResidualsAligner {
    fn name(&self) -> &str {
        "ResidualsAligner"
    }

    fn execute(&mut self, event: &Event) -> Result<(), Error> {
        for hists in self.hists.iter_mut() {
            let sensor_event = event.sensor_event(hists.sensor_id);

            for icluster in 0..sensor_event.num_clusters() {
                let cluster = sensor_event.cluster(icluster);
                let Some(itrack) = cluster.track() else {
                    continue;
                };
                let Some(state) = sensor_event.local_state(itrack) else {
                    continue;
                };

                let u = state.loc0();
                let v = state.loc1();
                let ru = cluster.u() - u;
                let rv = cluster.v() - v;
                // without measurement uncertainties the residuals are fully
                // described by the three in-plane corrections as
                //
                //     res_u = -du + dgamma * v
                //     res_v = -dv - dgamma * u
                //
                // inverting this underdetermined system with the
                // pseudo-inverse yields per-track corrections as a function
                // of the residuals and the track position
                let f = 1.0 + u * u + v * v;
                let du = -(ru + ru * u * u + rv * u * v) / f;
                let dv = -(rv + rv * v * v + ru * u * v) / f;
                let dgamma = (ru * v - rv * u) / f;

                hists.corr_u.fill(du);
                hists.corr_v.fill(dv);
                hists.corr_gamma.fill(dgamma);
            }
        }
        Ok(())
    }
}

impl Aligner for ResidualsAligner {
    fn updated_geometry(&self) -> Result<Geometry, Error> {
        let mut geo = self.device.geometry().clone();

        for hists in self.hists.iter() {
            let sensor = self.device.sensor(hists.sensor_id);
            let failed = |what: &str| Error::AlignmentFailed {
                sensor: hists.sensor_id,
                reason: format!("empty {what} correction histogram"),
            };
            let (du, var_du) = hists
                .corr_u
                .restricted_mean(BINS_RESTRICTED)
                .ok_or_else(|| failed("u"))?;
            let (dv, var_dv) = hists
                .corr_v
                .restricted_mean(BINS_RESTRICTED)
                .ok_or_else(|| failed("v"))?;
            let (dgamma, var_dgamma) = hists
                .corr_gamma
                .restricted_mean(BINS_RESTRICTED)
                .ok_or_else(|| failed("gamma"))?;

            // enforce a vanishing global z movement: transform the local
            // offset to the global frame, zero its z component, and go back
            let plane = geo.plane(hists.sensor_id);
            let mut offset_global = plane.linear_to_global(&Vector3::new(du, dv, 0.0));
            offset_global[2] = 0.0;
            let offset_local = plane.linear_to_local(&offset_global);

            let mut delta = Vector6::zeros();
            delta[0] = self.damping * offset_local[0];
            delta[1] = self.damping * offset_local[1];
            delta[2] = self.damping * offset_local[2];
            delta[5] = self.damping * dgamma;
            let mut cov = Matrix6::zeros();
            cov[(0, 0)] = var_du;
            cov[(1, 1)] = var_dv;
            cov[(5, 5)] = var_dgamma;
            geo.correct_local(hists.sensor_id, &delta, &cov);

            info!("{} alignment corrections:", sensor.name());
            info!("  du: {:.4e} +- {:.4e}", delta[0], var_du.sqrt());
            info!("  dv: {:.4e} +- {:.4e}", delta[1], var_dv.sqrt());
            info!("  dw: {:.4e} (dz=0 enforced)", delta[2]);
            info!(
                "  dgamma: {:.4e} +- {:.4e} rad",
                delta[5],
                var_dgamma.sqrt()
            );
        }
        Ok(geo)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{DeviceConfig, GeometryConfig, PlaneConfig, SensorConfig};
    use crate::event::{Cluster, Track, TrackState};
    use approx::assert_abs_diff_eq;
    use nalgebra::{Matrix4, Vector4};

    fn device() -> Arc<Device> {
        let cfg = DeviceConfig {
            name: "test".into(),
            beam: Default::default(),
            sensors: vec![SensorConfig {
                id: 0,
                name: "dut".into(),
                measurement: "pixel_binary".into(),
                num_cols: 256,
                num_rows: 256,
                timestamp_range: [0, 16],
                pitch_col: 0.025,
                pitch_row: 0.025,
                pitch_timestamp: 1.0,
                thickness: 0.0,
                x_x0: 0.0,
                regions: vec![],
                masked_pixels: vec![],
            }],
        };
        let geo = GeometryConfig {
            planes: vec![PlaneConfig {
                sensor: 0,
                offset: [0.0; 3],
                rotation: [0.0; 3],
            }],
        };
        Arc::new(cfg.build(&geo).unwrap())
    }

    fn feed_residual_events(aligner: &mut ResidualsAligner, bias_u: f64, positions: &[(f64, f64)]) {
        for (frame, &(u, v)) in positions.iter().enumerate() {
            let mut event = Event::new(1);
            event.clear(frame as u64, 0);
            let mut cluster = Cluster::new(0.0, 0.0, 0.0, 1.0, 1.0, 1.0, 0.0, 0.0);
            let cov = Matrix4::zeros();
            // the measured cluster sits at the track position plus the bias
            cluster.set_local(Vector4::new(u + bias_u, v, 0.0, 0.0), cov);
            cluster.set_global(Vector4::new(u + bias_u, v, 0.0, 0.0), cov);
            let icluster = event.sensor_event_mut(0).add_cluster(cluster);
            let mut track = Track::new();
            track.add_cluster(0, icluster);
            let itrack = event.add_track(track);
            event
                .sensor_event_mut(0)
                .set_local_state(itrack, TrackState::new(u, v, 0.0, 0.0));
            aligner.execute(&event).unwrap();
        }
    }

    #[test]
    fn damping_is_validated() {
        let device = device();
        assert!(ResidualsAligner::new(device.clone(), &[0], 0.0, 2.0, 0.1, 101).is_err());
        assert!(ResidualsAligner::new(device.clone(), &[0], 1.5, 2.0, 0.1, 101).is_err());
        assert!(ResidualsAligner::new(device, &[0], 0.5, 2.0, 0.1, 101).is_ok());
    }

    #[test]
    fn constant_offset_bias_is_recovered() {
        let device = device();
        let mut aligner = ResidualsAligner::new(device, &[0], 1.0, 2.0, 0.1, 101).unwrap();

        // tracks near the plane center, all residuals show the same bias
        let positions: Vec<(f64, f64)> = (0..100)
            .map(|i| (0.01 * ((i % 10) as f64 - 4.5), 0.01 * ((i / 10) as f64 - 4.5)))
            .collect();
        feed_residual_events(&mut aligner, 0.01, &positions);

        let geo = aligner.updated_geometry().unwrap();
        // the correction moves the plane towards the measurements
        let bin = aligner.hists[0].corr_u.axis().bin_width();
        assert_abs_diff_eq!(geo.plane(0).offset()[0], -0.01, epsilon = 2.0 * bin);
        assert_abs_diff_eq!(geo.plane(0).offset()[1], 0.0, epsilon = 2.0 * bin);
        // no z movement
        assert_abs_diff_eq!(geo.plane(0).offset()[2], 0.0, epsilon = 1e-12);
    }

    #[test]
    fn empty_histograms_fail_the_alignment() {
        let device = device();
        let aligner = ResidualsAligner::new(device, &[0], 1.0, 2.0, 0.1, 101).unwrap();
        assert!(matches!(
            aligner.updated_geometry(),
            Err(Error::AlignmentFailed { .. })
        ));
    }
}
