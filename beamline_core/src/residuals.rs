//! Cluster-track residual distributions per sensor.

use std::collections::BTreeMap;
use std::sync::Arc;

use tracing::info;

use crate::config::Device;
use crate::error::Error;
use crate::event::{Cluster, Event, TrackState};
use crate::geometry::mahalanobis_squared;
use crate::histogram::{Hist1, Hist2, HistAxis};
use crate::pipeline::Analyzer;

/// The histogram set of a single sensor.
pub struct SensorResidualHists {
    pub res_u: Hist1,
    pub res_v: Hist1,
    pub res_s: Hist1,
    pub res_uv: Hist2,
    pub res_dist: Hist1,
    pub res_d2: Hist1,
    pub pos_u_res_u: Hist2,
    pub pos_u_res_v: Hist2,
    pub pos_v_res_u: Hist2,
    pub pos_v_res_v: Hist2,
    pub time_res_u: Hist2,
    pub time_res_v: Hist2,
    pub slope_u_res_u: Hist2,
    pub slope_u_res_v: Hist2,
    pub slope_v_res_u: Hist2,
    pub slope_v_res_v: Hist2,
}

impl SensorResidualHists {
    fn new(device: &Device, sensor_id: usize, range_std: f64, bins: usize) -> Self {
        let sensor = device.sensor(sensor_id);
        let geometry = device.geometry();

        // always use an odd number of bins to have a central bin for zero
        let bins = bins + if bins % 2 == 0 { 1 } else { 0 };

        let ((u0, u1), (v0, v1)) = sensor.sensitive_area_local();
        let (s0, s1) = sensor.time_range_local();
        let slope = geometry.beam_slope_in_local(sensor_id);
        let slope_cov = geometry.beam_slope_cov_in_local(sensor_id);
        // keep the slope axes usable for vanishing beam divergence
        let slope_std = (
            slope_cov[(0, 0)].sqrt().max(1.25e-3),
            slope_cov[(1, 1)].sqrt().max(1.25e-3),
        );

        let res_u_max = range_std * sensor.pitch_col() / 12f64.sqrt();
        let res_v_max = range_std * sensor.pitch_row() / 12f64.sqrt();
        let dist_max = res_u_max.hypot(res_v_max);

        let ax_res_u = HistAxis::new(-res_u_max, res_u_max, bins, "Cluster - track position u");
        let ax_res_v = HistAxis::new(-res_v_max, res_v_max, bins, "Cluster - track position v");
        let ax_res_s = HistAxis::difference(
            (s0, s1),
            sensor.pitch_timestamp(),
            (s0, s1),
            sensor.pitch_timestamp(),
            "Cluster - track local time",
        );
        let ax_dist = HistAxis::new(0.0, dist_max, bins, "Cluster - track distance");
        let ax_d2 = HistAxis::new(
            0.0,
            2.0 * range_std,
            bins,
            "Cluster - track weighted squared distance",
        );
        let ax_u = HistAxis::with_pitch(u0, u1, sensor.pitch_col(), "Track position u");
        let ax_v = HistAxis::with_pitch(v0, v1, sensor.pitch_row(), "Track position v");
        let ax_s = HistAxis::with_pitch(s0, s1, sensor.pitch_timestamp(), "Track local time");
        let ax_slope_u = HistAxis::new(
            slope[0] - range_std * slope_std.0,
            slope[0] + range_std * slope_std.0,
            bins,
            "Track slope u",
        );
        let ax_slope_v = HistAxis::new(
            slope[1] - range_std * slope_std.1,
            slope[1] + range_std * slope_std.1,
            bins,
            "Track slope v",
        );

        Self {
            res_u: Hist1::new(ax_res_u.clone()),
            res_v: Hist1::new(ax_res_v.clone()),
            res_s: Hist1::new(ax_res_s),
            res_uv: Hist2::new(ax_res_u.clone(), ax_res_v.clone()),
            res_dist: Hist1::new(ax_dist),
            res_d2: Hist1::new(ax_d2),
            pos_u_res_u: Hist2::new(ax_u.clone(), ax_res_u.clone()),
            pos_u_res_v: Hist2::new(ax_u, ax_res_v.clone()),
            pos_v_res_u: Hist2::new(ax_v.clone(), ax_res_u.clone()),
            pos_v_res_v: Hist2::new(ax_v, ax_res_v.clone()),
            time_res_u: Hist2::new(ax_s.clone(), ax_res_u.clone()),
            time_res_v: Hist2::new(ax_s, ax_res_v.clone()),
            slope_u_res_u: Hist2::new(ax_slope_u.clone(), ax_res_u.clone()),
            slope_u_res_v: Hist2::new(ax_slope_u, ax_res_v.clone()),
            slope_v_res_u: Hist2::new(ax_slope_v.clone(), ax_res_u),
            slope_v_res_v: Hist2::new(ax_slope_v, ax_res_v),
        }
    }

    fn fill(&mut self, state: &TrackState, cluster: &Cluster) {
        let res = cluster.position_local() - state.position();
        let cov = cluster.uv_cov() + state.location_cov();

        self.res_u.fill(res[0]);
        self.res_v.fill(res[1]);
        self.res_s.fill(res[3]);
        self.res_uv.fill(res[0], res[1]);
        self.res_dist.fill(res[0].hypot(res[1]));
        self.res_d2
            .fill(mahalanobis_squared(&cov, &nalgebra::Vector2::new(res[0], res[1])));
        self.pos_u_res_u.fill(state.loc0(), res[0]);
        self.pos_u_res_v.fill(state.loc0(), res[1]);
        self.pos_v_res_u.fill(state.loc1(), res[0]);
        self.pos_v_res_v.fill(state.loc1(), res[1]);
        self.time_res_u.fill(state.time(), res[0]);
        self.time_res_v.fill(state.time(), res[1]);
        self.slope_u_res_u.fill(state.slope_loc0(), res[0]);
        self.slope_u_res_v.fill(state.slope_loc0(), res[1]);
        self.slope_v_res_u.fill(state.slope_loc1(), res[0]);
        self.slope_v_res_v.fill(state.slope_loc1(), res[1]);
    }
}

/// Histograms cluster-track residuals for the requested sensors.
///
/// Uses the unbiased local track states stored in the sensor events; only
/// clusters that belong to a track contribute.
pub struct Residuals {
    hists: BTreeMap<usize, SensorResidualHists>,
}

impl Residuals {
    pub fn new(device: Arc<Device>, sensor_ids: &[usize], range_std: f64, bins: usize) -> Self {
        let mut hists = BTreeMap::new();
        for &sensor_id in sensor_ids {
            hists.insert(
                sensor_id,
                SensorResidualHists::new(&device, sensor_id, range_std, bins),
            );
        }
        Self { hists }
    }

    pub fn sensor_hists(&self, sensor_id: usize) -> Option<&SensorResidualHists> {
        self.hists.get(&sensor_id)
    }
}

impl Analyzer for Residuals {
    fn name(&self) -> &str {
        "Residuals"
    }

    fn execute(&mut self, event: &Event) -> Result<(), Error> {
        for (&sensor_id, hists) in self.hists.iter_mut() {
            let sensor_event = event.sensor_event(sensor_id);
            for icluster in 0..sensor_event.num_clusters() {
                let cluster = sensor_event.cluster(icluster);
                let Some(itrack) = cluster.track() else {
                    continue;
                };
                if let Some(state) = sensor_event.local_state(itrack) {
                    hists.fill(state, cluster);
                }
            }
        }
        Ok(())
    }

    fn finalize(&mut self) -> Result<(), Error> {
        for (sensor_id, hists) in self.hists.iter() {
            if hists.res_u.entries() == 0 {
                continue;
            }
            info!(
                "sensor {} residuals: u = {:.2e} +- {:.2e}, v = {:.2e} +- {:.2e}",
                sensor_id,
                hists.res_u.mean(),
                hists.res_u.mean_error(),
                hists.res_v.mean(),
                hists.res_v.mean_error()
            );
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{DeviceConfig, GeometryConfig, PlaneConfig, SensorConfig};
    use crate::event::Track;
    use approx::assert_abs_diff_eq;
    use nalgebra::{Matrix4, Vector4};

    fn device() -> Arc<Device> {
        let cfg = DeviceConfig {
            name: "test".into(),
            beam: Default::default(),
            sensors: vec![SensorConfig {
                id: 0,
                name: "s0".into(),
                measurement: "pixel_binary".into(),
                num_cols: 64,
                num_rows: 64,
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

    #[test]
    fn residuals_are_filled_for_tracked_clusters() {
        let device = device();
        let mut analyzer = Residuals::new(device, &[0], 5.0, 64);

        let mut event = Event::new(1);
        event.clear(0, 0);
        let var = (0.025f64 * 0.025) / 12.0;
        let mut cluster = Cluster::new(0.0, 0.0, 0.0, 1.0, 1.0 / 12.0, 1.0 / 12.0, 0.0, 0.0);
        let mut cov = Matrix4::zeros();
        cov[(0, 0)] = var;
        cov[(1, 1)] = var;
        cluster.set_local(Vector4::new(0.01, -0.01, 0.0, 0.0), cov);
        cluster.set_global(Vector4::new(0.01, -0.01, 0.0, 0.0), cov);
        let icluster = event.sensor_event_mut(0).add_cluster(cluster);

        let mut track = Track::new();
        track.add_cluster(0, icluster);
        let itrack = event.add_track(track);
        let mut state = TrackState::new(0.005, -0.005, 0.0, 0.0);
        state.set_cov_u(var, 0.0, 0.0);
        state.set_cov_v(var, 0.0, 0.0);
        event.sensor_event_mut(0).set_local_state(itrack, state);

        analyzer.execute(&event).unwrap();

        let hists = analyzer.sensor_hists(0).unwrap();
        assert_eq!(hists.res_u.entries(), 1);
        assert_abs_diff_eq!(hists.res_u.mean(), 0.005, epsilon = 1e-12);
        assert_abs_diff_eq!(hists.res_v.mean(), -0.005, epsilon = 1e-12);
        assert_eq!(hists.res_d2.entries(), 1);
    }

    #[test]
    fn untracked_clusters_are_ignored() {
        let device = device();
        let mut analyzer = Residuals::new(device, &[0], 5.0, 64);

        let mut event = Event::new(1);
        event.clear(0, 0);
        let mut cluster = Cluster::new(0.0, 0.0, 0.0, 1.0, 1.0, 1.0, 0.0, 0.0);
        cluster.set_local(Vector4::zeros(), Matrix4::zeros());
        event.sensor_event_mut(0).add_cluster(cluster);

        analyzer.execute(&event).unwrap();
        assert_eq!(analyzer.sensor_hists(0).unwrap().res_u.entries(), 0);
    }
}
