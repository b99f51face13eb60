//! Cluster correlations between neighboring sensors.
//!
//! For every ordered sensor pair within the configured neighbor distance
//! the analyzer accumulates the 2-D correlation of the global cluster
//! positions and the 1-D distribution of their differences. The
//! correlation aligner reads the difference histograms back.

use std::collections::BTreeMap;
use std::sync::Arc;

use crate::config::Device;
use crate::error::Error;
use crate::event::Event;
use crate::geometry::Plane;
use crate::histogram::{Hist1, Hist2, HistAxis};
use crate::pipeline::Analyzer;
use crate::sensor::Sensor;

/// Global x/y extents of the sensitive area projected onto the xy-plane.
pub(crate) fn projected_envelope_xy(sensor: &Sensor, plane: &Plane) -> ((f64, f64), (f64, f64)) {
    let ((u0, u1), (v0, v1)) = sensor.sensitive_area_local();
    let mut x = (f64::INFINITY, f64::NEG_INFINITY);
    let mut y = (f64::INFINITY, f64::NEG_INFINITY);
    for (u, v) in [(u0, v0), (u0, v1), (u1, v0), (u1, v1)] {
        let global = plane.to_global(&nalgebra::Vector4::new(u, v, 0.0, 0.0));
        x = (x.0.min(global[0]), x.1.max(global[0]));
        y = (y.0.min(global[1]), y.1.max(global[1]));
    }
    (x, y)
}

/// Pixel pitch projected onto the global x/y axes.
pub(crate) fn projected_pitch_xy(sensor: &Sensor, plane: &Plane) -> (f64, f64) {
    let rot = plane.rotation();
    let pc = sensor.pitch_col();
    let pr = sensor.pitch_row();
    let px = (rot[(0, 0)] * pc).abs() + (rot[(0, 1)] * pr).abs();
    let py = (rot[(1, 0)] * pc).abs() + (rot[(1, 1)] * pr).abs();
    // a plane seen edge-on projects to zero pitch; keep the axes usable
    (
        if px <= 0.0 { pc.min(pr) } else { px },
        if py <= 0.0 { pc.min(pr) } else { py },
    )
}

struct PairHists {
    corr_x: Hist2,
    corr_y: Hist2,
    corr_t: Hist2,
    diff_x: Hist1,
    diff_y: Hist1,
    diff_t: Hist1,
}

pub struct Correlations {
    hists: BTreeMap<(usize, usize), PairHists>,
}

impl Correlations {
    /// Pair-wise correlations between neighboring sensors of the given
    /// ordered list.
    ///
    /// * `neighbors` how many subsequent sensors each sensor is paired
    ///   with; must be at least one.
    pub fn new(device: Arc<Device>, sensor_ids: &[usize], neighbors: usize) -> Result<Self, Error> {
        if sensor_ids.len() < 2 {
            return Err(Error::config(format!(
                "need at least two sensors but {} given",
                sensor_ids.len()
            )));
        }
        if neighbors < 1 {
            return Err(Error::config(format!(
                "need at least one neighbor but {neighbors} given"
            )));
        }

        let mut hists = BTreeMap::new();
        let n = sensor_ids.len();
        for i in 0..n {
            for j in (i + 1)..n.min(i + 1 + neighbors) {
                let id0 = sensor_ids[i];
                let id1 = sensor_ids[j];
                hists.insert((id0, id1), Self::make_pair_hists(&device, id0, id1));
            }
        }
        Ok(Self { hists })
    }

    /// Correlations between all configured sensors, sorted along the beam.
    pub fn for_all_sensors(device: Arc<Device>, neighbors: usize) -> Result<Self, Error> {
        let sorted = device.geometry().sorted_along_beam(&device.sensor_ids());
        Self::new(device, &sorted, neighbors)
    }

    fn make_pair_hists(device: &Device, id0: usize, id1: usize) -> PairHists {
        let sensor0 = device.sensor(id0);
        let sensor1 = device.sensor(id1);
        let plane0 = device.geometry().plane(id0);
        let plane1 = device.geometry().plane(id1);

        let (x0, y0) = projected_envelope_xy(sensor0, plane0);
        let (x1, y1) = projected_envelope_xy(sensor1, plane1);
        let (px0, py0) = projected_pitch_xy(sensor0, plane0);
        let (px1, py1) = projected_pitch_xy(sensor1, plane1);
        let t0 = sensor0.time_range_local();
        let t1 = sensor1.time_range_local();
        let pt0 = sensor0.pitch_timestamp();
        let pt1 = sensor1.pitch_timestamp();

        let corr = |r0: (f64, f64), p0: f64, r1: (f64, f64), p1: f64, what: &str| {
            Hist2::new(
                HistAxis::with_pitch(r0.0, r0.1, p0, format!("{} cluster {what}", sensor0.name())),
                HistAxis::with_pitch(r1.0, r1.1, p1, format!("{} cluster {what}", sensor1.name())),
            )
        };
        let diff = |r0: (f64, f64), p0: f64, r1: (f64, f64), p1: f64, what: &str| {
            Hist1::new(HistAxis::difference(
                r0,
                p0,
                r1,
                p1,
                format!("{} - {} cluster {what}", sensor1.name(), sensor0.name()),
            ))
        };

        PairHists {
            corr_x: corr(x0, px0, x1, px1, "position x"),
            corr_y: corr(y0, py0, y1, py1, "position y"),
            corr_t: corr(t0, pt0, t1, pt1, "time"),
            diff_x: diff(x0, px0, x1, px1, "position x"),
            diff_y: diff(y0, py0, y1, py1, "position y"),
            diff_t: diff(t0, pt0, t1, pt1, "time"),
        }
    }

    /// The x difference histogram for the ordered sensor pair.
    pub fn diff_x(&self, id0: usize, id1: usize) -> Option<&Hist1> {
        self.hists.get(&(id0, id1)).map(|h| &h.diff_x)
    }

    /// The y difference histogram for the ordered sensor pair.
    pub fn diff_y(&self, id0: usize, id1: usize) -> Option<&Hist1> {
        self.hists.get(&(id0, id1)).map(|h| &h.diff_y)
    }
}

impl Analyzer for Correlations {
    fn name(&self) -> &str {
        "Correlations"
    }

    fn execute(&mut self, event: &Event) -> Result<(), Error> {
        for (&(id0, id1), hists) in self.hists.iter_mut() {
            let sensor0 = event.sensor_event(id0);
            let sensor1 = event.sensor_event(id1);

            for c0 in 0..sensor0.num_clusters() {
                let global0 = sensor0.cluster(c0).position_global();
                for c1 in 0..sensor1.num_clusters() {
                    let global1 = sensor1.cluster(c1).position_global();
                    hists.corr_x.fill(global0[0], global1[0]);
                    hists.corr_y.fill(global0[1], global1[1]);
                    hists.corr_t.fill(global0[3], global1[3]);
                    hists.diff_x.fill(global1[0] - global0[0]);
                    hists.diff_y.fill(global1[1] - global0[1]);
                    hists.diff_t.fill(global1[3] - global0[3]);
                }
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{DeviceConfig, GeometryConfig, PlaneConfig, SensorConfig};
    use crate::event::Cluster;
    use approx::assert_abs_diff_eq;
    use nalgebra::{Matrix4, Vector4};

    fn telescope(num_planes: usize) -> Arc<Device> {
        let sensors = (0..num_planes)
            .map(|i| SensorConfig {
                id: i,
                name: format!("tel{i}"),
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
            })
            .collect();
        let planes = (0..num_planes)
            .map(|i| PlaneConfig {
                sensor: i,
                offset: [0.0, 0.0, 25.0 * i as f64],
                rotation: [0.0; 3],
            })
            .collect();
        let cfg = DeviceConfig {
            name: "tele".into(),
            beam: Default::default(),
            sensors,
        };
        Arc::new(cfg.build(&GeometryConfig { planes }).unwrap())
    }

    fn put_cluster(event: &mut Event, sensor: usize, x: f64, y: f64, z: f64) {
        let mut cluster = Cluster::new(0.0, 0.0, 0.0, 1.0, 1.0, 1.0, 0.0, 0.0);
        let cov = Matrix4::zeros();
        cluster.set_local(Vector4::new(x, y, 0.0, 0.0), cov);
        cluster.set_global(Vector4::new(x, y, z, 0.0), cov);
        event.sensor_event_mut(sensor).add_cluster(cluster);
    }

    #[test]
    fn neighbor_pairs_are_created_within_radius() {
        let device = telescope(4);
        let ids = device.sensor_ids();
        let corr = Correlations::new(device, &ids, 2).unwrap();
        assert!(corr.diff_x(0, 1).is_some());
        assert!(corr.diff_x(0, 2).is_some());
        assert!(corr.diff_x(0, 3).is_none());
        assert!(corr.diff_x(1, 0).is_none());
    }

    #[test]
    fn invalid_configuration_is_rejected() {
        let device = telescope(3);
        assert!(Correlations::new(device.clone(), &[0], 1).is_err());
        assert!(Correlations::new(device, &[0, 1, 2], 0).is_err());
    }

    #[test]
    fn difference_histogram_peaks_at_relative_shift() {
        let device = telescope(2);
        let ids = device.sensor_ids();
        let mut corr = Correlations::new(device, &ids, 1).unwrap();

        let mut event = Event::new(2);
        for frame in 0..200 {
            event.clear(frame, 0);
            put_cluster(&mut event, 0, 0.1, 0.0, 0.0);
            put_cluster(&mut event, 1, 0.4, -0.2, 25.0);
            corr.execute(&event).unwrap();
        }

        let (mean_x, _) = corr.diff_x(0, 1).unwrap().restricted_mean(3).unwrap();
        let (mean_y, _) = corr.diff_y(0, 1).unwrap().restricted_mean(3).unwrap();
        let bin_x = corr.diff_x(0, 1).unwrap().axis().bin_width();
        assert_abs_diff_eq!(mean_x, 0.3, epsilon = bin_x);
        assert_abs_diff_eq!(mean_y, -0.2, epsilon = bin_x);
    }
}
