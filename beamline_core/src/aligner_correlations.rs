//! Alignment in the transverse plane from cluster correlations.
//!
//! Walks away from a fixed reference sensor in both directions along the
//! beam and accumulates the restricted mean of the neighbor-pair position
//! differences into a running global offset correction. This implicitly
//! assumes straight propagation with zero slope along the beam axis.

use std::sync::Arc;

use tracing::info;

use crate::config::Device;
use crate::correlations::Correlations;
use crate::error::Error;
use crate::event::Event;
use crate::geometry::Geometry;
use crate::pipeline::{Aligner, Analyzer};

// how many bins around the peak enter the means
const BINS_RESTRICTED: usize = 3;

pub struct CorrelationsAligner {
    device: Arc<Device>,
    corr: Correlations,
    fixed_id: usize,
    backward_ids: Vec<usize>,
    forward_ids: Vec<usize>,
}

impl CorrelationsAligner {
    /// * `fixed_id` reference sensor that is kept in place
    /// * `align_ids` sensors to align; must not contain the fixed sensor
    pub fn new(device: Arc<Device>, fixed_id: usize, align_ids: &[usize]) -> Result<Self, Error> {
        if align_ids.contains(&fixed_id) {
            return Err(Error::config(
                "the fixed sensor cannot be in the set of aligned sensors",
            ));
        }

        let mut sorted = align_ids.to_vec();
        sorted.push(fixed_id);
        let sorted = device.geometry().sorted_along_beam(&sorted);

        // neighbor differences need a clear peak; co-planar sensors have
        // no defined order and are rejected outright
        let beam = device.geometry().beam_direction();
        let min_pitch = sorted
            .iter()
            .map(|&id| device.sensor(id).pitch_col().min(device.sensor(id).pitch_row()))
            .fold(f64::INFINITY, f64::min);
        for pair in sorted.windows(2) {
            let z0 = device.geometry().plane(pair[0]).offset().dot(beam);
            let z1 = device.geometry().plane(pair[1]).offset().dot(beam);
            if (z1 - z0).abs() < 0.1 * min_pitch {
                return Err(Error::config(format!(
                    "sensors {} and {} are co-planar along the beam",
                    pair[0], pair[1]
                )));
            }
        }

        // only correlations between direct neighbors are needed
        let corr = Correlations::new(device.clone(), &sorted, 1)?;

        let fixed_pos = sorted.iter().position(|&id| id == fixed_id).unwrap();
        // both walks must move away from the fixed sensor
        let backward_ids = sorted[..fixed_pos].iter().rev().copied().collect();
        let forward_ids = sorted[fixed_pos + 1..].to_vec();

        Ok(Self {
            device,
            corr,
            fixed_id,
            backward_ids,
            forward_ids,
        })
    }

    fn restricted_means(&self, id0: usize, id1: usize) -> Result<((f64, f64), (f64, f64)), Error> {
        let failed = |what: &str| Error::AlignmentFailed {
            sensor: id1,
            reason: format!("empty {what} correlation histogram for pair {id0}-{id1}"),
        };
        let x = self
            .corr
            .diff_x(id0, id1)
            .and_then(|h| h.restricted_mean(BINS_RESTRICTED))
            .ok_or_else(|| failed("x"))?;
        let y = self
            .corr
            .diff_y(id0, id1)
            .and_then(|h| h.restricted_mean(BINS_RESTRICTED))
            .ok_or_else(|| failed("y"))?;
        Ok((x, y))
    }
}

impl Analyzer for CorrelationsAligner {
    fn name(&self) -> &str {
        "CorrelationsAligner"
    }

    fn execute(&mut self, event: &Event) -> Result<(), Error> {
        self.corr.execute(event)
    }

    fn finalize(&mut self) -> Result<(), Error> {
        self.corr.finalize()
    }
}

impl Aligner for CorrelationsAligner {
    fn updated_geometry(&self) -> Result<Geometry, Error> {
        let mut geo = self.device.geometry().clone();

        // sensors located before the fixed sensor, walking backwards
        let mut next_id = self.fixed_id;
        let mut delta_x = 0.0;
        let mut delta_y = 0.0;
        let mut var_x = 0.0;
        let mut var_y = 0.0;
        for &curr_id in self.backward_ids.iter() {
            // the pair was histogrammed in beam order, so the difference
            // picks up an extra sign for the backward correction
            let ((mx, vx), (my, vy)) = self.restricted_means(curr_id, next_id)?;
            delta_x += mx;
            var_x += vx;
            delta_y += my;
            var_y += vy;

            info!(
                "{} alignment corrections (before fixed sensor):",
                self.device.sensor(curr_id).name()
            );
            info!("  dx: {:.4e} +- {:.4e}", delta_x, var_x.sqrt());
            info!("  dy: {:.4e} +- {:.4e}", delta_y, var_y.sqrt());
            geo.correct_global_offset(curr_id, delta_x, delta_y, 0.0);

            next_id = curr_id;
        }

        // sensors located after the fixed sensor, walking forwards
        let mut prev_id = self.fixed_id;
        delta_x = 0.0;
        delta_y = 0.0;
        var_x = 0.0;
        var_y = 0.0;
        for &curr_id in self.forward_ids.iter() {
            let ((mx, vx), (my, vy)) = self.restricted_means(prev_id, curr_id)?;
            delta_x -= mx;
            var_x += vx;
            delta_y -= my;
            var_y += vy;

            info!(
                "{} alignment corrections (after fixed sensor):",
                self.device.sensor(curr_id).name()
            );
            info!("  dx: {:.4e} +- {:.4e}", delta_x, var_x.sqrt());
            info!("  dy: {:.4e} +- {:.4e}", delta_y, var_y.sqrt());
            geo.correct_global_offset(curr_id, delta_x, delta_y, 0.0);

            prev_id = curr_id;
        }
        Ok(geo)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{DeviceConfig, GeometryConfig, PlaneConfig, SensorConfig};
    use crate::event::Cluster;
    use approx::assert_abs_diff_eq;
    use nalgebra::{Matrix4, Vector4};

    fn telescope(zs: &[f64]) -> Arc<Device> {
        let sensors = (0..zs.len())
            .map(|i| SensorConfig {
                id: i,
                name: format!("tel{i}"),
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
            })
            .collect();
        let planes = zs
            .iter()
            .enumerate()
            .map(|(i, &z)| PlaneConfig {
                sensor: i,
                offset: [0.0, 0.0, z],
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
    fn fixed_sensor_in_align_set_is_rejected() {
        let device = telescope(&[0.0, 50.0, 100.0]);
        assert!(CorrelationsAligner::new(device, 0, &[0, 1]).is_err());
    }

    #[test]
    fn coplanar_sensors_are_rejected() {
        let device = telescope(&[0.0, 50.0, 50.0]);
        assert!(CorrelationsAligner::new(device, 0, &[1, 2]).is_err());
    }

    #[test]
    fn shifted_sensor_offset_is_recovered() {
        // sensor 1 measurements appear shifted by (0.3, -0.2): its local
        // frame is offset relative to where the geometry thinks it is
        let device = telescope(&[0.0, 50.0, 100.0]);
        let mut aligner = CorrelationsAligner::new(device.clone(), 0, &[1, 2]).unwrap();

        let mut event = Event::new(3);
        for frame in 0..500 {
            event.clear(frame, 0);
            put_cluster(&mut event, 0, 0.0, 0.0, 0.0);
            put_cluster(&mut event, 1, 0.3, -0.2, 50.0);
            put_cluster(&mut event, 2, 0.0, 0.0, 100.0);
            aligner.execute(&event).unwrap();
        }
        aligner.finalize().unwrap();

        let geo = aligner.updated_geometry().unwrap();
        let bin = 0.025;
        // sensor 1 is pulled back onto the beam axis
        assert_abs_diff_eq!(geo.plane(1).offset()[0], -0.3, epsilon = bin);
        assert_abs_diff_eq!(geo.plane(1).offset()[1], 0.2, epsilon = bin);
        // sensor 2 was consistent with sensor 1 being shifted, so its
        // correction cancels out again
        assert_abs_diff_eq!(geo.plane(2).offset()[0], 0.0, epsilon = 2.0 * bin);
        assert_abs_diff_eq!(geo.plane(2).offset()[1], 0.0, epsilon = 2.0 * bin);
    }
}
