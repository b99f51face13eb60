//! Group adjacent hits into clusters with a weighted centroid and
//! covariance, and derive the local and global cluster positions.

use std::sync::Arc;

use nalgebra::Matrix4;

use crate::config::Device;
use crate::error::Error;
use crate::event::{Cluster, Event, SensorEvent};
use crate::pipeline::Processor;
use crate::sensor::Sensor;

// variance of a uniform distribution over one pixel
const PIXEL_VAR_FLOOR: f64 = 1.0 / 12.0;

/// Pixel adjacency used for grouping.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum Connectivity {
    /// Direct and diagonal neighbors
    #[default]
    Eight,
    /// Direct neighbors only
    Four,
}

impl Connectivity {
    fn adjacent(&self, dc: i32, dr: i32) -> bool {
        match self {
            Connectivity::Eight => (dc.abs() <= 1) && (dr.abs() <= 1),
            Connectivity::Four => (dc.abs() + dr.abs()) <= 1,
        }
    }
}

/// Builds clusters from the hits of every sensor event.
///
/// Weights are the hit values on sensors that measure them and uniform
/// otherwise. The centroid spread gets a per-axis floor of 1/12, the
/// variance of a single pixel. Cluster time is the weighted mean of the
/// hit timestamps.
pub struct Clusterizer {
    device: Arc<Device>,
    connectivity: Connectivity,
}

impl Clusterizer {
    pub fn new(device: Arc<Device>) -> Self {
        Self {
            device,
            connectivity: Connectivity::default(),
        }
    }

    pub fn with_connectivity(mut self, connectivity: Connectivity) -> Self {
        self.connectivity = connectivity;
        self
    }

    fn cluster_sensor(&self, sensor: &Sensor, plane_id: usize, sensor_event: &mut SensorEvent) {
        let num_hits = sensor_event.num_hits();
        let mut assigned = vec![false; num_hits];

        for seed in 0..num_hits {
            if assigned[seed] {
                continue;
            }
            // grow the group by repeated neighbor sweeps
            let mut group = vec![seed];
            assigned[seed] = true;
            let mut next = 0;
            while next < group.len() {
                let current = group[next];
                let (col, row) = {
                    let hit = sensor_event.hit(current);
                    (hit.col(), hit.row())
                };
                for other in (seed + 1)..num_hits {
                    if assigned[other] {
                        continue;
                    }
                    let hit = sensor_event.hit(other);
                    if self.connectivity.adjacent(hit.col() - col, hit.row() - row) {
                        assigned[other] = true;
                        group.push(other);
                    }
                }
                next += 1;
            }
            group.sort_unstable();

            let cluster = self.make_cluster(sensor, sensor_event, &group);
            let icluster = sensor_event.add_cluster(cluster);
            for &ihit in group.iter() {
                sensor_event.add_cluster_hit(icluster, ihit);
            }
            self.transform_cluster(sensor, plane_id, sensor_event, icluster);
        }
    }

    fn make_cluster(&self, sensor: &Sensor, sensor_event: &SensorEvent, group: &[usize]) -> Cluster {
        let use_values = sensor.measurement().has_values();
        let mut weights: Vec<f64> = group
            .iter()
            .map(|&i| {
                if use_values {
                    sensor_event.hit(i).value() as f64
                } else {
                    1.0
                }
            })
            .collect();
        // fall back to uniform weights for empty charge information
        if weights.iter().sum::<f64>() <= 0.0 {
            weights.iter_mut().for_each(|w| *w = 1.0);
        }
        let wsum: f64 = weights.iter().sum();

        let mut col = 0.0;
        let mut row = 0.0;
        let mut time = 0.0;
        let mut value = 0.0;
        for (&ihit, &w) in group.iter().zip(weights.iter()) {
            let hit = sensor_event.hit(ihit);
            col += w * hit.col() as f64;
            row += w * hit.row() as f64;
            time += w * hit.timestamp() as f64;
            value += hit.value() as f64;
        }
        col /= wsum;
        row /= wsum;
        time /= wsum;

        let mut col_var = 0.0;
        let mut row_var = 0.0;
        let mut col_row_cov = 0.0;
        let mut time_var = 0.0;
        for (&ihit, &w) in group.iter().zip(weights.iter()) {
            let hit = sensor_event.hit(ihit);
            let dc = hit.col() as f64 - col;
            let dr = hit.row() as f64 - row;
            let dt = hit.timestamp() as f64 - time;
            col_var += w * dc * dc;
            row_var += w * dr * dr;
            col_row_cov += w * dc * dr;
            time_var += w * dt * dt;
        }
        col_var = (col_var / wsum).max(PIXEL_VAR_FLOOR);
        row_var = (row_var / wsum).max(PIXEL_VAR_FLOOR);
        col_row_cov /= wsum;
        time_var = (time_var / wsum).max(PIXEL_VAR_FLOOR);

        let mut cluster = Cluster::new(col, row, time, value, col_var, row_var, col_row_cov, time_var);
        // the region is only defined if all hits agree on it
        let first_region = sensor_event.hit(group[0]).region();
        if first_region.is_some()
            && group
                .iter()
                .all(|&i| sensor_event.hit(i).region() == first_region)
        {
            cluster.set_region(first_region.unwrap());
        }
        cluster
    }

    fn transform_cluster(
        &self,
        sensor: &Sensor,
        plane_id: usize,
        sensor_event: &mut SensorEvent,
        icluster: usize,
    ) {
        let plane = self.device.geometry().plane(plane_id);
        let cluster = sensor_event.cluster_mut(icluster);

        let pos_local =
            sensor.transform_pixel_to_local(cluster.col(), cluster.row(), cluster.timestamp());
        let pc = sensor.pitch_col();
        let pr = sensor.pitch_row();
        let ps = sensor.pitch_timestamp();
        let mut cov_local = Matrix4::zeros();
        cov_local[(0, 0)] = pc * pc * cluster.col_var();
        cov_local[(1, 1)] = pr * pr * cluster.row_var();
        cov_local[(0, 1)] = pc * pr * cluster.col_row_cov();
        cov_local[(1, 0)] = cov_local[(0, 1)];
        cov_local[(3, 3)] = ps * ps * cluster.timestamp_var();

        let pos_global = plane.to_global(&pos_local);
        let cov_global = plane.cov_to_global(&cov_local);

        cluster.set_local(pos_local, cov_local);
        cluster.set_global(pos_global, cov_global);
    }
}

impl Processor for Clusterizer {
    fn name(&self) -> &str {
        "Clusterizer"
    }

    fn execute(&self, event: &mut Event) -> Result<(), Error> {
        for sensor_id in 0..self.device.num_sensors() {
            let sensor = self.device.sensor(sensor_id);
            self.cluster_sensor(sensor, sensor_id, event.sensor_event_mut(sensor_id));
        }
        Ok(())
    }
}
