//! Unique matching of clusters and local track states on one sensor.

use std::collections::BTreeSet;
use std::sync::Arc;

use nalgebra::Vector2;

use crate::config::Device;
use crate::error::Error;
use crate::event::Event;
use crate::geometry::mahalanobis_squared;
use crate::pipeline::Processor;

/// Matches the closest cluster/track-state pairs on a sensor plane.
///
/// Every cluster and every state is matched at most once; pairs are
/// accepted in order of increasing Mahalanobis distance. The result
/// depends only on the set of pairs and their distances, not on the
/// storage order; ties are resolved by the lower cluster index, then the
/// lower track index.
pub struct Matcher {
    sensor_id: usize,
    d2_max: f64,
    name: String,
}

impl Matcher {
    /// * `distance_sigma_max` maximum matching significance, negative disables
    pub fn new(device: &Arc<Device>, sensor_id: usize, distance_sigma_max: f64) -> Self {
        Self {
            sensor_id,
            d2_max: if distance_sigma_max < 0.0 {
                -1.0
            } else {
                distance_sigma_max * distance_sigma_max
            },
            name: format!("Matcher({})", device.sensor(sensor_id).name()),
        }
    }
}

impl Processor for Matcher {
    fn name(&self) -> &str {
        &self.name
    }

    fn execute(&self, event: &mut Event) -> Result<(), Error> {
        // preselect possible track state / cluster pairs
        let mut possible = Vec::new();
        {
            let sensor_event = event.sensor_event(self.sensor_id);
            for (itrack, state) in sensor_event.local_states() {
                for icluster in 0..sensor_event.num_clusters() {
                    let cluster = sensor_event.cluster(icluster);
                    let delta =
                        Vector2::new(cluster.u() - state.loc0(), cluster.v() - state.loc1());
                    let cov = cluster.uv_cov() + state.location_cov();
                    let d2 = mahalanobis_squared(&cov, &delta);
                    // non-finite distances come from failed fits and are
                    // dropped here instead of poisoning the sort
                    if !d2.is_finite() {
                        continue;
                    }
                    if (self.d2_max < 0.0) || (d2 < self.d2_max) {
                        possible.push((d2, icluster, itrack));
                    }
                }
            }
        }

        // closest distance first, ties by cluster then track index
        possible.sort_by(|a, b| {
            a.0.partial_cmp(&b.0)
                .unwrap_or(std::cmp::Ordering::Equal)
                .then_with(|| a.1.cmp(&b.1))
                .then_with(|| a.2.cmp(&b.2))
        });

        // select unique matches
        let mut matched_clusters = BTreeSet::new();
        let mut matched_states = BTreeSet::new();
        let sensor_event = event.sensor_event_mut(self.sensor_id);
        for (_, icluster, itrack) in possible {
            if matched_clusters.contains(&icluster) || matched_states.contains(&itrack) {
                continue;
            }
            matched_clusters.insert(icluster);
            matched_states.insert(itrack);
            sensor_event.add_match(icluster, itrack);
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{DeviceConfig, GeometryConfig, PlaneConfig, SensorConfig};
    use crate::event::{Cluster, TrackState};
    use nalgebra::{Matrix4, Vector4};

    fn device() -> Arc<Device> {
        let cfg = DeviceConfig {
            name: "test".into(),
            beam: Default::default(),
            sensors: vec![SensorConfig {
                id: 0,
                name: "s0".into(),
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

    fn add_cluster(event: &mut Event, u: f64, v: f64, var: f64) -> usize {
        let mut cluster = Cluster::new(0.0, 0.0, 0.0, 1.0, 1.0, 1.0, 0.0, 0.0);
        let mut cov = Matrix4::zeros();
        cov[(0, 0)] = var;
        cov[(1, 1)] = var;
        cluster.set_local(Vector4::new(u, v, 0.0, 0.0), cov);
        cluster.set_global(Vector4::new(u, v, 0.0, 0.0), cov);
        event.sensor_event_mut(0).add_cluster(cluster)
    }

    fn add_state(event: &mut Event, itrack: usize, u: f64, v: f64, var: f64) {
        let mut state = TrackState::new(u, v, 0.0, 0.0);
        state.set_cov_u(var, 0.0, 0.0);
        state.set_cov_v(var, 0.0, 0.0);
        event.sensor_event_mut(0).set_local_state(itrack, state);
    }

    #[test]
    fn sigma_cut_excludes_distant_cluster() {
        let device = device();
        let mut event = Event::new(1);
        event.clear(0, 0);
        add_state(&mut event, 0, 0.0, 0.0, 1.0);
        let near = add_cluster(&mut event, 0.1, 0.1, 0.01);
        let far = add_cluster(&mut event, 0.5, 0.5, 0.01);

        Matcher::new(&device, 0, 3.0).execute(&mut event).unwrap();

        let sev = event.sensor_event(0);
        assert_eq!(sev.local_state(0).unwrap().matched_cluster(), Some(near));
        assert!(!sev.cluster(far).is_matched());
    }

    #[test]
    fn matching_is_unique_per_cluster_and_state() {
        let device = device();
        let mut event = Event::new(1);
        event.clear(0, 0);
        add_state(&mut event, 0, 0.0, 0.0, 0.01);
        add_state(&mut event, 1, 0.3, 0.0, 0.01);
        let c0 = add_cluster(&mut event, 0.01, 0.0, 0.01);
        let c1 = add_cluster(&mut event, 0.29, 0.0, 0.01);

        Matcher::new(&device, 0, -1.0).execute(&mut event).unwrap();

        let sev = event.sensor_event(0);
        assert_eq!(sev.local_state(0).unwrap().matched_cluster(), Some(c0));
        assert_eq!(sev.local_state(1).unwrap().matched_cluster(), Some(c1));
        assert_eq!(sev.cluster(c0).matched_state(), Some(0));
        assert_eq!(sev.cluster(c1).matched_state(), Some(1));
    }

    #[test]
    fn result_is_invariant_under_cluster_order() {
        let device = device();
        // same content, clusters stored in opposite order
        let mut matched_u = Vec::new();
        for flip in [false, true] {
            let mut event = Event::new(1);
            event.clear(0, 0);
            add_state(&mut event, 0, 0.0, 0.0, 0.01);
            let positions = if flip {
                [(0.4, 0.0), (0.05, 0.0)]
            } else {
                [(0.05, 0.0), (0.4, 0.0)]
            };
            for (u, v) in positions {
                add_cluster(&mut event, u, v, 0.01);
            }
            Matcher::new(&device, 0, -1.0).execute(&mut event).unwrap();
            let sev = event.sensor_event(0);
            let icluster = sev.local_state(0).unwrap().matched_cluster().unwrap();
            matched_u.push(sev.cluster(icluster).u());
        }
        assert_eq!(matched_u[0], matched_u[1]);
    }
}
