//! Combinatorial straight-track finding.
//!
//! Candidates are seeded from unused clusters on a seed sensor and
//! extended across the remaining sensors in beam order, assuming straight
//! propagation along the beam direction. Matching ambiguities bifurcate
//! the candidate; ambiguities are resolved after the search by accepting
//! candidates with the most clusters and the best fit first, with strictly
//! exclusive cluster assignment.

use std::sync::Arc;

use nalgebra::{Vector2, Vector3};

use crate::config::Device;
use crate::error::Error;
use crate::event::{Event, Track};
use crate::geometry::mahalanobis_squared;
use crate::pipeline::Processor;
use crate::tracking::fit_track_global;

pub struct TrackFinder {
    sensor_ids: Vec<usize>,
    num_clusters_min: usize,
    // 2-d Mahalanobis distance peaks at 2 and not at 1
    d2_max: f64,
    red_chi2_max: f64,
    beam_direction: Vector3<f64>,
}

impl TrackFinder {
    /// Creates a finder over the given sensors.
    ///
    /// * `num_clusters_min` selection cut on the number of clusters
    /// * `search_sigma_max` association cut on neighbors, negative disables
    /// * `red_chi2_max` selection cut on chi2/d.o.f., negative disables
    pub fn new(
        device: Arc<Device>,
        sensors: &[usize],
        num_clusters_min: usize,
        search_sigma_max: f64,
        red_chi2_max: f64,
    ) -> Result<Self, Error> {
        if sensors.len() < 2 {
            return Err(Error::config("need at least two sensors to find tracks"));
        }
        if num_clusters_min < 2 {
            return Err(Error::config("a track needs at least two clusters"));
        }
        if sensors.len() < num_clusters_min {
            return Err(Error::config(
                "number of tracking sensors < minimum number of clusters",
            ));
        }
        let mut unique = sensors.to_vec();
        unique.sort_unstable();
        unique.dedup();
        if unique.len() != sensors.len() {
            return Err(Error::config("tracking sensor ids must be unique"));
        }
        Ok(Self {
            sensor_ids: device.geometry().sorted_along_beam(sensors),
            num_clusters_min,
            d2_max: if search_sigma_max < 0.0 {
                -1.0
            } else {
                2.0 * search_sigma_max * search_sigma_max
            },
            red_chi2_max,
            beam_direction: *device.geometry().beam_direction(),
        })
    }

    /// Search matching clusters for all candidates on the given sensor.
    ///
    /// Ambiguities are not resolved but result in additional candidates.
    fn search_sensor(&self, sensor_id: usize, event: &Event, candidates: &mut Vec<Track>) {
        let sensor_event = event.sensor_event(sensor_id);

        // loop only over the initial candidates and not the added ones
        let num_candidates = candidates.len();
        for itrack in 0..num_candidates {
            let (last_sensor, last_cluster) = *candidates[itrack]
                .clusters()
                .last()
                .expect("candidate without clusters");
            let last = event.sensor_event(last_sensor).cluster(last_cluster);
            let last_pos = *last.position_global();
            let last_cov = last.xy_cov();

            let mut matched = None;
            for icluster in 0..sensor_event.num_clusters() {
                let curr = sensor_event.cluster(icluster);

                // clusters already in use must be ignored
                if curr.is_in_track() {
                    continue;
                }

                let curr_pos = curr.position_global();
                let mut delta = Vector3::new(
                    curr_pos[0] - last_pos[0],
                    curr_pos[1] - last_pos[1],
                    curr_pos[2] - last_pos[2],
                );
                delta -= delta[2] * self.beam_direction;
                let cov = last_cov + curr.xy_cov();
                let d2 = mahalanobis_squared(&cov, &Vector2::new(delta[0], delta[1]));

                if (0.0 < self.d2_max) && (self.d2_max < d2) {
                    continue;
                }

                if matched.is_none() {
                    // first matching cluster
                    matched = Some(icluster);
                } else {
                    // matching ambiguity, bifurcate the candidate
                    let mut copy = candidates[itrack].clone();
                    copy.add_cluster(sensor_id, icluster);
                    candidates.push(copy);
                }
            }
            // the first matched cluster can only be added after all other
            // clusters have been considered; otherwise the bifurcated
            // copies would inherit it and carry two clusters on this sensor
            if let Some(icluster) = matched {
                candidates[itrack].add_cluster(sensor_id, icluster);
            }
        }
    }

    /// Add candidates selected by chi2 and exclusive cluster use to the event.
    fn select_tracks(&self, mut candidates: Vec<Track>, event: &mut Event) {
        for track in candidates.iter_mut() {
            fit_track_global(event, track);
        }
        // best candidates first: longest track, then smallest reduced chi2;
        // the sort is stable so equal candidates keep insertion order
        candidates.sort_by(|a, b| {
            b.size()
                .cmp(&a.size())
                .then_with(|| {
                    a.reduced_chi2()
                        .partial_cmp(&b.reduced_chi2())
                        .unwrap_or(std::cmp::Ordering::Equal)
                })
        });

        for track in candidates {
            if (0.0 < self.red_chi2_max) && (self.red_chi2_max < track.reduced_chi2()) {
                continue;
            }
            // all constituent clusters must still be unused
            let shared = track
                .clusters()
                .iter()
                .any(|&(s, c)| event.sensor_event(s).cluster(c).is_in_track());
            if shared {
                continue;
            }
            event.add_track(track);
        }
    }
}

impl Processor for TrackFinder {
    fn name(&self) -> &str {
        "TrackFinder"
    }

    fn execute(&self, event: &mut Event) -> Result<(), Error> {
        let num_sensors = self.sensor_ids.len();
        let num_seed_sensors = 1 + num_sensors - self.num_clusters_min;

        for i in 0..num_seed_sensors {
            let seed_id = self.sensor_ids[i];

            // one candidate per unused cluster on the seed sensor
            let mut candidates = Vec::new();
            for icluster in 0..event.sensor_event(seed_id).num_clusters() {
                if event.sensor_event(seed_id).cluster(icluster).is_in_track() {
                    continue;
                }
                let mut track = Track::new();
                track.add_cluster(seed_id, icluster);
                candidates.push(track);
            }

            // extend across the remaining sensors in beam order
            for j in (i + 1)..num_sensors {
                self.search_sensor(self.sensor_ids[j], event, &mut candidates);

                // drop candidates that can no longer reach the minimum
                let remaining = num_sensors - (j + 1);
                candidates.retain(|c| self.num_clusters_min <= c.size() + remaining);
            }

            // select final tracks only after all candidates of this seed
            // round are known, for a more global choice
            self.select_tracks(candidates, event);
        }
        Ok(())
    }
}
