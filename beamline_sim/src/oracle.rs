//! Ground-truth particle generator.
//!
//! The oracle knows where the sensors really are. It shoots straight
//! tracks from a Gaussian beam spot through the true geometry, smears the
//! intersection points with the measurement noise, and digitizes them
//! onto the pixel matrices. Reconstruction then runs against the nominal
//! geometry, which may differ from the truth.

use beamline_core::config::Device;
use nalgebra::{Vector3, Vector4};
use rand::Rng;
use rand::SeedableRng;
use rand_chacha::ChaCha8Rng;
use rand_distr::{Distribution, Normal};

/// Raw pixel data of one generated event.
#[derive(Debug, Clone)]
pub struct SimEvent {
    pub frame: u64,
    pub timestamp: u64,
    /// Per sensor: (col, row, timestamp, value) tuples.
    pub hits: Vec<Vec<(i32, i32, i32, i32)>>,
}

/// Beam and noise parameters for event generation.
#[derive(Debug, Clone)]
pub struct OracleConfig {
    /// Standard deviation of the beam spot at z = 0, in mm.
    pub beam_spot_std: f64,
    /// Standard deviation of the track slopes around the beam axis.
    pub beam_divergence_std: f64,
    /// Measurement smearing of the local intersection, in mm.
    pub measurement_noise_std: f64,
    /// Straight tracks per event.
    pub tracks_per_event: usize,
    /// Uncorrelated noise hits per sensor per event.
    pub noise_hits_per_sensor: usize,
}

impl Default for OracleConfig {
    fn default() -> Self {
        Self {
            beam_spot_std: 1.0,
            beam_divergence_std: 1e-4,
            measurement_noise_std: 0.0,
            tracks_per_event: 1,
            noise_hits_per_sensor: 0,
        }
    }
}

pub struct Oracle {
    rng: ChaCha8Rng,
    config: OracleConfig,
}

impl Oracle {
    pub fn new(seed: u64, config: OracleConfig) -> Self {
        Self {
            rng: ChaCha8Rng::seed_from_u64(seed),
            config,
        }
    }

    fn sample(&mut self, std: f64) -> f64 {
        if std <= 0.0 {
            return 0.0;
        }
        Normal::new(0.0, std).unwrap().sample(&mut self.rng)
    }

    /// Generate events through the true geometry of the given device.
    pub fn generate(&mut self, truth: &Device, num_events: u64) -> Vec<SimEvent> {
        (0..num_events).map(|frame| self.generate_event(truth, frame)).collect()
    }

    fn generate_event(&mut self, truth: &Device, frame: u64) -> SimEvent {
        let mut hits: Vec<Vec<(i32, i32, i32, i32)>> =
            vec![Vec::new(); truth.num_sensors()];
        let beam_slope = truth.geometry().beam_slope();

        for _ in 0..self.config.tracks_per_event {
            let origin = Vector3::new(
                self.sample(self.config.beam_spot_std),
                self.sample(self.config.beam_spot_std),
                0.0,
            );
            let tangent = Vector3::new(
                beam_slope[0] + self.sample(self.config.beam_divergence_std),
                beam_slope[1] + self.sample(self.config.beam_divergence_std),
                1.0,
            );

            for sensor_id in 0..truth.num_sensors() {
                let sensor = truth.sensor(sensor_id);
                let plane = truth.geometry().plane(sensor_id);

                // intersect the straight track with the physical plane
                let normal = plane.normal();
                let denominator = normal.dot(&tangent);
                if denominator.abs() < 1e-12 {
                    continue;
                }
                let t = -normal.dot(&(origin - plane.offset())) / denominator;
                let point = origin + t * tangent;
                let local =
                    plane.to_local(&Vector4::new(point[0], point[1], point[2], 0.0));

                let u = local[0] + self.sample(self.config.measurement_noise_std);
                let v = local[1] + self.sample(self.config.measurement_noise_std);
                let pixel = sensor.transform_local_to_pixel(&Vector4::new(u, v, 0.0, 0.0));
                let col = pixel[0].round() as i32;
                let row = pixel[1].round() as i32;
                if sensor.contains_address(col, row) {
                    hits[sensor_id].push((col, row, 0, 1));
                }
            }
        }

        for (sensor_id, sensor_hits) in hits.iter_mut().enumerate() {
            let sensor = truth.sensor(sensor_id);
            for _ in 0..self.config.noise_hits_per_sensor {
                let col = self.rng.gen_range(0..sensor.num_cols());
                let row = self.rng.gen_range(0..sensor.num_rows());
                sensor_hits.push((col, row, 0, 1));
            }
        }

        SimEvent {
            frame,
            timestamp: frame,
            hits,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::telescope::{telescope_device, with_shifted_sensor, TelescopeConfig};

    #[test]
    fn noiseless_central_beam_hits_the_center_pixel() {
        let device = telescope_device(&TelescopeConfig::default());
        let mut oracle = Oracle::new(
            1,
            OracleConfig {
                beam_spot_std: 0.0,
                beam_divergence_std: 0.0,
                ..Default::default()
            },
        );
        let events = oracle.generate(&device, 10);
        assert_eq!(events.len(), 10);
        for event in events {
            for sensor_hits in &event.hits {
                assert_eq!(sensor_hits.len(), 1);
                assert_eq!(sensor_hits[0].0, 128);
                assert_eq!(sensor_hits[0].1, 128);
            }
        }
    }

    #[test]
    fn generation_is_deterministic_per_seed() {
        let device = telescope_device(&TelescopeConfig::default());
        let config = OracleConfig {
            beam_spot_std: 1.0,
            measurement_noise_std: 0.005,
            ..Default::default()
        };
        let a = Oracle::new(42, config.clone()).generate(&device, 20);
        let b = Oracle::new(42, config).generate(&device, 20);
        for (ea, eb) in a.iter().zip(b.iter()) {
            assert_eq!(ea.hits, eb.hits);
        }
    }

    #[test]
    fn shifted_sensor_records_shifted_addresses() {
        let device = telescope_device(&TelescopeConfig::default());
        // moving the physical sensor +x means the particle crosses at a
        // smaller local coordinate, i.e. a smaller column address
        let truth = with_shifted_sensor(&device, 1, 0.25, 0.0);
        let mut oracle = Oracle::new(
            1,
            OracleConfig {
                beam_spot_std: 0.0,
                beam_divergence_std: 0.0,
                ..Default::default()
            },
        );
        let events = oracle.generate(&truth, 1);
        assert_eq!(events[0].hits[0][0].0, 128);
        assert_eq!(events[0].hits[1][0].0, 118);
        assert_eq!(events[0].hits[2][0].0, 128);
    }
}
