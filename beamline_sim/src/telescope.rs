//! Synthetic telescope construction.

use std::sync::Arc;

use beamline_core::config::{Device, DeviceConfig, GeometryConfig, PlaneConfig, SensorConfig};
use nalgebra::{Matrix6, Vector6};

/// Parameters of a regular telescope along the +z axis.
#[derive(Debug, Clone)]
pub struct TelescopeConfig {
    pub num_planes: usize,
    /// Plane separation along the beam in mm.
    pub spacing: f64,
    pub num_cols: i32,
    pub num_rows: i32,
    /// Pixel pitch in mm, identical in both directions.
    pub pitch: f64,
    /// Beam slope covariance entries [var u, var v].
    pub beam_divergence_var: f64,
}

impl Default for TelescopeConfig {
    fn default() -> Self {
        Self {
            num_planes: 3,
            spacing: 50.0,
            num_cols: 256,
            num_rows: 256,
            pitch: 0.025,
            beam_divergence_var: 1e-8,
        }
    }
}

/// Build a nominal telescope device.
pub fn telescope_device(cfg: &TelescopeConfig) -> Arc<Device> {
    let sensors = (0..cfg.num_planes)
        .map(|i| SensorConfig {
            id: i,
            name: format!("tel{i}"),
            measurement: "pixel_binary".into(),
            num_cols: cfg.num_cols,
            num_rows: cfg.num_rows,
            timestamp_range: [0, 16],
            pitch_col: cfg.pitch,
            pitch_row: cfg.pitch,
            pitch_timestamp: 1.0,
            thickness: 0.3,
            x_x0: 0.001,
            regions: vec![],
            masked_pixels: vec![],
        })
        .collect();
    let planes = (0..cfg.num_planes)
        .map(|i| PlaneConfig {
            sensor: i,
            offset: [0.0, 0.0, cfg.spacing * i as f64],
            rotation: [0.0; 3],
        })
        .collect();
    let device_cfg = DeviceConfig {
        name: "sim-telescope".into(),
        beam: beamline_core::config::BeamConfig {
            direction: [0.0, 0.0, 1.0],
            slope_covariance: [cfg.beam_divergence_var, cfg.beam_divergence_var, 0.0],
        },
        sensors,
    };
    Arc::new(
        device_cfg
            .build(&GeometryConfig { planes })
            .expect("telescope configuration must be valid"),
    )
}

/// The same device with one sensor moved in the global frame.
pub fn with_shifted_sensor(device: &Device, sensor: usize, dx: f64, dy: f64) -> Arc<Device> {
    let mut geometry = device.geometry().clone();
    geometry.correct_global_offset(sensor, dx, dy, 0.0);
    Arc::new(device.with_geometry(geometry).expect("geometry stays valid"))
}

/// The same device with a six-parameter local correction on one sensor.
pub fn with_local_misalignment(device: &Device, sensor: usize, delta: &Vector6<f64>) -> Arc<Device> {
    let mut geometry = device.geometry().clone();
    geometry.correct_local(sensor, delta, &Matrix6::zeros());
    Arc::new(device.with_geometry(geometry).expect("geometry stays valid"))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn planes_are_placed_along_the_beam() {
        let device = telescope_device(&TelescopeConfig::default());
        assert_eq!(device.num_sensors(), 3);
        assert_eq!(device.geometry().plane(2).offset()[2], 100.0);
    }

    #[test]
    fn shifting_a_sensor_moves_only_that_plane() {
        let device = telescope_device(&TelescopeConfig::default());
        let shifted = with_shifted_sensor(&device, 1, 0.3, -0.2);
        assert_eq!(shifted.geometry().plane(1).offset()[0], 0.3);
        assert_eq!(shifted.geometry().plane(0).offset()[0], 0.0);
    }
}
