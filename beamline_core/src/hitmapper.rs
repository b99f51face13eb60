//! Hit preprocessing: address validation, pixel masking, and region
//! assignment. Runs before clustering.

use std::sync::Arc;

use tracing::error;

use crate::config::Device;
use crate::error::Error;
use crate::event::Event;
use crate::pipeline::Processor;

/// Drops invalid or masked hits and assigns region indices.
///
/// Hits with addresses outside the pixel matrix are reported as per-event
/// faults and removed; hits on masked pixels are removed silently since
/// masking is expected. Devices with a readout-to-matrix address mapping
/// keep their digital address and get the physical address assigned here;
/// the default mapping is the identity.
pub struct HitMapper {
    device: Arc<Device>,
}

impl HitMapper {
    pub fn new(device: Arc<Device>) -> Self {
        Self { device }
    }
}

impl Processor for HitMapper {
    fn name(&self) -> &str {
        "HitMapper"
    }

    fn execute(&self, event: &mut Event) -> Result<(), Error> {
        let frame = event.frame();
        for sensor_id in 0..self.device.num_sensors() {
            let sensor = self.device.sensor(sensor_id);
            let sensor_event = event.sensor_event_mut(sensor_id);

            let mut dropped_outside = 0usize;
            sensor_event.retain_hits(|hit| {
                if !sensor.contains_address(hit.col(), hit.row()) {
                    dropped_outside += 1;
                    return false;
                }
                !sensor.pixel_mask().is_masked(hit.col(), hit.row())
            });
            if 0 < dropped_outside {
                error!(
                    "dropped {} out-of-matrix hits event={} sensor={}",
                    dropped_outside, frame, sensor_id
                );
            }

            if sensor.has_regions() {
                for i in 0..sensor_event.num_hits() {
                    let (col, row) = {
                        let hit = sensor_event.hit(i);
                        (hit.col(), hit.row())
                    };
                    if let Some(region) = sensor.region_of(col, row) {
                        sensor_event.hit_mut(i).set_region(region);
                    }
                }
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{DeviceConfig, GeometryConfig, PlaneConfig, RegionConfig, SensorConfig};

    fn one_sensor_device(masked: Vec<[i32; 2]>, regions: Vec<RegionConfig>) -> Arc<Device> {
        let cfg = DeviceConfig {
            name: "test".into(),
            beam: Default::default(),
            sensors: vec![SensorConfig {
                id: 0,
                name: "s0".into(),
                measurement: "pixel_binary".into(),
                num_cols: 16,
                num_rows: 16,
                timestamp_range: [0, 16],
                pitch_col: 0.025,
                pitch_row: 0.025,
                pitch_timestamp: 1.0,
                thickness: 0.0,
                x_x0: 0.0,
                regions,
                masked_pixels: masked,
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
    fn drops_masked_and_out_of_matrix_hits() {
        let device = one_sensor_device(vec![[5, 5]], vec![]);
        let mapper = HitMapper::new(device);
        let mut event = Event::new(1);
        event.clear(0, 0);
        event.sensor_event_mut(0).add_hit(1, 1, 0, 1);
        event.sensor_event_mut(0).add_hit(5, 5, 0, 1); // masked
        event.sensor_event_mut(0).add_hit(100, 1, 0, 1); // outside

        mapper.execute(&mut event).unwrap();
        assert_eq!(event.sensor_event(0).num_hits(), 1);
        assert_eq!(event.sensor_event(0).hit(0).col(), 1);
    }

    #[test]
    fn assigns_regions() {
        let device = one_sensor_device(
            vec![],
            vec![RegionConfig {
                name: "left".into(),
                col_min: 0,
                col_max: 7,
                row_min: 0,
                row_max: 15,
            }],
        );
        let mapper = HitMapper::new(device);
        let mut event = Event::new(1);
        event.clear(0, 0);
        event.sensor_event_mut(0).add_hit(3, 3, 0, 1);
        event.sensor_event_mut(0).add_hit(12, 3, 0, 1);

        mapper.execute(&mut event).unwrap();
        assert_eq!(event.sensor_event(0).hit(0).region(), Some(0));
        assert_eq!(event.sensor_event(0).hit(1).region(), None);
    }
}
