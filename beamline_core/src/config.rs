//! Device and geometry configuration.
//!
//! The configuration splits into two parts that mirror their lifetimes:
//! the device file describes the immutable telescope (beam, sensors,
//! regions, masked pixels) and the geometry file the current sensor
//! placement, which alignment rewrites between iterations. Both are TOML.
//! All structural validation happens here, before any event is touched.

use nalgebra::{Matrix2, Vector3};
use serde::{Deserialize, Serialize};

use crate::error::Error;
use crate::geometry::{Geometry, Plane};
use crate::sensor::{DenseMask, Measurement, Region, Sensor};

/// The configured telescope: sensors plus their current geometry.
#[derive(Debug, Clone)]
pub struct Device {
    name: String,
    sensors: Vec<Sensor>,
    geometry: Geometry,
}

impl Device {
    /// Creates a device; the geometry must cover every sensor.
    pub fn new(name: impl Into<String>, sensors: Vec<Sensor>, geometry: Geometry) -> Result<Self, Error> {
        if sensors.len() != geometry.num_planes() {
            return Err(Error::config(format!(
                "device has {} sensors but geometry has {} planes",
                sensors.len(),
                geometry.num_planes()
            )));
        }
        Ok(Self {
            name: name.into(),
            sensors,
            geometry,
        })
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn num_sensors(&self) -> usize {
        self.sensors.len()
    }

    pub fn sensor(&self, id: usize) -> &Sensor {
        &self.sensors[id]
    }

    pub fn sensors(&self) -> &[Sensor] {
        &self.sensors
    }

    /// All sensor ids in configuration order.
    pub fn sensor_ids(&self) -> Vec<usize> {
        (0..self.sensors.len()).collect()
    }

    pub fn geometry(&self) -> &Geometry {
        &self.geometry
    }

    /// The same device with a replaced geometry, e.g. after alignment.
    pub fn with_geometry(&self, geometry: Geometry) -> Result<Self, Error> {
        Self::new(self.name.clone(), self.sensors.clone(), geometry)
    }
}

/// Beam parameters in the global frame.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BeamConfig {
    /// Beam direction, normalized on load.
    pub direction: [f64; 3],
    /// Slope covariance [var(dx/dz), var(dy/dz), cov].
    #[serde(default)]
    pub slope_covariance: [f64; 3],
}

impl Default for BeamConfig {
    fn default() -> Self {
        Self {
            direction: [0.0, 0.0, 1.0],
            slope_covariance: [0.0; 3],
        }
    }
}

/// A named rectangle of pixel addresses.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RegionConfig {
    pub name: String,
    pub col_min: i32,
    pub col_max: i32,
    pub row_min: i32,
    pub row_max: i32,
}

/// One sensor entry in the device file.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SensorConfig {
    pub id: usize,
    pub name: String,
    pub measurement: String,
    pub num_cols: i32,
    pub num_rows: i32,
    #[serde(default = "default_timestamp_range")]
    pub timestamp_range: [i32; 2],
    pub pitch_col: f64,
    pub pitch_row: f64,
    #[serde(default = "default_pitch_timestamp")]
    pub pitch_timestamp: f64,
    #[serde(default)]
    pub thickness: f64,
    #[serde(default)]
    pub x_x0: f64,
    #[serde(default)]
    pub regions: Vec<RegionConfig>,
    #[serde(default)]
    pub masked_pixels: Vec<[i32; 2]>,
}

fn default_timestamp_range() -> [i32; 2] {
    [0, 16]
}

fn default_pitch_timestamp() -> f64 {
    1.0
}

/// The device file: beam and sensor list.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DeviceConfig {
    #[serde(default = "default_device_name")]
    pub name: String,
    #[serde(default)]
    pub beam: BeamConfig,
    pub sensors: Vec<SensorConfig>,
}

fn default_device_name() -> String {
    "telescope".into()
}

/// One plane entry in the geometry file.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PlaneConfig {
    pub sensor: usize,
    pub offset: [f64; 3],
    /// Rotation angles [alpha, beta, gamma] in radian.
    #[serde(default)]
    pub rotation: [f64; 3],
}

/// The geometry file: one placement per sensor.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GeometryConfig {
    pub planes: Vec<PlaneConfig>,
}

impl DeviceConfig {
    /// Parse a device file.
    pub fn from_toml(text: &str) -> Result<Self, Error> {
        toml::from_str(text).map_err(|e| Error::config(format!("device file: {e}")))
    }

    /// Parse a device file from disk.
    pub fn load(path: &std::path::Path) -> Result<Self, Error> {
        Self::from_toml(&std::fs::read_to_string(path)?)
    }

    /// Build the device, validating sensors and the geometry.
    pub fn build(&self, geometry: &GeometryConfig) -> Result<Device, Error> {
        if self.sensors.is_empty() {
            return Err(Error::config("device has no sensors"));
        }
        for (i, cfg) in self.sensors.iter().enumerate() {
            if cfg.id != i {
                return Err(Error::config(format!(
                    "sensor ids must be consecutive from zero, got id {} at position {}",
                    cfg.id, i
                )));
            }
        }
        for i in 0..self.sensors.len() {
            for j in (i + 1)..self.sensors.len() {
                if self.sensors[i].name == self.sensors[j].name {
                    return Err(Error::config(format!(
                        "sensors {} and {} share the name '{}'",
                        i, j, self.sensors[i].name
                    )));
                }
            }
        }

        let mut sensors = Vec::with_capacity(self.sensors.len());
        for cfg in self.sensors.iter() {
            let regions = cfg
                .regions
                .iter()
                .map(|r| Region {
                    name: r.name.clone(),
                    col_min: r.col_min,
                    col_max: r.col_max,
                    row_min: r.row_min,
                    row_max: r.row_max,
                })
                .collect();
            let masked: Vec<(i32, i32)> = cfg.masked_pixels.iter().map(|p| (p[0], p[1])).collect();
            sensors.push(Sensor::new(
                cfg.id,
                cfg.name.clone(),
                Measurement::from_name(&cfg.measurement)?,
                cfg.num_cols,
                cfg.num_rows,
                (cfg.timestamp_range[0], cfg.timestamp_range[1]),
                cfg.pitch_col,
                cfg.pitch_row,
                cfg.pitch_timestamp,
                cfg.thickness,
                cfg.x_x0,
                regions,
                DenseMask::from_masked_pixels(&masked),
            )?);
        }

        Device::new(self.name.clone(), sensors, geometry.build(self)?)
    }
}

impl GeometryConfig {
    /// Parse a geometry file.
    pub fn from_toml(text: &str) -> Result<Self, Error> {
        toml::from_str(text).map_err(|e| Error::config(format!("geometry file: {e}")))
    }

    /// Parse a geometry file from disk.
    pub fn load(path: &std::path::Path) -> Result<Self, Error> {
        Self::from_toml(&std::fs::read_to_string(path)?)
    }

    /// Build the geometry for the given device configuration.
    pub fn build(&self, device: &DeviceConfig) -> Result<Geometry, Error> {
        let mut planes: Vec<Option<Plane>> = vec![None; device.sensors.len()];
        for cfg in self.planes.iter() {
            let slot = planes.get_mut(cfg.sensor).ok_or_else(|| {
                Error::config(format!("geometry references unknown sensor {}", cfg.sensor))
            })?;
            if slot.is_some() {
                return Err(Error::config(format!(
                    "geometry defines sensor {} twice",
                    cfg.sensor
                )));
            }
            *slot = Some(Plane::from_angles(
                Vector3::new(cfg.offset[0], cfg.offset[1], cfg.offset[2]),
                cfg.rotation[0],
                cfg.rotation[1],
                cfg.rotation[2],
            ));
        }
        let planes = planes
            .into_iter()
            .enumerate()
            .map(|(i, p)| p.ok_or_else(|| Error::config(format!("no geometry for sensor {i}"))))
            .collect::<Result<Vec<_>, _>>()?;

        let dir = Vector3::from_column_slice(&device.beam.direction);
        if dir.norm() == 0.0 {
            return Err(Error::config("beam direction must not be null"));
        }
        let sc = device.beam.slope_covariance;
        let slope_cov = Matrix2::new(sc[0], sc[2], sc[2], sc[1]);
        Ok(Geometry::new(planes, dir, slope_cov))
    }

    /// Export a geometry back into its file representation.
    pub fn from_geometry(geometry: &Geometry) -> Self {
        let planes = (0..geometry.num_planes())
            .map(|i| {
                let plane = geometry.plane(i);
                let rot = nalgebra::Rotation3::from_matrix_unchecked(*plane.rotation());
                let (alpha, beta, gamma) = rot.euler_angles();
                PlaneConfig {
                    sensor: i,
                    offset: [plane.offset()[0], plane.offset()[1], plane.offset()[2]],
                    rotation: [alpha, beta, gamma],
                }
            })
            .collect();
        Self { planes }
    }

    /// Serialize to TOML.
    pub fn to_toml(&self) -> Result<String, Error> {
        toml::to_string_pretty(self).map_err(|e| Error::config(format!("geometry export: {e}")))
    }
}
