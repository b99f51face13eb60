//! Hit efficiency from tracks and matched clusters on a single sensor.

use std::sync::Arc;

use tracing::info;

use crate::config::Device;
use crate::error::Error;
use crate::event::Event;
use crate::histogram::{Hist1, Hist2, HistAxis};
use crate::pipeline::Analyzer;
use crate::sensor::DenseMask;
use crate::stats::StatAccumulator;

/// Per-pixel and in-pixel efficiency maps for one sensor.
///
/// Every local track state counts towards the total; states with a matched
/// cluster count as passed. Tracks through the (outset) pixel mask are
/// vetoed. Efficiencies are published at finalize.
pub struct Efficiency {
    device: Arc<Device>,
    sensor_id: usize,
    name: String,
    mask: DenseMask,
    fold_origin: (f64, f64),
    fold_length: (f64, f64),
    total: Hist2,
    pass: Hist2,
    col_total: Hist1,
    col_pass: Hist1,
    row_total: Hist1,
    row_pass: Hist1,
    in_pix_total: Hist2,
    in_pix_pass: Hist2,
    efficiency: Option<Hist2>,
    efficiency_dist: Option<Hist1>,
}

impl Efficiency {
    /// * `increase_area` extends the maps beyond the nominal edge, in pixels
    /// * `masked_pixel_range` vetoes tracks around masked pixels, 0 disables
    /// * `in_pixel_period` folding period in pixels
    /// * `in_pixel_bins_min` minimum number of bins along the smaller pitch
    pub fn new(
        device: Arc<Device>,
        sensor_id: usize,
        increase_area: i32,
        masked_pixel_range: i32,
        in_pixel_period: i32,
        in_pixel_bins_min: i32,
    ) -> Result<Self, Error> {
        if increase_area < 0 {
            return Err(Error::config("increase_area must not be negative"));
        }
        if masked_pixel_range < 0 {
            return Err(Error::config("masked_pixel_range must not be negative"));
        }
        if in_pixel_period < 1 {
            return Err(Error::config("in_pixel_period must be 1 or larger"));
        }
        if in_pixel_bins_min < 1 {
            return Err(Error::config("in_pixel_bins_min must be 1 or larger"));
        }

        let sensor = device.sensor(sensor_id);
        let mask = if 0 < masked_pixel_range {
            sensor.pixel_mask().protruded(masked_pixel_range - 1)
        } else {
            DenseMask::default()
        };

        let inc = increase_area as f64;
        let ((c0, c1), (r0, r1)) = sensor.sensitive_area_pixel();
        let ax_col = HistAxis::new(
            c0 - inc,
            c1 + inc,
            (sensor.num_cols() + 2 * increase_area) as usize,
            "Track column",
        );
        let ax_row = HistAxis::new(
            r0 - inc,
            r1 + inc,
            (sensor.num_rows() + 2 * increase_area) as usize,
            "Track row",
        );

        let ((u0, _), (v0, _)) = sensor.sensitive_area_local();
        let fold_length = (
            in_pixel_period as f64 * sensor.pitch_col(),
            in_pixel_period as f64 * sensor.pitch_row(),
        );
        // approximately quadratic bins in metric units
        let fold_bin_size = sensor.pitch_col().min(sensor.pitch_row()) / in_pixel_bins_min as f64;
        let fold_bins_u = (fold_length.0 / fold_bin_size).round() as usize;
        let fold_bins_v = (fold_length.1 / fold_bin_size).round() as usize;
        let ax_fold_u = HistAxis::new(0.0, fold_length.0, fold_bins_u, "Folded track position u");
        let ax_fold_v = HistAxis::new(0.0, fold_length.1, fold_bins_v, "Folded track position v");

        let name = format!("Efficiency({})", sensor.name());
        Ok(Self {
            device: device.clone(),
            sensor_id,
            name,
            mask,
            fold_origin: (u0, v0),
            fold_length,
            total: Hist2::new(ax_col.clone(), ax_row.clone()),
            pass: Hist2::new(ax_col.clone(), ax_row.clone()),
            col_total: Hist1::new(ax_col.clone()),
            col_pass: Hist1::new(ax_col),
            row_total: Hist1::new(ax_row.clone()),
            row_pass: Hist1::new(ax_row),
            in_pix_total: Hist2::new(ax_fold_u.clone(), ax_fold_v.clone()),
            in_pix_pass: Hist2::new(ax_fold_u, ax_fold_v),
            efficiency: None,
            efficiency_dist: None,
        })
    }

    /// Per-pixel efficiency map, available after finalize.
    pub fn efficiency(&self) -> Option<&Hist2> {
        self.efficiency.as_ref()
    }

    /// Distribution of per-pixel efficiencies, available after finalize.
    pub fn efficiency_dist(&self) -> Option<&Hist1> {
        self.efficiency_dist.as_ref()
    }

    /// Folded in-pixel efficiency map.
    pub fn in_pixel_efficiency(&self) -> Hist2 {
        Hist2::divided(&self.in_pix_pass, &self.in_pix_total)
    }
}

impl Analyzer for Efficiency {
    fn name(&self) -> &str {
        &self.name
    }

    fn execute(&mut self, event: &Event) -> Result<(), Error> {
        let sensor = self.device.sensor(self.sensor_id);
        let sensor_event = event.sensor_event(self.sensor_id);

        for (_, state) in sensor_event.local_states() {
            let pos_pixel = sensor.transform_local_to_pixel(&state.position());
            if !pos_pixel[0].is_finite() || !pos_pixel[1].is_finite() {
                continue;
            }

            // ignore tracks that fall within the masked area
            let col = pos_pixel[0].round() as i32;
            let row = pos_pixel[1].round() as i32;
            if self.mask.is_masked(col, row) {
                continue;
            }

            let mut folded_u = state.loc0() - self.fold_origin.0;
            let mut folded_v = state.loc1() - self.fold_origin.1;
            folded_u -= self.fold_length.0 * (folded_u / self.fold_length.0).floor();
            folded_v -= self.fold_length.1 * (folded_v / self.fold_length.1).floor();

            self.total.fill(pos_pixel[0], pos_pixel[1]);
            self.col_total.fill(pos_pixel[0]);
            self.row_total.fill(pos_pixel[1]);
            self.in_pix_total.fill(folded_u, folded_v);
            if state.is_matched() {
                self.pass.fill(pos_pixel[0], pos_pixel[1]);
                self.col_pass.fill(pos_pixel[0]);
                self.row_pass.fill(pos_pixel[1]);
                self.in_pix_pass.fill(folded_u, folded_v);
            }
        }
        Ok(())
    }

    fn finalize(&mut self) -> Result<(), Error> {
        let efficiency = Hist2::divided(&self.pass, &self.total);

        let mut dist = Hist1::new(HistAxis::new(0.0, 1.0 + 1e-9, 100, "Pixel efficiency"));
        let mut stats = StatAccumulator::new();
        for i in 0..self.total.x_axis().bins() {
            for j in 0..self.total.y_axis().bins() {
                if 0.0 < self.total.content(i, j) {
                    dist.fill(efficiency.content(i, j));
                    stats.fill(efficiency.content(i, j));
                }
            }
        }

        info!("efficiency for {}", self.device.sensor(self.sensor_id).name());
        if 0 < stats.entries() {
            let median = dist.axis().center(dist.max_bin());
            info!("  median: {:.4}", median);
            info!("  mean: {:.4} +- {:.4}", dist.mean(), dist.mean_error());
            info!("  range: {:.4} - {:.4}", stats.min(), stats.max());
        }

        self.efficiency = Some(efficiency);
        self.efficiency_dist = Some(dist);
        Ok(())
    }
}
