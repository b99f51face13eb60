//! Minimal histogramming backend.
//!
//! The analyzers only need to create 1-D and 2-D histograms, fill them
//! with optional weights, and query bin maxima, means, and the restricted
//! mean. Keeping this in-crate avoids a dependency on any particular
//! histogramming library.

/// An equidistant binning over a closed-open interval.
#[derive(Debug, Clone)]
pub struct HistAxis {
    low: f64,
    high: f64,
    bins: usize,
    label: String,
}

impl HistAxis {
    pub fn new(low: f64, high: f64, bins: usize, label: impl Into<String>) -> Self {
        assert!(low < high, "axis interval must not be empty");
        assert!(0 < bins, "axis must have at least one bin");
        Self {
            low,
            high,
            bins,
            label: label.into(),
        }
    }

    /// An axis over the interval with a bin size of roughly the pitch.
    pub fn with_pitch(low: f64, high: f64, pitch: f64, label: impl Into<String>) -> Self {
        let bins = (((high - low) / pitch).round() as usize).max(1);
        Self::new(low, high, bins, label)
    }

    /// An axis covering all differences b - a for a in `range_a` and b in
    /// `range_b`, binned with the finer of the two pitches.
    pub fn difference(
        range_a: (f64, f64),
        pitch_a: f64,
        range_b: (f64, f64),
        pitch_b: f64,
        label: impl Into<String>,
    ) -> Self {
        let low = range_b.0 - range_a.1;
        let high = range_b.1 - range_a.0;
        Self::with_pitch(low, high, pitch_a.min(pitch_b), label)
    }

    pub fn low(&self) -> f64 {
        self.low
    }

    pub fn high(&self) -> f64 {
        self.high
    }

    pub fn bins(&self) -> usize {
        self.bins
    }

    pub fn label(&self) -> &str {
        &self.label
    }

    /// Width of a single bin.
    pub fn bin_width(&self) -> f64 {
        (self.high - self.low) / self.bins as f64
    }

    /// Center of the given bin.
    pub fn center(&self, bin: usize) -> f64 {
        self.low + (bin as f64 + 0.5) * self.bin_width()
    }

    fn index(&self, value: f64) -> Option<usize> {
        if !value.is_finite() || (value < self.low) || (self.high <= value) {
            return None;
        }
        let bin = ((value - self.low) / self.bin_width()) as usize;
        Some(bin.min(self.bins - 1))
    }
}

/// One-dimensional weighted histogram.
#[derive(Debug, Clone)]
pub struct Hist1 {
    axis: HistAxis,
    data: Vec<f64>,
    entries: u64,
    sum_w: f64,
    sum_wx: f64,
    sum_wxx: f64,
}

impl Hist1 {
    pub fn new(axis: HistAxis) -> Self {
        let bins = axis.bins();
        Self {
            axis,
            data: vec![0.0; bins],
            entries: 0,
            sum_w: 0.0,
            sum_wx: 0.0,
            sum_wxx: 0.0,
        }
    }

    pub fn axis(&self) -> &HistAxis {
        &self.axis
    }

    pub fn fill(&mut self, value: f64) {
        self.fill_weighted(value, 1.0);
    }

    /// Fill with a weight; out-of-range and non-finite values are ignored.
    pub fn fill_weighted(&mut self, value: f64, weight: f64) {
        if let Some(bin) = self.axis.index(value) {
            self.data[bin] += weight;
            self.entries += 1;
            self.sum_w += weight;
            self.sum_wx += weight * value;
            self.sum_wxx += weight * value * value;
        }
    }

    pub fn entries(&self) -> u64 {
        self.entries
    }

    pub fn content(&self, bin: usize) -> f64 {
        self.data[bin]
    }

    /// The first bin holding the maximum content.
    pub fn max_bin(&self) -> usize {
        let mut best = 0;
        for bin in 1..self.data.len() {
            if self.data[best] < self.data[bin] {
                best = bin;
            }
        }
        best
    }

    /// Mean of the filled values inside the axis range.
    pub fn mean(&self) -> f64 {
        self.sum_wx / self.sum_w
    }

    /// Standard error of the mean.
    pub fn mean_error(&self) -> f64 {
        let var = self.sum_wxx / self.sum_w - self.mean() * self.mean();
        (var.max(0.0) / self.sum_w).sqrt()
    }

    /// Mean restricted to a window of bins around the maximum-content bin.
    ///
    /// Returns (mean, squared error of the mean) computed from the bin
    /// centers and contents inside the window, or None for an empty
    /// histogram.
    pub fn restricted_mean(&self, half_window: usize) -> Option<(f64, f64)> {
        if self.sum_w <= 0.0 {
            return None;
        }
        let peak = self.max_bin();
        let lo = peak.saturating_sub(half_window);
        let hi = (peak + half_window).min(self.axis.bins() - 1);

        let mut sum_w = 0.0;
        let mut sum_wx = 0.0;
        for bin in lo..=hi {
            sum_w += self.data[bin];
            sum_wx += self.data[bin] * self.axis.center(bin);
        }
        if sum_w <= 0.0 {
            return None;
        }
        let mean = sum_wx / sum_w;
        let mut var = 0.0;
        for bin in lo..=hi {
            let d = self.axis.center(bin) - mean;
            var += self.data[bin] * d * d;
        }
        var /= sum_w;
        Some((mean, var / sum_w))
    }
}

/// Two-dimensional weighted histogram.
#[derive(Debug, Clone)]
pub struct Hist2 {
    x: HistAxis,
    y: HistAxis,
    data: Vec<f64>,
}

impl Hist2 {
    pub fn new(x: HistAxis, y: HistAxis) -> Self {
        let size = x.bins() * y.bins();
        Self {
            x,
            y,
            data: vec![0.0; size],
        }
    }

    pub fn x_axis(&self) -> &HistAxis {
        &self.x
    }

    pub fn y_axis(&self) -> &HistAxis {
        &self.y
    }

    fn index(&self, i: usize, j: usize) -> usize {
        self.y.bins() * i + j
    }

    pub fn fill(&mut self, x: f64, y: f64) {
        self.fill_weighted(x, y, 1.0);
    }

    pub fn fill_weighted(&mut self, x: f64, y: f64, weight: f64) {
        if let (Some(i), Some(j)) = (self.x.index(x), self.y.index(y)) {
            let idx = self.index(i, j);
            self.data[idx] += weight;
        }
    }

    pub fn content(&self, i: usize, j: usize) -> f64 {
        self.data[self.index(i, j)]
    }

    pub fn set_content(&mut self, i: usize, j: usize, value: f64) {
        let idx = self.index(i, j);
        self.data[idx] = value;
    }

    /// Element-wise ratio of two histograms with identical binning.
    ///
    /// Bins with an empty denominator are zero.
    pub fn divided(numerator: &Hist2, denominator: &Hist2) -> Hist2 {
        assert_eq!(numerator.x.bins(), denominator.x.bins());
        assert_eq!(numerator.y.bins(), denominator.y.bins());
        let mut out = Hist2::new(numerator.x.clone(), numerator.y.clone());
        for (idx, value) in out.data.iter_mut().enumerate() {
            let den = denominator.data[idx];
            if 0.0 < den {
                *value = numerator.data[idx] / den;
            }
        }
        out
    }
}
