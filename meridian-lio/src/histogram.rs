//! Fixed-bin histogram for residual diagnostics

/// Collects samples and renders a one-line bin summary for the logs.
#[derive(Default)]
pub struct Histogram {
    samples: Vec<f64>,
}

impl Histogram {
    pub fn add(&mut self, value: f64) {
        self.samples.push(value);
    }

    pub fn len(&self) -> usize {
        self.samples.len()
    }

    pub fn is_empty(&self) -> bool {
        self.samples.is_empty()
    }

    /// Render counts over `bins` equal-width bins spanning the data range.
    pub fn summary(&self, bins: usize) -> String {
        if self.samples.is_empty() {
            return "empty".to_string();
        }
        let min = self.samples.iter().cloned().fold(f64::INFINITY, f64::min);
        let max = self
            .samples
            .iter()
            .cloned()
            .fold(f64::NEG_INFINITY, f64::max);
        if (max - min) < 1e-300 {
            return format!("n={} all={:.6}", self.samples.len(), min);
        }

        let width = (max - min) / bins as f64;
        let mut counts = vec![0usize; bins];
        for &s in &self.samples {
            let idx = (((s - min) / width) as usize).min(bins - 1);
            counts[idx] += 1;
        }
        format!(
            "n={} min={:.6} max={:.6} bins={:?}",
            self.samples.len(),
            min,
            max,
            counts
        )
    }
}
