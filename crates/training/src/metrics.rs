use std::time::{Duration, Instant};

use crate::engine::StepReport;

#[derive(Debug, Clone)]
pub struct ExponentialMovingAverage {
    alpha: f64,
    value: Option<f64>,
}

impl ExponentialMovingAverage {
    pub fn new(alpha: f64) -> Self {
        Self { alpha, value: None }
    }

    pub fn update(&mut self, sample: f64) -> f64 {
        let v = match self.value {
            Some(prev) => self.alpha * sample + (1.0 - self.alpha) * prev,
            None => sample,
        };
        self.value = Some(v);
        v
    }

    pub fn value(&self) -> Option<f64> {
        self.value
    }
}

/// Running loss statistics for one epoch.
#[derive(Debug)]
pub struct EpochMetrics {
    epoch: usize,
    start_time: Instant,
    batches: usize,
    disc_sum: f64,
    gen_sum: f64,
    skipped_d: usize,
    skipped_g: usize,
    disc_ema: ExponentialMovingAverage,
    gen_ema: ExponentialMovingAverage,
}

impl EpochMetrics {
    pub fn new(epoch: usize) -> Self {
        Self {
            epoch,
            start_time: Instant::now(),
            batches: 0,
            disc_sum: 0.0,
            gen_sum: 0.0,
            skipped_d: 0,
            skipped_g: 0,
            disc_ema: ExponentialMovingAverage::new(0.1),
            gen_ema: ExponentialMovingAverage::new(0.1),
        }
    }

    pub fn record(&mut self, report: &StepReport) {
        self.batches += 1;
        self.disc_sum += report.loss_disc as f64;
        self.gen_sum += report.loss_gen_all as f64;
        self.skipped_d += usize::from(report.skipped_d);
        self.skipped_g += usize::from(report.skipped_g);
        self.disc_ema.update(report.loss_disc as f64);
        self.gen_ema.update(report.loss_gen_all as f64);
    }

    pub fn smoothed_losses(&self) -> (Option<f64>, Option<f64>) {
        (self.disc_ema.value(), self.gen_ema.value())
    }

    pub fn finish(self) -> EpochSummary {
        let mean = |sum: f64| {
            if self.batches == 0 {
                0.0
            } else {
                sum / self.batches as f64
            }
        };
        EpochSummary {
            epoch: self.epoch,
            batches: self.batches,
            mean_loss_disc: mean(self.disc_sum),
            mean_loss_gen: mean(self.gen_sum),
            skipped_d: self.skipped_d,
            skipped_g: self.skipped_g,
            duration: self.start_time.elapsed(),
        }
    }
}

#[derive(Debug, Clone)]
pub struct EpochSummary {
    pub epoch: usize,
    pub batches: usize,
    pub mean_loss_disc: f64,
    pub mean_loss_gen: f64,
    pub skipped_d: usize,
    pub skipped_g: usize,
    pub duration: Duration,
}
