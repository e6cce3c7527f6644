//! Plateau based learning rate decay.
//!
//! The learning rate is multiplied by `factor` once the monitored loss has failed to improve on its
//! best value by a relative `threshold` for more than `patience` consecutive steps, and it is never
//! taken below `min_lr`.

// Decays smaller than this are not applied.
const EPSILON: f64 = 1e-8;

#[derive(Debug, Clone, PartialEq)]
pub struct ReduceOnPlateau {
    learning_rate: f64,
    factor: f64,
    patience: usize,
    min_lr: f64,
    threshold: f64,
    cooldown: usize,
    cooldown_counter: usize,
    best: f64,
    bad_epochs: usize,
}

impl ReduceOnPlateau {
    pub fn new(learning_rate: f64, factor: f64, patience: usize, min_lr: f64) -> Self {
        Self {
            learning_rate,
            factor,
            patience,
            min_lr,
            threshold: 1e-4,
            cooldown: 0,
            cooldown_counter: 0,
            best: f64::INFINITY,
            bad_epochs: 0,
        }
    }

    pub fn with_threshold(mut self, threshold: f64) -> Self {
        self.threshold = threshold;
        self
    }

    pub fn with_cooldown(mut self, cooldown: usize) -> Self {
        self.cooldown = cooldown;
        self
    }

    pub fn learning_rate(&self) -> f64 {
        self.learning_rate
    }

    fn is_improvement(&self, metric: f64) -> bool {
        metric < self.best * (1.0 - self.threshold)
    }

    /// Records the loss of an epoch and returns the learning rate for the next one.
    pub fn step(&mut self, metric: f64) -> f64 {
        if self.is_improvement(metric) {
            self.best = metric;
            self.bad_epochs = 0;
        } else {
            self.bad_epochs += 1;
        }

        if self.cooldown_counter > 0 {
            self.cooldown_counter -= 1;
            self.bad_epochs = 0;
        }

        if self.bad_epochs > self.patience {
            let decayed = (self.learning_rate * self.factor).max(self.min_lr);

            if self.learning_rate - decayed > EPSILON {
                tracing::info!(
                    from = self.learning_rate,
                    to = decayed,
                    "reducing learning rate"
                );
                self.learning_rate = decayed;
            }

            self.cooldown_counter = self.cooldown;
            self.bad_epochs = 0;
        }

        self.learning_rate
    }
}
