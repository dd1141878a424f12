//! Learning rate schedules.

/// Learning rate scheduler stepped once per optimizer step.
pub trait LRScheduler {
    fn get_lr(&self) -> f64;

    fn step(&mut self);
}

/// Linear warmup from 0 to `base_lr` over `warmup_steps`, then linear decay
/// to 0 at `total_steps`.
///
/// ```text
/// t < warmup:  lr = base_lr * t / warmup
/// otherwise:   lr = base_lr * max(0, (total - t) / (total - warmup))
/// ```
#[derive(Debug, Clone)]
pub struct LinearWarmupSchedule {
    base_lr: f64,
    warmup_steps: usize,
    total_steps: usize,
    current_step: usize,
}

impl LinearWarmupSchedule {
    pub fn new(base_lr: f64, warmup_steps: usize, total_steps: usize) -> Self {
        Self {
            base_lr,
            warmup_steps,
            total_steps,
            current_step: 0,
        }
    }

    pub fn current_step(&self) -> usize {
        self.current_step
    }

    fn factor(&self) -> f64 {
        let t = self.current_step as f64;
        if self.current_step < self.warmup_steps {
            return t / self.warmup_steps.max(1) as f64;
        }
        let remaining = self.total_steps.saturating_sub(self.current_step) as f64;
        let decay = self.total_steps.saturating_sub(self.warmup_steps).max(1) as f64;
        (remaining / decay).max(0.0)
    }
}

impl LRScheduler for LinearWarmupSchedule {
    fn get_lr(&self) -> f64 {
        self.base_lr * self.factor()
    }

    fn step(&mut self) {
        self.current_step += 1;
    }
}
