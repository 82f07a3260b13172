// Step arithmetic and the learning-rate schedule

/// Batch and cadence values derived from the dataset size
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct StepPlan {
    /// per-device batch x accumulation x world size (ddp only)
    pub effective_batch_size: usize,
    /// Optimizer steps covering one pass over the data (integer floor)
    pub total_optim_steps: usize,
    pub save_steps: usize,
    pub eval_steps: usize,
    pub warmup_steps: usize,
}

impl StepPlan {
    pub fn compute(
        per_device_batch_size: usize,
        gradient_accumulation_steps: usize,
        world_size: usize,
        ddp: bool,
        num_rows: usize,
    ) -> Self {
        let processes = if ddp { world_size } else { 1 };
        let effective_batch_size = per_device_batch_size * gradient_accumulation_steps * processes;
        let total_optim_steps = num_rows.checked_div(effective_batch_size).unwrap_or(0);
        let cadence = total_optim_steps / 10;

        Self {
            effective_batch_size,
            total_optim_steps,
            save_steps: cadence,
            eval_steps: cadence,
            warmup_steps: cadence,
        }
    }
}

/// Linear warmup to the base rate, then linear decay to zero at `total_steps`
#[derive(Debug, Clone, Copy)]
pub struct LinearSchedule {
    base_lr: f64,
    warmup_steps: usize,
    total_steps: usize,
}

impl LinearSchedule {
    pub fn new(base_lr: f64, warmup_steps: usize, total_steps: usize) -> Self {
        Self {
            base_lr,
            warmup_steps,
            total_steps,
        }
    }

    /// Rate for the optimizer step taken after `step` completed steps
    pub fn lr(&self, step: usize) -> f64 {
        if step < self.warmup_steps {
            return self.base_lr * step as f64 / self.warmup_steps.max(1) as f64;
        }
        let remaining = self.total_steps.saturating_sub(step) as f64;
        let span = self.total_steps.saturating_sub(self.warmup_steps).max(1) as f64;
        self.base_lr * (remaining / span).max(0.0)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_reference_scenario() {
        let plan = StepPlan::compute(4, 2, 8, false, 100);
        assert_eq!(plan.effective_batch_size, 8);
        assert_eq!(plan.total_optim_steps, 12);
        assert_eq!(plan.save_steps, 1);
        assert_eq!(plan.eval_steps, 1);
        assert_eq!(plan.warmup_steps, 1);
    }

    #[test]
    fn test_world_size_only_counts_under_ddp() {
        let plan = StepPlan::compute(4, 8, 2, true, 1000);
        assert_eq!(plan.effective_batch_size, 64);
        assert_eq!(plan.total_optim_steps, 15);
        assert_eq!(plan.warmup_steps, 1);
    }

    #[test]
    fn test_small_dataset_gives_zero_cadence() {
        let plan = StepPlan::compute(4, 8, 1, false, 20);
        assert_eq!(plan.total_optim_steps, 0);
        assert_eq!(plan.save_steps, 0);
    }

    #[test]
    fn test_linear_warmup_then_decay() {
        let schedule = LinearSchedule::new(1.0, 2, 10);
        assert_eq!(schedule.lr(0), 0.0);
        assert_eq!(schedule.lr(1), 0.5);
        assert_eq!(schedule.lr(2), 1.0);
        assert!((schedule.lr(6) - 0.5).abs() < 1e-12);
        assert_eq!(schedule.lr(10), 0.0);
        assert_eq!(schedule.lr(12), 0.0);
    }

    #[test]
    fn test_no_warmup_starts_at_base_rate() {
        let schedule = LinearSchedule::new(3e-4, 0, 4);
        assert_eq!(schedule.lr(0), 3e-4);
    }
}
