use super::ParamOptimizer;
use serde::{Deserialize, Serialize};

/// Epoch-keyed learning-rate schedule applied on top of the optimizer's base
/// learning rate.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum LrScheduler {
    Constant,
    /// Linear warmup from `warmup_factor` over `warmup_epochs`, then a decay by
    /// `gamma` at every milestone reached.
    WarmupMultiStep {
        milestones: Vec<usize>,
        gamma: f64,
        warmup_factor: f64,
        warmup_epochs: usize,
    },
}

impl LrScheduler {
    pub fn factor(&self, epoch: usize) -> f64 {
        match self {
            LrScheduler::Constant => 1.,
            LrScheduler::WarmupMultiStep {
                milestones,
                gamma,
                warmup_factor,
                warmup_epochs,
            } => {
                let warmup = if epoch < *warmup_epochs {
                    let alpha = epoch as f64 / *warmup_epochs as f64;
                    warmup_factor * (1. - alpha) + alpha
                } else {
                    1.
                };
                let decays = milestones.iter().filter(|m| **m <= epoch).count();
                warmup * gamma.powi(decays as i32)
            }
        }
    }

    /// Sets the optimizer's learning rate for `epoch`.
    pub fn step(&self, optimizer: &mut ParamOptimizer, epoch: usize) {
        optimizer.set_lr(optimizer.base_lr() * self.factor(epoch));
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_abs_diff_eq;

    #[test]
    fn warmup_then_step_decay() {
        let schedule = LrScheduler::WarmupMultiStep {
            milestones: vec![4, 6],
            gamma: 0.1,
            warmup_factor: 0.01,
            warmup_epochs: 2,
        };
        assert_abs_diff_eq!(schedule.factor(0), 0.01, epsilon = 1e-12);
        assert_abs_diff_eq!(schedule.factor(1), 0.505, epsilon = 1e-12);
        assert_abs_diff_eq!(schedule.factor(3), 1., epsilon = 1e-12);
        assert_abs_diff_eq!(schedule.factor(4), 0.1, epsilon = 1e-12);
        assert_abs_diff_eq!(schedule.factor(9), 0.01, epsilon = 1e-12);
    }
}
