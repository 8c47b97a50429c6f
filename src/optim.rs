use crate::error::{ReidError, Result};
use crate::model::param::{NamedParam, ParamId};
use ndarray::ArrayD;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;

pub use adam::AdamParameters;
pub use scheduler::LrScheduler;
pub use sgd_momentum::SgdmParameters;

mod adam;
mod scheduler;
mod sgd;
mod sgd_momentum;

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub enum OptimizerType {
    Adam(AdamParameters),
    Sgd,
    SgdMomentum(SgdmParameters),
}

/// Hyperparameters that survive an optimizer rebuild.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct OptimizerDefaults {
    pub kind: OptimizerType,
    pub lr: f64,
    pub weight_decay: f64,
}

enum ParamState {
    Adam(adam::Adam),
    Sgd(sgd::Sgd),
    SgdMomentum(sgd_momentum::SgdMomentum),
}

impl ParamState {
    fn init(kind: &OptimizerType, shape: &[usize]) -> Self {
        match kind {
            OptimizerType::Adam(params) => ParamState::Adam(adam::Adam::new(params, shape)),
            OptimizerType::Sgd => ParamState::Sgd(sgd::Sgd::new()),
            OptimizerType::SgdMomentum(params) => {
                ParamState::SgdMomentum(sgd_momentum::SgdMomentum::new(params, shape))
            }
        }
    }

    fn optimize(&mut self, changes: &ArrayD<f64>, lr: f64) -> ArrayD<f64> {
        let changes = changes.view();
        match self {
            ParamState::Adam(optimizer) => optimizer.optimize(&changes, lr),
            ParamState::Sgd(optimizer) => optimizer.optimize(&changes, lr),
            ParamState::SgdMomentum(optimizer) => optimizer.optimize(&changes, lr),
        }
    }
}

/// Optimizer bound to an explicit, ordered set of parameters. Per-parameter
/// state is created lazily on the first step that sees a gradient.
pub struct ParamOptimizer {
    defaults: OptimizerDefaults,
    lr: f64,
    params: Vec<ParamId>,
    state: HashMap<ParamId, Option<ParamState>>,
}

impl ParamOptimizer {
    pub fn new(defaults: OptimizerDefaults, params: Vec<ParamId>) -> Self {
        let state = params.iter().map(|id| (*id, None)).collect();
        ParamOptimizer {
            lr: defaults.lr,
            defaults,
            params,
            state,
        }
    }

    /// Same hyperparameters over a new parameter set; all state is dropped.
    pub fn rebuild(&self, params: Vec<ParamId>) -> Self {
        Self::new(self.defaults, params)
    }

    pub fn defaults(&self) -> &OptimizerDefaults {
        &self.defaults
    }

    pub fn param_ids(&self) -> &[ParamId] {
        &self.params
    }

    pub fn base_lr(&self) -> f64 {
        self.defaults.lr
    }

    pub fn lr(&self) -> f64 {
        self.lr
    }

    pub fn set_lr(&mut self, lr: f64) {
        self.lr = lr;
    }

    /// Applies one update to every parameter that carries a gradient.
    pub fn step(&mut self, params: &mut [NamedParam]) -> Result<()> {
        if let Some(unbound) = params.iter().find(|p| !self.state.contains_key(&p.slot.id)) {
            return Err(ReidError::Config(format!(
                "parameter {} is not bound to the optimizer",
                unbound.name
            )));
        }
        for param in params.iter_mut() {
            let Some(grad) = &param.slot.grad else {
                continue;
            };
            let mut changes = grad.to_owned();
            if self.defaults.weight_decay != 0. {
                changes.scaled_add(self.defaults.weight_decay, &param.slot.value);
            }
            let state = self
                .state
                .get_mut(&param.slot.id)
                .ok_or_else(|| ReidError::Config(format!("no state for {}", param.name)))?
                .get_or_insert_with(|| ParamState::init(&self.defaults.kind, changes.shape()));
            let update = state.optimize(&changes, self.lr);
            param.slot.value -= &update;
        }
        Ok(())
    }

    /// Number of parameters with optimizer state.
    pub fn state_len(&self) -> usize {
        self.state.values().filter(|state| state.is_some()).count()
    }
}

/// Optimizer, schedule and epoch bounds as consumed by the training engine.
pub struct Optimizer {
    pub optimizer: ParamOptimizer,
    pub lr_scheduler: LrScheduler,
    pub max_epochs: usize,
    /// Epochs at the start of training during which the backbone is frozen.
    pub fix_backbone_epochs: usize,
}

impl Optimizer {
    pub fn new(optimizer: ParamOptimizer, lr_scheduler: LrScheduler, max_epochs: usize) -> Self {
        Optimizer {
            optimizer,
            lr_scheduler,
            max_epochs,
            fix_backbone_epochs: 0,
        }
    }

    pub fn with_fixed_backbone(mut self, epochs: usize) -> Self {
        self.fix_backbone_epochs = epochs;
        self
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::param::{Module, Param};
    use ndarray::{array, Ix1};

    struct Weights {
        a: Param<Ix1>,
        b: Param<Ix1>,
    }

    impl Module for Weights {
        fn params<'a>(&'a mut self, prefix: &str, out: &mut Vec<NamedParam<'a>>) {
            out.push(NamedParam::new(format!("{}a", prefix), &mut self.a));
            out.push(NamedParam::new(format!("{}b", prefix), &mut self.b));
        }
    }

    fn defaults(kind: OptimizerType) -> OptimizerDefaults {
        OptimizerDefaults {
            kind,
            lr: 0.5,
            weight_decay: 0.,
        }
    }

    #[test]
    fn sgd_skips_params_without_gradient() {
        let mut weights = Weights {
            a: Param::new(array![1., 1.]),
            b: Param::new(array![1., 1.]),
        };
        let mut optimizer =
            ParamOptimizer::new(defaults(OptimizerType::Sgd), vec![weights.a.id(), weights.b.id()]);
        weights.a.accumulate_grad(&array![1., -2.]);
        let mut params = vec![];
        weights.params("", &mut params);
        optimizer.step(&mut params).unwrap();
        drop(params);
        assert_eq!(weights.a.value(), &array![0.5, 2.]);
        assert_eq!(weights.b.value(), &array![1., 1.]);
    }

    #[test]
    fn rebuild_keeps_hyperparameters_and_drops_state() {
        let kind = OptimizerType::SgdMomentum(SgdmParameters { momentum: 0.9 });
        let mut weights = Weights {
            a: Param::new(array![0.]),
            b: Param::new(array![0.]),
        };
        let mut optimizer = ParamOptimizer::new(defaults(kind), vec![weights.a.id()]);
        optimizer.set_lr(0.01);
        weights.a.accumulate_grad(&array![1.]);
        let mut params = vec![];
        weights.params("", &mut params);
        params.truncate(1);
        optimizer.step(&mut params).unwrap();
        assert_eq!(optimizer.state_len(), 1);

        let rebuilt = optimizer.rebuild(vec![weights.b.id()]);
        assert_eq!(rebuilt.defaults(), optimizer.defaults());
        assert_eq!(rebuilt.lr(), 0.5);
        assert_eq!(rebuilt.state_len(), 0);
        assert_eq!(rebuilt.param_ids(), &[weights.b.id()]);
    }

    #[test]
    fn stepping_an_unbound_param_is_an_error() {
        let mut weights = Weights {
            a: Param::new(array![0.]),
            b: Param::new(array![0.]),
        };
        let mut optimizer = ParamOptimizer::new(defaults(OptimizerType::Sgd), vec![weights.a.id()]);
        let mut params = vec![];
        weights.params("", &mut params);
        assert!(matches!(optimizer.step(&mut params), Err(ReidError::Config(_))));
    }

    #[test]
    fn adam_first_step_moves_by_learning_rate() {
        let mut weights = Weights {
            a: Param::new(array![1., -1.]),
            b: Param::new(array![0., 0.]),
        };
        let mut optimizer = ParamOptimizer::new(
            defaults(OptimizerType::Adam(AdamParameters::default())),
            vec![weights.a.id(), weights.b.id()],
        );
        weights.a.accumulate_grad(&array![3., -0.2]);
        let mut params = vec![];
        weights.params("", &mut params);
        optimizer.step(&mut params).unwrap();
        drop(params);
        let moved = weights.a.value();
        assert!((moved[0] - 0.5).abs() < 1e-6);
        assert!((moved[1] + 0.5).abs() < 1e-6);
    }
}
