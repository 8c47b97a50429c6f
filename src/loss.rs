use crate::error::{ReidError, Result};
use crate::model::{ModelOutput, OutputGrads, StageOutput};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

pub use cross_entropy::cross_entropy;
pub use distill::{kl_divergence, similarity_mse};
pub use triplet::batch_hard_triplet;

mod cross_entropy;
mod distill;
mod triplet;

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub enum LossKind {
    /// Identity classification on every stage's logits.
    CrossEntropy { epsilon: f64 },
    /// Batch-hard triplet on every stage's raw feature.
    Triplet { margin: f64 },
    /// Every student stage against the teacher's stage-0 logits.
    KlDistill { temperature: f64 },
    /// Later stages against the student's own stage-0 logits.
    ProbSelfDistill { temperature: f64 },
    /// Later stages' similarity structure against stage 0.
    SimSelfDistill,
}

impl LossKind {
    pub fn name(&self) -> &'static str {
        match self {
            LossKind::CrossEntropy { .. } => "CrossEntropyLabelSmooth",
            LossKind::Triplet { .. } => "TripletLoss",
            LossKind::KlDistill { .. } => "KLLoss",
            LossKind::ProbSelfDistill { .. } => "ProbSelfDistillLoss",
            LossKind::SimSelfDistill => "SIMSelfDistillLoss",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct CriterionTerm {
    pub loss: LossKind,
    pub weight: f64,
}

pub struct LossInputs<'a> {
    pub student: &'a ModelOutput,
    pub pids: &'a [usize],
    pub teacher: Option<&'a ModelOutput>,
}

pub struct CriterionOutput {
    pub loss: f64,
    /// Weighted value of each term, keyed by loss name.
    pub breakdown: BTreeMap<String, f64>,
    /// Gradient of `loss` with respect to every student output.
    pub grads: OutputGrads,
}

/// Weighted sum of loss terms, evaluated in order.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Criterion {
    pub terms: Vec<CriterionTerm>,
}

impl Criterion {
    pub fn new(terms: Vec<CriterionTerm>) -> Self {
        Criterion { terms }
    }

    pub fn push(&mut self, loss: LossKind, weight: f64) {
        self.terms.push(CriterionTerm { loss, weight });
    }

    pub fn compute(&self, inputs: &LossInputs) -> Result<CriterionOutput> {
        let mut grads = OutputGrads::zeros_like(inputs.student);
        let mut breakdown = BTreeMap::new();
        let mut total = 0.;
        for term in &self.terms {
            let value = term.accumulate(inputs, &mut grads)?;
            *breakdown.entry(term.loss.name().to_string()).or_insert(0.) += value;
            total += value;
        }
        Ok(CriterionOutput {
            loss: total,
            breakdown,
            grads,
        })
    }
}

impl CriterionTerm {
    /// Adds the weighted gradients of this term to `grads` and returns its
    /// weighted value.
    fn accumulate(&self, inputs: &LossInputs, grads: &mut OutputGrads) -> Result<f64> {
        let stages = &inputs.student.stages;
        let weight = self.weight;
        let mut value = 0.;
        match self.loss {
            LossKind::CrossEntropy { epsilon } => {
                for (stage, grad) in stages.iter().zip(grads.stages.iter_mut()) {
                    let (loss, d_logits) = cross_entropy(&stage.logits, inputs.pids, epsilon)?;
                    value += loss;
                    grad.logits.scaled_add(weight, &d_logits);
                }
            }
            LossKind::Triplet { margin } => {
                for (stage, grad) in stages.iter().zip(grads.stages.iter_mut()) {
                    let (loss, d_feats) = batch_hard_triplet(&stage.feats, inputs.pids, margin)?;
                    value += loss;
                    grad.feats.scaled_add(weight, &d_feats);
                }
            }
            LossKind::KlDistill { temperature } => {
                let teacher = inputs.teacher.ok_or_else(|| {
                    ReidError::Config("distillation loss needs teacher outputs".into())
                })?;
                let target = &teacher.first()?.logits;
                for (stage, grad) in stages.iter().zip(grads.stages.iter_mut()) {
                    let (loss, d_logits) = kl_divergence(&stage.logits, target, temperature)?;
                    value += loss;
                    grad.logits.scaled_add(weight, &d_logits);
                }
            }
            LossKind::ProbSelfDistill { temperature } => {
                let target = &self.self_distill_target(inputs)?.logits;
                for (stage, grad) in stages.iter().zip(grads.stages.iter_mut()).skip(1) {
                    let (loss, d_logits) = kl_divergence(&stage.logits, target, temperature)?;
                    value += loss;
                    grad.logits.scaled_add(weight, &d_logits);
                }
            }
            LossKind::SimSelfDistill => {
                let target = &self.self_distill_target(inputs)?.head_feats;
                for (stage, grad) in stages.iter().zip(grads.stages.iter_mut()).skip(1) {
                    let (loss, d_head) = similarity_mse(&stage.head_feats, target)?;
                    value += loss;
                    grad.head_feats.scaled_add(weight, &d_head);
                }
            }
        }
        Ok(value * weight)
    }

    fn self_distill_target<'a>(&self, inputs: &LossInputs<'a>) -> Result<&'a StageOutput> {
        let stages = &inputs.student.stages;
        if stages.len() < 2 {
            return Err(ReidError::Config(format!(
                "{} needs a multi-stage head, got {} stage(s)",
                self.loss.name(),
                stages.len()
            )));
        }
        inputs.student.first()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use ndarray::{array, Array2};

    fn stage(logits: Array2<f64>) -> StageOutput {
        let feats = Array2::from_shape_fn((logits.nrows(), 3), |(r, c)| (r + c) as f64);
        StageOutput {
            head_feats: feats.clone(),
            feats,
            logits,
        }
    }

    #[test]
    fn weights_scale_values_and_gradients() {
        let output = ModelOutput {
            stages: vec![stage(array![[2., 0.], [0., 2.]])],
        };
        let pids = [0, 1];
        let inputs = LossInputs {
            student: &output,
            pids: &pids,
            teacher: None,
        };
        let single = Criterion::new(vec![CriterionTerm {
            loss: LossKind::CrossEntropy { epsilon: 0.1 },
            weight: 1.,
        }])
        .compute(&inputs)
        .unwrap();
        let double = Criterion::new(vec![CriterionTerm {
            loss: LossKind::CrossEntropy { epsilon: 0.1 },
            weight: 2.,
        }])
        .compute(&inputs)
        .unwrap();
        assert!((double.loss - 2. * single.loss).abs() < 1e-12);
        assert_eq!(double.grads.stages[0].logits, &single.grads.stages[0].logits * 2.);
        assert_eq!(double.breakdown["CrossEntropyLabelSmooth"], double.loss);
    }

    #[test]
    fn self_distillation_leaves_stage_zero_untouched() {
        let output = ModelOutput {
            stages: vec![
                stage(array![[3., 0.], [0., 3.]]),
                stage(array![[0., 1.], [1., 0.]]),
            ],
        };
        let pids = [0, 1];
        let mut criterion = Criterion::default();
        criterion.push(LossKind::ProbSelfDistill { temperature: 4. }, 1.);
        let result = criterion
            .compute(&LossInputs {
                student: &output,
                pids: &pids,
                teacher: None,
            })
            .unwrap();
        assert!(result.loss > 0.);
        assert!(result.grads.stages[0].logits.iter().all(|g| *g == 0.));
        assert!(result.grads.stages[1].logits.iter().any(|g| *g != 0.));
    }

    #[test]
    fn distillation_without_teacher_is_a_config_error() {
        let output = ModelOutput {
            stages: vec![stage(array![[1., 0.]])],
        };
        let mut criterion = Criterion::default();
        criterion.push(LossKind::KlDistill { temperature: 4. }, 1.);
        let result = criterion.compute(&LossInputs {
            student: &output,
            pids: &[0],
            teacher: None,
        });
        assert!(matches!(result, Err(ReidError::Config(_))));
    }
}
