use crate::error::{ReidError, Result};
use crate::model::head::{BinaryCodeHead, HeadConfig};
use crate::model::layer::DenseLayer;
use crate::model::param::{join_name, Module, NamedBuffer, NamedParam};
use crate::model::{StageGrads, StageOutput};
use ndarray::Array2;
use rand::Rng;
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, BTreeSet};

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PyramidConfig {
    pub head: HeadConfig,
    pub train_widths: Vec<usize>,
    pub eval_widths: Vec<usize>,
}

#[derive(Serialize, Deserialize)]
struct PyramidStage {
    /// `None` for the zeroth stage, which works on the unprojected input.
    projection: Option<DenseLayer>,
    head: BinaryCodeHead,
}

/// Cascade of projections with one code head per width.
///
/// Stage 0 classifies the head input directly. Stage `k >= 1` projects the raw
/// feature of stage `k - 1` to `train_widths[k - 1]`. The projection input is
/// treated as a constant, so every stage only learns through its own losses.
#[derive(Serialize, Deserialize)]
pub struct PyramidHead {
    config: PyramidConfig,
    stages: Vec<PyramidStage>,
    /// Width to cascade position, projected stages only.
    width_index: BTreeMap<usize, usize>,
    /// Positions returned at inference, ascending.
    eval_positions: Vec<usize>,
}

impl PyramidHead {
    pub fn new<R: Rng>(config: PyramidConfig, rng: &mut R) -> Result<Self> {
        if config.train_widths.is_empty() {
            return Err(ReidError::Config("pyramid head needs at least one width".into()));
        }
        if let Some(pair) = config.train_widths.windows(2).find(|pair| pair[1] >= pair[0]) {
            return Err(ReidError::Config(format!(
                "pyramid widths must strictly decrease, got {} after {}",
                pair[1], pair[0]
            )));
        }
        if config.eval_widths.is_empty() {
            return Err(ReidError::Config("pyramid head needs an evaluation width".into()));
        }
        let mut stages = vec![PyramidStage {
            projection: None,
            head: BinaryCodeHead::new(config.head, rng),
        }];
        let mut width_index = BTreeMap::new();
        let mut previous = config.head.in_dim;
        for (idx, &width) in config.train_widths.iter().enumerate() {
            width_index.insert(width, idx + 1);
            stages.push(PyramidStage {
                projection: Some(DenseLayer::with_std(
                    previous,
                    width,
                    Some(0.),
                    (1. / previous.max(1) as f64).sqrt(),
                    rng,
                )),
                head: BinaryCodeHead::new(config.head.with_in_dim(width), rng),
            });
            previous = width;
        }

        let mut eval_positions = BTreeSet::new();
        for width in &config.eval_widths {
            let position = width_index.get(width).ok_or_else(|| {
                ReidError::Config(format!(
                    "evaluation width {} is not one of the training widths {:?}",
                    width, config.train_widths
                ))
            })?;
            eval_positions.insert(*position);
        }

        Ok(PyramidHead {
            config,
            stages,
            width_index,
            eval_positions: eval_positions.into_iter().collect(),
        })
    }

    pub fn config(&self) -> &PyramidConfig {
        &self.config
    }

    pub fn position_of(&self, width: usize) -> Option<usize> {
        self.width_index.get(&width).copied()
    }

    /// Widths of the codes returned by [`PyramidHead::codes`], in order.
    pub fn eval_widths(&self) -> Vec<usize> {
        self.eval_positions
            .iter()
            .map(|position| self.width_at(*position))
            .collect()
    }

    fn width_at(&self, position: usize) -> usize {
        match position {
            0 => self.config.head.in_dim,
            _ => self.config.train_widths[position - 1],
        }
    }

    pub fn forward_propagate(
        &mut self,
        feats: &Array2<f64>,
        labels: Option<&[usize]>,
        use_tanh: bool,
        is_training: bool,
    ) -> Result<Vec<StageOutput>> {
        let mut outputs: Vec<StageOutput> = Vec::with_capacity(self.stages.len());
        for stage in self.stages.iter_mut() {
            let stage_feats = match (&mut stage.projection, outputs.last()) {
                (Some(projection), Some(previous)) => {
                    projection.forward_propagate(&previous.feats, is_training)?
                }
                _ => feats.clone(),
            };
            let (head_feats, logits) =
                stage
                    .head
                    .forward_propagate(&stage_feats, labels, use_tanh, is_training)?;
            outputs.push(StageOutput {
                feats: stage_feats,
                head_feats,
                logits,
            });
        }
        Ok(outputs)
    }

    /// Codes at the configured evaluation widths, stage 0 excluded.
    pub fn codes(&self, feats: &Array2<f64>, use_tanh: bool) -> Result<Vec<Array2<f64>>> {
        let last = self.eval_positions.last().copied().unwrap_or(0);
        let mut codes = Vec::with_capacity(self.eval_positions.len());
        let mut current = feats.clone();
        for (position, stage) in self.stages.iter().enumerate().take(last + 1).skip(1) {
            if let Some(projection) = &stage.projection {
                current = projection.infer(&current)?;
            }
            if self.eval_positions.binary_search(&position).is_ok() {
                codes.push(stage.head.code(&current, use_tanh)?);
            }
        }
        Ok(codes)
    }

    /// Inference over every stage, including stage 0.
    pub fn infer_all(&self, feats: &Array2<f64>, use_tanh: bool) -> Result<Vec<StageOutput>> {
        let mut outputs: Vec<StageOutput> = Vec::with_capacity(self.stages.len());
        for stage in &self.stages {
            let stage_feats = match (&stage.projection, outputs.last()) {
                (Some(projection), Some(previous)) => projection.infer(&previous.feats)?,
                _ => feats.clone(),
            };
            let (head_feats, logits) = stage.head.infer(&stage_feats, use_tanh)?;
            outputs.push(StageOutput {
                feats: stage_feats,
                head_feats,
                logits,
            });
        }
        Ok(outputs)
    }

    /// Backpropagates every stage through its own head and projection and
    /// returns the gradient on the pyramid input, which only stage 0 produces.
    pub fn backward_propagate(&mut self, grads: &[StageGrads]) -> Result<Array2<f64>> {
        if grads.len() != self.stages.len() {
            return Err(ReidError::Shape(format!(
                "{} stage gradients for a pyramid of {} stages",
                grads.len(),
                self.stages.len()
            )));
        }
        let mut input_grad = None;
        for (stage, grad) in self.stages.iter_mut().zip(grads) {
            let d_head = stage
                .head
                .backward_propagate(&grad.head_feats, &grad.logits)?;
            let d_feats = &grad.feats + &d_head;
            match &mut stage.projection {
                // The projected input is detached, so its gradient is dropped.
                Some(projection) => {
                    projection.backward_propagate(&d_feats)?;
                }
                None => input_grad = Some(d_feats),
            }
        }
        input_grad.ok_or(ReidError::MissingCache("pyramid stage 0"))
    }

    pub fn zero_grad(&mut self) {
        for stage in self.stages.iter_mut() {
            if let Some(projection) = &mut stage.projection {
                projection.zero_grad();
            }
            stage.head.zero_grad();
        }
    }
}

impl Module for PyramidHead {
    fn params<'a>(&'a mut self, prefix: &str, out: &mut Vec<NamedParam<'a>>) {
        for (idx, stage) in self.stages.iter_mut().enumerate() {
            let stage_prefix = join_name(prefix, &format!("stages.{}", idx));
            if let Some(projection) = &mut stage.projection {
                projection.params(&join_name(&stage_prefix, "proj"), out);
            }
            stage.head.params(&join_name(&stage_prefix, "head"), out);
        }
    }

    fn buffers<'a>(&'a mut self, prefix: &str, out: &mut Vec<NamedBuffer<'a>>) {
        for (idx, stage) in self.stages.iter_mut().enumerate() {
            let stage_prefix = join_name(prefix, &format!("stages.{}", idx));
            stage.head.buffers(&join_name(&stage_prefix, "head"), out);
        }
    }
}
