use crate::config::{BATCH_EPSILON, NORM_MOMENTUM};
use crate::error::{ReidError, Result};
use crate::model::classifier::{Classifier, ClassifierKind};
use crate::model::layer::BatchNormLayer;
use crate::model::param::{join_name, Module, NamedBuffer, NamedParam};
use ndarray::Array2;
use rand::Rng;
use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct HeadConfig {
    pub in_dim: usize,
    pub class_num: usize,
    pub classifier: ClassifierKind,
}

impl HeadConfig {
    pub fn with_in_dim(&self, in_dim: usize) -> Self {
        HeadConfig { in_dim, ..*self }
    }
}

/// Batch-norm neck followed by an identity classifier. The neck output is the
/// embedding; with tanh enabled it is squashed into (-1, 1) so that its sign is
/// a binary code.
#[derive(Serialize, Deserialize)]
pub struct BinaryCodeHead {
    config: HeadConfig,
    bn: BatchNormLayer,
    classifier: Classifier,
    #[serde(skip)]
    tanh_output: Option<Array2<f64>>,
}

impl BinaryCodeHead {
    pub fn new<R: Rng>(config: HeadConfig, rng: &mut R) -> Self {
        BinaryCodeHead {
            bn: BatchNormLayer::new(config.in_dim, BATCH_EPSILON, NORM_MOMENTUM),
            classifier: Classifier::new(config.classifier, config.in_dim, config.class_num, rng),
            config,
            tanh_output: None,
        }
    }

    pub fn config(&self) -> &HeadConfig {
        &self.config
    }

    /// Returns `(embedding, logits)`.
    pub fn forward_propagate(
        &mut self,
        feats: &Array2<f64>,
        labels: Option<&[usize]>,
        use_tanh: bool,
        is_training: bool,
    ) -> Result<(Array2<f64>, Array2<f64>)> {
        let mut code = self.bn.forward_propagate(feats, is_training)?;
        if use_tanh {
            code.mapv_inplace(f64::tanh);
        }
        self.tanh_output = if use_tanh && is_training {
            Some(code.clone())
        } else {
            None
        };
        let logits = self.classifier.forward_propagate(&code, labels, is_training)?;
        Ok((code, logits))
    }

    /// Inference-only embedding.
    pub fn code(&self, feats: &Array2<f64>, use_tanh: bool) -> Result<Array2<f64>> {
        let mut code = self.bn.infer(feats)?;
        if use_tanh {
            code.mapv_inplace(f64::tanh);
        }
        Ok(code)
    }

    /// Inference-only `(embedding, logits)`.
    pub fn infer(&self, feats: &Array2<f64>, use_tanh: bool) -> Result<(Array2<f64>, Array2<f64>)> {
        let code = self.code(feats, use_tanh)?;
        let logits = self.classifier.infer(&code)?;
        Ok((code, logits))
    }

    /// Takes the gradients on the embedding and on the logits and returns the
    /// gradient on the head input.
    pub fn backward_propagate(
        &mut self,
        d_code: &Array2<f64>,
        d_logits: &Array2<f64>,
    ) -> Result<Array2<f64>> {
        let mut d_code = d_code + &self.classifier.backward_propagate(d_logits)?;
        if let Some(code) = self.tanh_output.take() {
            if code.dim() != d_code.dim() {
                return Err(ReidError::Shape("tanh cache does not match gradient".into()));
            }
            d_code.zip_mut_with(&code, |d, y| *d *= 1. - y * y);
        }
        self.bn.backward_propagate(&d_code)
    }

    pub fn zero_grad(&mut self) {
        self.bn.zero_grad();
        self.classifier.zero_grad();
    }
}

impl Module for BinaryCodeHead {
    fn params<'a>(&'a mut self, prefix: &str, out: &mut Vec<NamedParam<'a>>) {
        self.bn.params(&join_name(prefix, "bn"), out);
        self.classifier.params(&join_name(prefix, "classifier"), out);
    }

    fn buffers<'a>(&'a mut self, prefix: &str, out: &mut Vec<NamedBuffer<'a>>) {
        self.bn.buffers(&join_name(prefix, "bn"), out);
    }
}
