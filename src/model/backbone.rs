use crate::error::Result;
use crate::model::activation::Activation;
use crate::model::layer::{ActivationLayer, DenseLayer, GridPoolingLayer};
use crate::model::param::{join_name, Module, NamedParam};
use ndarray::{Array2, Array4};
use rand::Rng;
use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum BackboneArch {
    /// 2048-d embedding.
    Standard,
    /// 512-d embedding, the student architecture for distillation.
    Light,
    Custom { hidden: usize, out: usize },
}

impl BackboneArch {
    pub fn hidden_dim(&self) -> usize {
        match self {
            BackboneArch::Standard => 512,
            BackboneArch::Light => 256,
            BackboneArch::Custom { hidden, .. } => *hidden,
        }
    }

    pub fn out_dim(&self) -> usize {
        match self {
            BackboneArch::Standard => 2048,
            BackboneArch::Light => 512,
            BackboneArch::Custom { out, .. } => *out,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BackboneConfig {
    pub arch: BackboneArch,
    pub in_channels: usize,
    pub pool_grid: usize,
}

impl BackboneConfig {
    /// Same input settings with a different architecture.
    pub fn with_arch(&self, arch: BackboneArch) -> Self {
        BackboneConfig {
            arch,
            ..self.clone()
        }
    }
}

/// Image batch `(B, C, H, W)` to base embedding `(B, dim)`.
#[derive(Serialize, Deserialize)]
pub struct Backbone {
    config: BackboneConfig,
    pooling: GridPoolingLayer,
    fc1: DenseLayer,
    act1: ActivationLayer,
    fc2: DenseLayer,
    act2: ActivationLayer,
}

impl Backbone {
    pub fn new<R: Rng>(config: BackboneConfig, rng: &mut R) -> Self {
        let pooling = GridPoolingLayer::new(config.in_channels, config.pool_grid);
        let hidden = config.arch.hidden_dim();
        let fc1 = DenseLayer::new(pooling.output_size(), hidden, Some(0.), rng);
        let fc2 = DenseLayer::new(hidden, config.arch.out_dim(), Some(0.), rng);
        Backbone {
            config,
            pooling,
            fc1,
            act1: ActivationLayer::new(Activation::ReLU),
            fc2,
            act2: ActivationLayer::new(Activation::ReLU),
        }
    }

    pub fn config(&self) -> &BackboneConfig {
        &self.config
    }

    pub fn dim(&self) -> usize {
        self.config.arch.out_dim()
    }

    pub fn forward_propagate(
        &mut self,
        images: &Array4<f64>,
        is_training: bool,
    ) -> Result<Array2<f64>> {
        let pooled = self.pooling.forward_propagate(images)?;
        let hidden = self.fc1.forward_propagate(&pooled, is_training)?;
        let hidden = self.act1.forward_propagate(&hidden, is_training);
        let out = self.fc2.forward_propagate(&hidden, is_training)?;
        Ok(self.act2.forward_propagate(&out, is_training))
    }

    pub fn infer(&self, images: &Array4<f64>) -> Result<Array2<f64>> {
        let pooled = self.pooling.forward_propagate(images)?;
        let hidden = self.act1.infer(&self.fc1.infer(&pooled)?);
        Ok(self.act2.infer(&self.fc2.infer(&hidden)?))
    }

    pub fn backward_propagate(&mut self, error: &Array2<f64>) -> Result<()> {
        let error = self.act2.backward_propagate(error)?;
        let error = self.fc2.backward_propagate(&error)?;
        let error = self.act1.backward_propagate(&error)?;
        self.fc1.backward_propagate(&error)?;
        Ok(())
    }

    pub fn zero_grad(&mut self) {
        self.fc1.zero_grad();
        self.fc2.zero_grad();
    }
}

impl Module for Backbone {
    fn params<'a>(&'a mut self, prefix: &str, out: &mut Vec<NamedParam<'a>>) {
        self.fc1.params(&join_name(prefix, "fc1"), out);
        self.fc2.params(&join_name(prefix, "fc2"), out);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rand::{rngs::StdRng, SeedableRng};

    #[test]
    fn output_width_follows_architecture() {
        let mut rng = StdRng::seed_from_u64(3);
        let config = BackboneConfig {
            arch: BackboneArch::Custom { hidden: 8, out: 16 },
            in_channels: 3,
            pool_grid: 2,
        };
        let mut backbone = Backbone::new(config, &mut rng);
        let images = Array4::from_elem((5, 3, 8, 4), 0.5);
        let feats = backbone.forward_propagate(&images, true).unwrap();
        assert_eq!(feats.dim(), (5, 16));
        assert!(feats.iter().all(|x| *x >= 0.));
        backbone.backward_propagate(&Array2::ones((5, 16))).unwrap();
    }

    #[test]
    fn rebuild_keeps_input_settings() {
        let config = BackboneConfig {
            arch: BackboneArch::Standard,
            in_channels: 1,
            pool_grid: 3,
        };
        let light = config.with_arch(BackboneArch::Light);
        assert_eq!(light.in_channels, 1);
        assert_eq!(light.pool_grid, 3);
        assert_eq!(light.arch.out_dim(), 512);
    }
}
