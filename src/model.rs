use crate::error::{ReidError, Result};
use backbone::{Backbone, BackboneArch, BackboneConfig};
use head::{BinaryCodeHead, HeadConfig};
use ndarray::{Array2, Array4};
use param::{join_name, Module, NamedBuffer, NamedParam, ParamId, StateDict};
use pyramid_head::{PyramidConfig, PyramidHead};
use rand::Rng;
use serde::{Deserialize, Serialize};
use std::io::Read;
use std::path::Path;

pub mod activation;
pub mod backbone;
pub mod classifier;
pub mod head;
mod layer;
pub mod param;
pub mod pyramid_head;

/// One stage of a forward pass: backbone/projection feature, head embedding,
/// class logits.
#[derive(Debug, Clone)]
pub struct StageOutput {
    pub feats: Array2<f64>,
    pub head_feats: Array2<f64>,
    pub logits: Array2<f64>,
}

/// Loss gradients for one [`StageOutput`].
#[derive(Debug, Clone)]
pub struct StageGrads {
    pub feats: Array2<f64>,
    pub head_feats: Array2<f64>,
    pub logits: Array2<f64>,
}

impl StageGrads {
    pub fn zeros_like(output: &StageOutput) -> Self {
        StageGrads {
            feats: Array2::zeros(output.feats.raw_dim()),
            head_feats: Array2::zeros(output.head_feats.raw_dim()),
            logits: Array2::zeros(output.logits.raw_dim()),
        }
    }
}

/// Training output. A plain head yields one stage, a pyramid one per width.
#[derive(Debug, Clone)]
pub struct ModelOutput {
    pub stages: Vec<StageOutput>,
}

impl ModelOutput {
    /// Stage 0, the full-width output.
    pub fn first(&self) -> Result<&StageOutput> {
        self.stages
            .first()
            .ok_or_else(|| ReidError::Shape("model produced no stages".into()))
    }
}

#[derive(Debug, Clone)]
pub struct OutputGrads {
    pub stages: Vec<StageGrads>,
}

impl OutputGrads {
    pub fn zeros_like(output: &ModelOutput) -> Self {
        OutputGrads {
            stages: output.stages.iter().map(StageGrads::zeros_like).collect(),
        }
    }
}

/// What inference hands to feature extraction.
#[derive(Debug, Clone)]
pub enum Embeddings {
    Single(Array2<f64>),
    List(Vec<Array2<f64>>),
}

#[derive(Serialize, Deserialize)]
pub enum Head {
    Code(BinaryCodeHead),
    Pyramid(PyramidHead),
}

impl Head {
    pub fn config(&self) -> &HeadConfig {
        match self {
            Head::Code(head) => head.config(),
            Head::Pyramid(head) => &head.config().head,
        }
    }

    pub fn name(&self) -> &'static str {
        match self {
            Head::Code(_) => "BinaryCodeHead",
            Head::Pyramid(_) => "PyramidHead",
        }
    }
}

impl Module for Head {
    fn params<'a>(&'a mut self, prefix: &str, out: &mut Vec<NamedParam<'a>>) {
        match self {
            Head::Code(head) => head.params(prefix, out),
            Head::Pyramid(head) => head.params(prefix, out),
        }
    }

    fn buffers<'a>(&'a mut self, prefix: &str, out: &mut Vec<NamedBuffer<'a>>) {
        match self {
            Head::Code(head) => head.buffers(prefix, out),
            Head::Pyramid(head) => head.buffers(prefix, out),
        }
    }
}

/// Backbone plus head. The whole struct serialises as the full model snapshot.
#[derive(Serialize, Deserialize)]
pub struct ReidModel {
    backbone: Backbone,
    head: Head,
    use_tanh: bool,
    #[serde(skip)]
    backbone_frozen: bool,
}

impl ReidModel {
    pub fn new<R: Rng>(backbone: BackboneConfig, head: HeadConfig, rng: &mut R) -> Result<Self> {
        let backbone = Backbone::new(backbone, rng);
        if head.in_dim != backbone.dim() {
            return Err(ReidError::Config(format!(
                "head expects {} input features but the backbone produces {}",
                head.in_dim,
                backbone.dim()
            )));
        }
        Ok(ReidModel {
            head: Head::Code(BinaryCodeHead::new(head, rng)),
            backbone,
            use_tanh: false,
            backbone_frozen: false,
        })
    }

    pub fn backbone(&self) -> &Backbone {
        &self.backbone
    }

    pub fn head(&self) -> &Head {
        &self.head
    }

    pub fn head_config(&self) -> HeadConfig {
        *self.head.config()
    }

    pub fn use_tanh(&self) -> bool {
        self.use_tanh
    }

    /// Switches every head to tanh-bounded embeddings.
    pub fn enable_tanh(&mut self) {
        self.use_tanh = true;
    }

    /// Training forward. With `freeze_backbone` no backbone gradients are
    /// produced by the following [`ReidModel::backward`].
    pub fn forward_train(
        &mut self,
        images: &Array4<f64>,
        pids: &[usize],
        freeze_backbone: bool,
    ) -> Result<ModelOutput> {
        let feats = self.backbone.forward_propagate(images, !freeze_backbone)?;
        self.backbone_frozen = freeze_backbone;
        let stages = match &mut self.head {
            Head::Code(head) => {
                let (head_feats, logits) =
                    head.forward_propagate(&feats, Some(pids), self.use_tanh, true)?;
                vec![StageOutput {
                    feats,
                    head_feats,
                    logits,
                }]
            }
            Head::Pyramid(head) => {
                head.forward_propagate(&feats, Some(pids), self.use_tanh, true)?
            }
        };
        Ok(ModelOutput { stages })
    }

    /// Forward with frozen statistics and no caches, as used for a teacher.
    pub fn forward_frozen(&self, images: &Array4<f64>) -> Result<ModelOutput> {
        let feats = self.backbone.infer(images)?;
        let stages = match &self.head {
            Head::Code(head) => {
                let (head_feats, logits) = head.infer(&feats, self.use_tanh)?;
                vec![StageOutput {
                    feats,
                    head_feats,
                    logits,
                }]
            }
            Head::Pyramid(head) => head.infer_all(&feats, self.use_tanh)?,
        };
        Ok(ModelOutput { stages })
    }

    /// Evaluation features: head embeddings (or pyramid codes) when `from_head`,
    /// raw backbone features otherwise.
    pub fn extract(&self, images: &Array4<f64>, from_head: bool) -> Result<Embeddings> {
        let feats = self.backbone.infer(images)?;
        if !from_head {
            return Ok(Embeddings::Single(feats));
        }
        Ok(match &self.head {
            Head::Code(head) => Embeddings::Single(head.code(&feats, self.use_tanh)?),
            Head::Pyramid(head) => Embeddings::List(head.codes(&feats, self.use_tanh)?),
        })
    }

    pub fn backward(&mut self, grads: &OutputGrads) -> Result<()> {
        let d_feats = match &mut self.head {
            Head::Code(head) => {
                let [grad] = grads.stages.as_slice() else {
                    return Err(ReidError::Shape(format!(
                        "single head got gradients for {} stages",
                        grads.stages.len()
                    )));
                };
                &grad.feats + &head.backward_propagate(&grad.head_feats, &grad.logits)?
            }
            Head::Pyramid(head) => head.backward_propagate(&grads.stages)?,
        };
        if !self.backbone_frozen {
            self.backbone.backward_propagate(&d_feats)?;
        }
        Ok(())
    }

    pub fn zero_grad(&mut self) {
        self.backbone.zero_grad();
        match &mut self.head {
            Head::Code(head) => head.zero_grad(),
            Head::Pyramid(head) => head.zero_grad(),
        }
    }

    pub fn param_ids(&mut self) -> Vec<ParamId> {
        let mut params = vec![];
        self.params("", &mut params);
        params.iter().map(|param| param.slot.id).collect()
    }

    pub fn state_dict(&mut self) -> StateDict {
        StateDict::capture(self)
    }

    pub fn load_state_dict(&mut self, state: &StateDict) -> Result<()> {
        state.restore(self)
    }

    /// Rebuilds the backbone with another architecture and the head against the
    /// new width, keeping class count and classifier settings.
    pub fn replace_backbone<R: Rng>(&mut self, arch: BackboneArch, rng: &mut R) -> Result<()> {
        let backbone = Backbone::new(self.backbone.config().with_arch(arch), rng);
        let in_dim = backbone.dim();
        let head = match &self.head {
            Head::Code(head) => {
                Head::Code(BinaryCodeHead::new(head.config().with_in_dim(in_dim), rng))
            }
            Head::Pyramid(head) => {
                let config = head.config();
                Head::Pyramid(PyramidHead::new(
                    PyramidConfig {
                        head: config.head.with_in_dim(in_dim),
                        ..config.clone()
                    },
                    rng,
                )?)
            }
        };
        self.backbone = backbone;
        self.head = head;
        Ok(())
    }

    /// Swaps in a pyramid head over the current backbone width.
    pub fn replace_head_with_pyramid<R: Rng>(
        &mut self,
        train_widths: &[usize],
        eval_widths: &[usize],
        rng: &mut R,
    ) -> Result<()> {
        let head = PyramidHead::new(
            PyramidConfig {
                head: self.head_config().with_in_dim(self.backbone.dim()),
                train_widths: train_widths.to_vec(),
                eval_widths: eval_widths.to_vec(),
            },
            rng,
        )?;
        self.head = Head::Pyramid(head);
        Ok(())
    }

    /// Writes the complete model (architecture and parameters).
    pub fn save<P: AsRef<Path>>(&self, path: P) -> Result<()> {
        crate::utils::write_json(path.as_ref(), self)
    }

    pub fn load<P: AsRef<Path>>(path: P) -> Result<Self> {
        let mut file = std::fs::File::open(path)?;
        let mut model = String::new();
        file.read_to_string(&mut model)?;
        Ok(serde_json::from_str(&model)?)
    }
}

impl Module for ReidModel {
    fn params<'a>(&'a mut self, prefix: &str, out: &mut Vec<NamedParam<'a>>) {
        self.backbone.params(&join_name(prefix, "backbone"), out);
        self.head.params(&join_name(prefix, "head"), out);
    }

    fn buffers<'a>(&'a mut self, prefix: &str, out: &mut Vec<NamedBuffer<'a>>) {
        self.head.buffers(&join_name(prefix, "head"), out);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::classifier::ClassifierKind;
    use rand::{rngs::StdRng, SeedableRng};

    fn small_model(rng: &mut StdRng) -> ReidModel {
        let arch = BackboneArch::Custom { hidden: 8, out: 12 };
        let backbone = BackboneConfig {
            arch,
            in_channels: 3,
            pool_grid: 2,
        };
        let head = HeadConfig {
            in_dim: 12,
            class_num: 4,
            classifier: ClassifierKind::Circle {
                scale: 64.,
                margin: 0.25,
            },
        };
        ReidModel::new(backbone, head, rng).unwrap()
    }

    fn images() -> Array4<f64> {
        Array4::from_shape_fn((4, 3, 6, 4), |(b, c, h, w)| {
            ((b + c * 2 + h * w) % 5) as f64 / 5.
        })
    }

    #[test]
    fn single_head_extracts_one_embedding() {
        let mut rng = StdRng::seed_from_u64(1);
        let model = small_model(&mut rng);
        match model.extract(&images(), true).unwrap() {
            Embeddings::Single(feats) => assert_eq!(feats.dim(), (4, 12)),
            Embeddings::List(_) => panic!("expected a single embedding"),
        }
    }

    #[test]
    fn backbone_replacement_keeps_head_settings() {
        let mut rng = StdRng::seed_from_u64(2);
        let mut model = small_model(&mut rng);
        let before = model.param_ids();
        model
            .replace_backbone(BackboneArch::Custom { hidden: 4, out: 6 }, &mut rng)
            .unwrap();
        let config = model.head_config();
        assert_eq!(config.in_dim, 6);
        assert_eq!(config.class_num, 4);
        assert_eq!(
            config.classifier,
            ClassifierKind::Circle {
                scale: 64.,
                margin: 0.25
            }
        );
        let after = model.param_ids();
        assert!(after.iter().all(|id| !before.contains(id)));
    }

    #[test]
    fn frozen_backbone_gets_no_gradient() {
        let mut rng = StdRng::seed_from_u64(3);
        let mut model = small_model(&mut rng);
        let output = model.forward_train(&images(), &[0, 1, 2, 3], true).unwrap();
        let mut grads = OutputGrads::zeros_like(&output);
        grads.stages[0].logits.fill(0.1);
        model.backward(&grads).unwrap();

        let mut params = vec![];
        model.params("", &mut params);
        for param in &params {
            let has_grad = param.slot.grad.is_some();
            assert_eq!(has_grad, !param.name.starts_with("backbone."), "{}", param.name);
        }
    }

    #[test]
    fn full_snapshot_round_trips_through_json() {
        let mut rng = StdRng::seed_from_u64(4);
        let mut model = small_model(&mut rng);
        model.enable_tanh();
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("final_model.pth.tar");
        model.save(&path).unwrap();

        let mut loaded = ReidModel::load(&path).unwrap();
        assert!(loaded.use_tanh());
        assert_eq!(loaded.state_dict(), model.state_dict());
        assert!(loaded.param_ids().iter().all(|id| !model.param_ids().contains(id)));
    }
}
