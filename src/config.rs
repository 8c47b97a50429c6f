use crate::data_loader::{DataManager, LoaderConfig, Sampler};
use crate::dataset::{InputShape, ReidDataset};
use crate::device::Device;
use crate::engine::EngineConfig;
use crate::error::Result;
use crate::evaluation::Metric;
use crate::loss::{Criterion, LossKind};
use crate::model::backbone::{BackboneArch, BackboneConfig};
use crate::model::classifier::ClassifierKind;
use crate::model::head::HeadConfig;
use crate::model::ReidModel;
use crate::optim::{
    LrScheduler, Optimizer, OptimizerDefaults, OptimizerType, ParamOptimizer, SgdmParameters,
};
use rand::Rng;
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};

pub const INPUT_CHANNELS: usize = 3;
pub const INPUT_SHAPE: InputShape = (INPUT_CHANNELS, 256, 128); // (channels, height, width)
pub const BACKBONE_POOL_GRID: usize = 4;

pub const BATCH_EPSILON: f64 = 1e-5;
pub const NORM_MOMENTUM: f64 = 0.9;

// Pyramid head, widest first.
pub const PYRAMID_TRAIN_WIDTHS: [usize; 7] = [2048, 1024, 512, 256, 128, 64, 32];
pub const PYRAMID_EVAL_WIDTHS: [usize; 4] = [2048, 512, 128, 32];

pub const LABEL_SMOOTHING: f64 = 0.1;
pub const TRIPLET_MARGIN: f64 = 0.3;
pub const DISTILL_TEMPERATURE: f64 = 4.0;
pub const KL_WEIGHT: f64 = 1.0;
pub const PROB_SELF_DISTILL_WEIGHT: f64 = 1.0;
pub const SIM_SELF_DISTILL_WEIGHT: f64 = 1000.0;

pub const CMC_TRUNCATE: usize = 150;
/// Candidates kept by each coarse-to-fine refinement, coarsest first.
pub const C2F_SHORTLIST: [usize; 3] = [1000, 500, 200];
pub const PR_THRESHOLDS: usize = 100;

pub const LOG_FILE: &str = "logging.txt";
pub const FINAL_MODEL: &str = "final_model.pth.tar";
pub const EPOCH_MODEL: &str = "model_";
pub const EPOCH_MODEL_EXT: &str = ".pth";
pub const PR_CURVE: &str = "precision-recall-curve.png";
pub const RANKED_RESULTS: &str = "ranked-results.csv";

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum DataConfig {
    /// `image_path,pid,camid` manifests.
    Manifest {
        train: PathBuf,
        query: PathBuf,
        gallery: PathBuf,
    },
    Synthetic {
        num_ids: usize,
        num_cams: usize,
        per_cam: usize,
    },
}

fn default_criterion() -> Criterion {
    let mut criterion = Criterion::default();
    criterion.push(
        LossKind::CrossEntropy {
            epsilon: LABEL_SMOOTHING,
        },
        1.,
    );
    criterion.push(
        LossKind::Triplet {
            margin: TRIPLET_MARGIN,
        },
        1.,
    );
    criterion
}

/// Everything a run needs, as read from a JSON file.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RunConfig {
    pub results_dir: PathBuf,
    pub data: DataConfig,
    pub input_shape: InputShape,
    pub loader: LoaderConfig,
    pub backbone: BackboneArch,
    pub classifier: ClassifierKind,
    #[serde(default = "default_criterion")]
    pub criterion: Criterion,
    pub optimizer: OptimizerDefaults,
    pub lr_scheduler: LrScheduler,
    pub max_epochs: usize,
    #[serde(default)]
    pub fix_backbone_epochs: usize,
    pub eval_metric: Metric,
    #[serde(default)]
    pub eval_freq: usize,
    #[serde(default)]
    pub auto_resume: bool,
    #[serde(default)]
    pub light_model: bool,
    #[serde(default)]
    pub light_feat: bool,
    #[serde(default)]
    pub light_search: bool,
    #[serde(default)]
    pub threads: Option<usize>,
    #[serde(default)]
    pub seed: u64,
}

impl RunConfig {
    pub fn load<P: AsRef<Path>>(path: P) -> Result<Self> {
        let file = std::fs::File::open(path)?;
        Ok(serde_json::from_reader(std::io::BufReader::new(file))?)
    }

    pub fn save<P: AsRef<Path>>(&self, path: P) -> Result<()> {
        let file = std::fs::File::create(path)?;
        serde_json::to_writer_pretty(file, self)?;
        Ok(())
    }

    /// A few epochs on generated identities with a small backbone.
    pub fn demo<P: AsRef<Path>>(results_dir: P) -> Self {
        RunConfig {
            results_dir: results_dir.as_ref().to_path_buf(),
            data: DataConfig::Synthetic {
                num_ids: 8,
                num_cams: 2,
                per_cam: 4,
            },
            input_shape: (INPUT_CHANNELS, 16, 8),
            loader: LoaderConfig {
                train_batch_size: 16,
                test_batch_size: 32,
                sampler: Sampler::IdentityBalanced { instances: 4 },
                seed: 0,
            },
            backbone: BackboneArch::Custom { hidden: 64, out: 128 },
            classifier: ClassifierKind::Linear,
            criterion: default_criterion(),
            optimizer: OptimizerDefaults {
                kind: OptimizerType::SgdMomentum(SgdmParameters { momentum: 0.9 }),
                lr: 0.01,
                weight_decay: 5e-4,
            },
            lr_scheduler: LrScheduler::WarmupMultiStep {
                milestones: vec![6],
                gamma: 0.1,
                warmup_factor: 0.1,
                warmup_epochs: 2,
            },
            max_epochs: 8,
            fix_backbone_epochs: 0,
            eval_metric: Metric::Cosine,
            eval_freq: 4,
            auto_resume: false,
            light_model: false,
            light_feat: false,
            light_search: false,
            threads: None,
            seed: 0,
        }
    }

    pub fn build_data_manager(&self) -> Result<DataManager> {
        match &self.data {
            DataConfig::Manifest {
                train,
                query,
                gallery,
            } => DataManager::new(
                ReidDataset::from_csv(train, self.input_shape)?,
                ReidDataset::from_csv(query, self.input_shape)?,
                ReidDataset::from_csv(gallery, self.input_shape)?,
                &self.loader,
            ),
            DataConfig::Synthetic {
                num_ids,
                num_cams,
                per_cam,
            } => DataManager::synthetic(*num_ids, *num_cams, *per_cam, self.input_shape, &self.loader),
        }
    }

    pub fn build_model<R: Rng>(&self, class_num: usize, rng: &mut R) -> Result<ReidModel> {
        let backbone = BackboneConfig {
            arch: self.backbone,
            in_channels: self.input_shape.0,
            pool_grid: BACKBONE_POOL_GRID,
        };
        let head = HeadConfig {
            in_dim: self.backbone.out_dim(),
            class_num,
            classifier: self.classifier,
        };
        ReidModel::new(backbone, head, rng)
    }

    pub fn build_optimizer(&self, model: &mut ReidModel) -> Optimizer {
        let optimizer = ParamOptimizer::new(self.optimizer, model.param_ids());
        Optimizer::new(optimizer, self.lr_scheduler.clone(), self.max_epochs)
            .with_fixed_backbone(self.fix_backbone_epochs)
    }

    pub fn build_device(&self) -> Result<Device> {
        match self.threads {
            Some(threads) => Device::with_threads(threads),
            None => Ok(Device::cpu()),
        }
    }

    pub fn engine_config(&self) -> EngineConfig {
        EngineConfig {
            results_dir: self.results_dir.clone(),
            eval_metric: self.eval_metric,
            light_model: self.light_model,
            light_feat: self.light_feat,
            light_search: self.light_search,
            seed: self.seed,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rand::{rngs::StdRng, SeedableRng};

    #[test]
    fn missing_optional_fields_take_defaults() {
        let mut value = serde_json::to_value(RunConfig::demo("out")).unwrap();
        let object = value.as_object_mut().unwrap();
        for key in ["criterion", "light_model", "eval_freq", "threads"] {
            object.remove(key);
        }
        let config: RunConfig = serde_json::from_value(value).unwrap();
        assert_eq!(config.criterion, default_criterion());
        assert!(!config.light_model);
        assert_eq!(config.eval_freq, 0);
    }

    #[test]
    fn demo_config_builds_every_component() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("run.json");
        RunConfig::demo(dir.path()).save(&path).unwrap();
        let config = RunConfig::load(&path).unwrap();

        let data = config.build_data_manager().unwrap();
        assert_eq!(data.class_num, 8);
        let mut model = config.build_model(data.class_num, &mut StdRng::seed_from_u64(0)).unwrap();
        assert_eq!(model.head_config().in_dim, 128);
        let optimizer = config.build_optimizer(&mut model);
        assert_eq!(optimizer.optimizer.param_ids().len(), model.param_ids().len());
        assert_eq!(optimizer.max_epochs, 8);
    }
}
