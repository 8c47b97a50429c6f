use crate::config::{
    CMC_TRUNCATE, DISTILL_TEMPERATURE, KL_WEIGHT, PROB_SELF_DISTILL_WEIGHT, PYRAMID_EVAL_WIDTHS,
    PYRAMID_TRAIN_WIDTHS, RANKED_RESULTS, SIM_SELF_DISTILL_WEIGHT,
};
use crate::data_loader::{Batch, DataLoader, DataManager};
use crate::device::Device;
use crate::error::{ReidError, Result};
use crate::evaluation::{
    rank, CmcMapEvaluator, CmcMapEvaluator1b1, CmcMapEvaluatorC2F, EvalMode, Metric,
    PreRecEvaluator,
};
use crate::loss::{Criterion, LossInputs, LossKind};
use crate::model::backbone::BackboneArch;
use crate::model::param::Module;
use crate::model::{Embeddings, ReidModel};
use crate::optim::Optimizer;
use crate::utils::{accuracy, time_now};
use meters::{AverageMeter, MultiItemAverageMeter};
use ndarray::{concatenate, Array2, ArrayView2, Axis};
use rand::{rngs::StdRng, SeedableRng};
use serde::Serialize;
use std::path::{Path, PathBuf};
use std::time::Instant;

pub use logging::RunLog;

pub mod checkpoint;
mod logging;
pub mod meters;

#[derive(Debug, Clone, PartialEq)]
pub struct EngineConfig {
    /// Prefix of the run directory; the light-mode flags are appended to it.
    pub results_dir: PathBuf,
    pub eval_metric: Metric,
    pub light_model: bool,
    pub light_feat: bool,
    pub light_search: bool,
    pub seed: u64,
}

fn flag(value: bool) -> &'static str {
    if value {
        "True"
    } else {
        "False"
    }
}

fn run_dir(prefix: &Path, light_model: bool, light_feat: bool, light_search: bool) -> PathBuf {
    let mut dir = prefix.as_os_str().to_owned();
    dir.push(format!(
        "lightmodel({})-lightfeat({})-lightsearch({})",
        flag(light_model),
        flag(light_feat),
        flag(light_search)
    ));
    PathBuf::from(dir)
}

impl EngineConfig {
    pub fn run_dir(&self) -> PathBuf {
        run_dir(
            &self.results_dir,
            self.light_model,
            self.light_feat,
            self.light_search,
        )
    }

    /// Full snapshot of the plain run sharing this prefix.
    pub fn teacher_path(&self) -> PathBuf {
        checkpoint::final_model_path(&run_dir(&self.results_dir, false, false, false))
    }
}

/// Features of one split with their labels, in loader order.
#[derive(Debug, Clone)]
pub struct ExtractedSet {
    pub feats: Embeddings,
    pub pids: Vec<usize>,
    pub camids: Vec<usize>,
}

#[derive(Serialize)]
struct RankedRecord<'a> {
    query: usize,
    query_image: &'a str,
    rank: usize,
    gallery_image: &'a str,
    distance: f64,
    is_match: bool,
}

pub struct Engine {
    config: EngineConfig,
    results_dir: PathBuf,
    datamanager: DataManager,
    model: ReidModel,
    criterion: Criterion,
    optimizer: Optimizer,
    device: Device,
    teacher: Option<ReidModel>,
    metric: Metric,
    log: RunLog,
}

impl Engine {
    /// Builds the engine and applies the light modes in order: distillation,
    /// binary features, pyramid search.
    pub fn new(
        config: EngineConfig,
        datamanager: DataManager,
        mut model: ReidModel,
        mut criterion: Criterion,
        mut optimizer: Optimizer,
        device: Device,
    ) -> Result<Self> {
        let results_dir = config.run_dir();
        let teacher = if config.light_model {
            let path = config.teacher_path();
            if !path.is_file() {
                return Err(ReidError::MissingTeacher(path));
            }
            Some((checkpoint::load_full(&path)?, path))
        } else {
            None
        };
        let log = RunLog::new(&results_dir)?;
        let mut rng = StdRng::seed_from_u64(config.seed);
        let mut metric = config.eval_metric;

        if let Some((_, path)) = &teacher {
            log.message(&format!("light_model: loaded teacher from {}", path.display()))?;

            model.replace_backbone(BackboneArch::Light, &mut rng)?;
            optimizer.optimizer = optimizer.optimizer.rebuild(model.param_ids());
            criterion.push(
                LossKind::KlDistill {
                    temperature: DISTILL_TEMPERATURE,
                },
                KL_WEIGHT,
            );
            log.message("light_model: student backbone replaced, KL distillation added")?;
        }

        if config.light_feat {
            model.enable_tanh();
            metric = Metric::Hamming;
            log.message("light_feat: tanh codes enabled, evaluating with hamming distance")?;
        }

        if config.light_search {
            model.replace_head_with_pyramid(&PYRAMID_TRAIN_WIDTHS, &PYRAMID_EVAL_WIDTHS, &mut rng)?;
            optimizer.optimizer = optimizer.optimizer.rebuild(model.param_ids());
            criterion.push(
                LossKind::ProbSelfDistill {
                    temperature: DISTILL_TEMPERATURE,
                },
                PROB_SELF_DISTILL_WEIGHT,
            );
            criterion.push(LossKind::SimSelfDistill, SIM_SELF_DISTILL_WEIGHT);
            log.message("light_search: pyramid head added with self distillation")?;
        }

        tracing::debug!(
            head = model.head().name(),
            terms = criterion.terms.len(),
            %metric,
            ?device,
            "engine ready"
        );
        Ok(Engine {
            config,
            results_dir,
            datamanager,
            model,
            criterion,
            optimizer,
            device,
            teacher: teacher.map(|(teacher, _)| teacher),
            metric,
            log,
        })
    }

    pub fn config(&self) -> &EngineConfig {
        &self.config
    }

    pub fn results_dir(&self) -> &Path {
        &self.results_dir
    }

    pub fn model(&self) -> &ReidModel {
        &self.model
    }

    pub fn model_mut(&mut self) -> &mut ReidModel {
        &mut self.model
    }

    pub fn criterion(&self) -> &Criterion {
        &self.criterion
    }

    pub fn optimizer(&self) -> &Optimizer {
        &self.optimizer
    }

    pub fn teacher(&self) -> Option<&ReidModel> {
        self.teacher.as_ref()
    }

    pub fn metric(&self) -> Metric {
        self.metric
    }

    pub fn log(&self) -> &RunLog {
        &self.log
    }

    pub fn save_model(&mut self, epoch: usize) -> Result<()> {
        checkpoint::save(&self.results_dir, &mut self.model, epoch)?;
        tracing::debug!(epoch, dir = %self.results_dir.display(), "checkpoint saved");
        Ok(())
    }

    /// Loads the newest parameter checkpoint and returns its epoch, which is
    /// the epoch training continues from. `None` means a fresh start.
    pub fn resume_latest_model(&mut self) -> Result<Option<usize>> {
        let Some(epoch) = checkpoint::saved_epochs(&self.results_dir)?.last().copied() else {
            self.log.message("no checkpoint found, training from scratch")?;
            return Ok(None);
        };
        let path = checkpoint::epoch_model_path(&self.results_dir, epoch);
        checkpoint::restore(&path, &mut self.model)?;
        self.log
            .message(&format!("successfully resumed model from {}", path.display()))?;
        Ok(Some(epoch))
    }

    /// Runs the remaining epochs and returns the final evaluation.
    pub fn train(&mut self, auto_resume: bool, eval_freq: usize) -> Result<(f64, Vec<f64>)> {
        let start_epoch = if auto_resume {
            self.resume_latest_model()?.unwrap_or(0)
        } else {
            0
        };
        let max_epochs = self.optimizer.max_epochs;

        for epoch in start_epoch..max_epochs {
            self.save_model(epoch)?;
            if eval_freq > 0 && epoch % eval_freq == 0 && epoch > 0 {
                self.eval(false, false)?;
            }
            let results = self.train_an_epoch(epoch)?;
            self.log.epoch(epoch, &time_now(), &results)?;
        }

        self.save_model(max_epochs)?;
        self.eval(false, false)
    }

    /// One pass over the training loader. Returns the formatted epoch averages.
    pub fn train_an_epoch(&mut self, epoch: usize) -> Result<String> {
        let freeze_backbone = epoch < self.optimizer.fix_backbone_epochs;
        self.optimizer
            .lr_scheduler
            .step(&mut self.optimizer.optimizer, epoch);

        let mut meter = MultiItemAverageMeter::default();
        let loader = self.datamanager.train_loader.clone();
        let device = self.device.clone();
        for batch in loader.iter(epoch) {
            let batch = batch?;
            device.run(|| self.train_batch(&batch, epoch, freeze_backbone, &mut meter))?;
        }
        meter.update_one("lr", self.optimizer.optimizer.lr());
        Ok(meter.get_str())
    }

    fn train_batch(
        &mut self,
        batch: &Batch,
        epoch: usize,
        freeze_backbone: bool,
        meter: &mut MultiItemAverageMeter,
    ) -> Result<()> {
        let output = self
            .model
            .forward_train(&batch.images, &batch.pids, freeze_backbone)?;
        let acc = accuracy(&output.first()?.logits, &batch.pids);
        let teacher_output = match &self.teacher {
            Some(teacher) => Some(teacher.forward_frozen(&batch.images)?),
            None => None,
        };
        let loss = self.criterion.compute(&LossInputs {
            student: &output,
            pids: &batch.pids,
            teacher: teacher_output.as_ref(),
        })?;

        self.model.zero_grad();
        self.model.backward(&loss.grads)?;
        let mut params = vec![];
        self.model.params("", &mut params);
        self.optimizer.optimizer.step(&mut params)?;
        drop(params);
        self.optimizer
            .lr_scheduler
            .step(&mut self.optimizer.optimizer, epoch);

        meter.update(&loss.breakdown);
        meter.update_one("Accuracy", acc);
        Ok(())
    }

    /// Features of every sample the loader yields. Each forward pass is timed
    /// between two device barriers and its seconds are added to `time_meter`.
    pub fn extract_feats(
        &self,
        loader: &DataLoader,
        time_meter: &mut AverageMeter,
    ) -> Result<ExtractedSet> {
        let mut singles: Vec<Array2<f64>> = vec![];
        let mut lists: Vec<Vec<Array2<f64>>> = vec![];
        let mut pids = vec![];
        let mut camids = vec![];

        for batch in loader.iter(0) {
            let batch = batch?;
            self.device.synchronize();
            let start = Instant::now();
            let feats = self.device.run(|| self.model.extract(&batch.images, true))?;
            self.device.synchronize();
            time_meter.update(start.elapsed().as_secs_f64(), 1);

            match feats {
                Embeddings::Single(feats) if lists.is_empty() => singles.push(feats),
                Embeddings::List(codes) if singles.is_empty() => {
                    if lists.is_empty() {
                        lists = codes.iter().map(|_| vec![]).collect();
                    }
                    if codes.len() != lists.len() {
                        return Err(ReidError::UnsupportedFeatureShape(format!(
                            "{} codes in one batch, {} in another",
                            codes.len(),
                            lists.len()
                        )));
                    }
                    lists.iter_mut().zip(codes).for_each(|(acc, code)| acc.push(code));
                }
                _ => {
                    return Err(ReidError::UnsupportedFeatureShape(
                        "model switched between single and list features".into(),
                    ))
                }
            }
            pids.extend_from_slice(&batch.pids);
            camids.extend_from_slice(&batch.camids);
        }
        tracing::debug!(
            samples = pids.len(),
            secs_per_batch = time_meter.avg(),
            "features extracted"
        );

        let feats = if !lists.is_empty() {
            Embeddings::List(lists.iter().map(|parts| stack(parts)).collect::<Result<_>>()?)
        } else if !singles.is_empty() {
            Embeddings::Single(stack(&singles)?)
        } else {
            return Err(ReidError::Evaluation("loader yielded no samples".into()));
        };
        Ok(ExtractedSet {
            feats,
            pids,
            camids,
        })
    }

    /// Extracts query and gallery features and evaluates them cross-camera.
    /// Returns mAP and the CMC curve cut to its first ranks.
    pub fn eval(&self, onebyone: bool, return_pr: bool) -> Result<(f64, Vec<f64>)> {
        let mut time_meter = AverageMeter::default();
        let query = self.extract_feats(&self.datamanager.query_loader, &mut time_meter)?;
        let gallery = self.extract_feats(&self.datamanager.gallery_loader, &mut time_meter)?;
        self.log.message(&format!(
            "[Feature Extraction] feature extraction time per batch (batch size {}) is {:.6}s",
            self.datamanager.query_loader.batch_size(),
            time_meter.avg()
        ))?;
        let mode = EvalMode::InterCamera;

        let (mean_ap, mut cmc) = match (&query.feats, &gallery.feats) {
            (Embeddings::Single(qf), Embeddings::Single(gf)) if onebyone => {
                CmcMapEvaluator1b1::new(self.metric, mode).compute(
                    &qf.view(),
                    &query.camids,
                    &query.pids,
                    &gf.view(),
                    &gallery.camids,
                    &gallery.pids,
                )?
            }
            (Embeddings::Single(qf), Embeddings::Single(gf)) => {
                CmcMapEvaluator::new(self.metric, mode)
                    .with_device(self.device.clone())
                    .evaluate(
                        &qf.view(),
                        &query.camids,
                        &query.pids,
                        &gf.view(),
                        &gallery.camids,
                        &gallery.pids,
                    )?
            }
            (Embeddings::List(qf), Embeddings::List(gf)) => {
                CmcMapEvaluatorC2F::new(self.metric, mode).compute(
                    qf,
                    &query.camids,
                    &query.pids,
                    gf,
                    &gallery.camids,
                    &gallery.pids,
                )?
            }
            _ => {
                return Err(ReidError::UnsupportedFeatureShape(
                    "query and gallery features differ in kind".into(),
                ))
            }
        };

        if return_pr {
            let evaluator = PreRecEvaluator::new(self.metric, mode);
            let curve = evaluator.evaluate(
                &finest(&query.feats)?,
                &query.camids,
                &query.pids,
                &finest(&gallery.feats)?,
                &gallery.camids,
                &gallery.pids,
            )?;
            let path = evaluator.plot_prerecall_curve(&self.results_dir, &curve)?;
            self.log
                .message(&format!("precision-recall curve saved to {}", path.display()))?;
        }

        cmc.truncate(CMC_TRUNCATE);
        let ranks: Vec<String> = [1, 5, 10]
            .iter()
            .filter_map(|k| cmc.get(k - 1).map(|v| format!("Rank-{}: {:.4}", k, v)))
            .collect();
        self.log
            .message(&format!("mAP: {:.4}; {}", mean_ap, ranks.join("; ")))?;
        Ok((mean_ap, cmc))
    }

    /// Writes the `top_k` nearest gallery samples of every query to a CSV in
    /// the results directory.
    pub fn visualize(&self, top_k: usize) -> Result<PathBuf> {
        let mut time_meter = AverageMeter::default();
        let query = self.extract_feats(&self.datamanager.query_loader, &mut time_meter)?;
        let gallery = self.extract_feats(&self.datamanager.gallery_loader, &mut time_meter)?;
        let distmat = self
            .metric
            .distances(&finest(&query.feats)?, &finest(&gallery.feats)?)?;
        let query_samples = &self.datamanager.query_dataset.samples;
        let gallery_samples = &self.datamanager.gallery_dataset.samples;

        let path = self.results_dir.join(RANKED_RESULTS);
        let mut writer = csv::Writer::from_path(&path)?;
        for (q, row) in distmat.outer_iter().enumerate() {
            let (qpid, qcam) = (query.pids[q], query.camids[q]);
            let query_image = query_samples[q].describe();
            let ranked = rank(&row)
                .into_iter()
                .filter(|g| {
                    EvalMode::InterCamera.keeps(qpid, qcam, gallery.pids[*g], gallery.camids[*g])
                })
                .take(top_k);
            for (position, g) in ranked.enumerate() {
                let gallery_image = gallery_samples[g].describe();
                writer.serialize(RankedRecord {
                    query: q,
                    query_image: &query_image,
                    rank: position + 1,
                    gallery_image: &gallery_image,
                    distance: row[g],
                    is_match: gallery.pids[g] == qpid,
                })?;
            }
        }
        writer.flush()?;
        self.log
            .message(&format!("ranked results saved to {}", path.display()))?;
        Ok(path)
    }
}

fn stack(parts: &[Array2<f64>]) -> Result<Array2<f64>> {
    let views: Vec<ArrayView2<f64>> = parts.iter().map(|part| part.view()).collect();
    concatenate(Axis(0), &views).map_err(|e| ReidError::Shape(e.to_string()))
}

/// The single embedding, or the widest code of a cascade.
fn finest(feats: &Embeddings) -> Result<ArrayView2<'_, f64>> {
    match feats {
        Embeddings::Single(feats) => Ok(feats.view()),
        Embeddings::List(codes) => codes
            .first()
            .map(|code| code.view())
            .ok_or_else(|| ReidError::UnsupportedFeatureShape("empty code cascade".into())),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn run_dir_appends_flags() {
        let config = EngineConfig {
            results_dir: PathBuf::from("./out/"),
            eval_metric: Metric::Cosine,
            light_model: true,
            light_feat: false,
            light_search: true,
            seed: 0,
        };
        assert_eq!(
            config.run_dir(),
            PathBuf::from("./out/lightmodel(True)-lightfeat(False)-lightsearch(True)")
        );
        assert_eq!(
            config.teacher_path(),
            PathBuf::from("./out/lightmodel(False)-lightfeat(False)-lightsearch(False)")
                .join("final_model.pth.tar")
        );
    }
}
