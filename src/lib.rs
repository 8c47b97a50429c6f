use config::RunConfig;
use engine::Engine;
use error::{ReidError, Result};
use rand::{rngs::StdRng, SeedableRng};

pub mod config;
pub mod data_loader;
pub mod dataset;
pub mod device;
pub mod engine;
pub mod error;
pub mod evaluation;
pub mod loss;
pub mod model;
pub mod optim;
pub mod utils;

/// Builds datasets, model, criterion, optimizer and device from `config` and
/// hands them to a new engine.
pub fn build_engine(config: &RunConfig) -> Result<Engine> {
    let datamanager = config.build_data_manager()?;
    let mut rng = StdRng::seed_from_u64(config.seed);
    let mut model = config.build_model(datamanager.class_num, &mut rng)?;
    let optimizer = config.build_optimizer(&mut model);
    Engine::new(
        config.engine_config(),
        datamanager,
        model,
        config.criterion.clone(),
        optimizer,
        config.build_device()?,
    )
}

pub fn train(config: &RunConfig) -> Result<(f64, Vec<f64>)> {
    let mut engine = build_engine(config)?;
    engine.train(config.auto_resume, config.eval_freq)
}

/// Evaluates the newest checkpoint of the run described by `config`.
pub fn evaluate(
    config: &RunConfig,
    onebyone: bool,
    return_pr: bool,
    top_k: Option<usize>,
) -> Result<(f64, Vec<f64>)> {
    let mut engine = build_engine(config)?;
    if engine.resume_latest_model()?.is_none() {
        return Err(ReidError::Config(format!(
            "no checkpoint to evaluate in {}",
            engine.results_dir().display()
        )));
    }
    let results = engine.eval(onebyone, return_pr)?;
    if let Some(top_k) = top_k {
        engine.visualize(top_k)?;
    }
    Ok(results)
}
