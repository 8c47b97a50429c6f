use crate::config::{EPOCH_MODEL, EPOCH_MODEL_EXT, FINAL_MODEL};
use crate::error::{ReidError, Result};
use crate::model::param::StateDict;
use crate::model::ReidModel;
use crate::utils::write_json;
use std::io::BufReader;
use std::path::{Path, PathBuf};

pub fn epoch_model_path(dir: &Path, epoch: usize) -> PathBuf {
    dir.join(format!("{}{}{}", EPOCH_MODEL, epoch, EPOCH_MODEL_EXT))
}

pub fn final_model_path(dir: &Path) -> PathBuf {
    dir.join(FINAL_MODEL)
}

fn parse_epoch(file_name: &str) -> Option<usize> {
    file_name
        .strip_prefix(EPOCH_MODEL)?
        .strip_suffix(EPOCH_MODEL_EXT)?
        .parse()
        .ok()
}

/// Epochs of the parameter checkpoints in `dir`, ascending. A missing
/// directory has none.
pub fn saved_epochs(dir: &Path) -> Result<Vec<usize>> {
    if !dir.is_dir() {
        return Ok(vec![]);
    }
    let mut epochs = vec![];
    for entry in std::fs::read_dir(dir)? {
        let entry = entry?;
        if let Some(epoch) = entry.file_name().to_str().and_then(parse_epoch) {
            epochs.push(epoch);
        }
    }
    epochs.sort_unstable();
    Ok(epochs)
}

/// Writes the parameters of `model` for `epoch` and refreshes the full
/// snapshot, then removes every other epoch file. Each file is replaced
/// atomically.
pub fn save(dir: &Path, model: &mut ReidModel, epoch: usize) -> Result<()> {
    std::fs::create_dir_all(dir)?;
    write_json(&epoch_model_path(dir, epoch), &model.state_dict())?;
    model.save(final_model_path(dir))?;

    for old in saved_epochs(dir)?.into_iter().filter(|e| *e != epoch) {
        std::fs::remove_file(epoch_model_path(dir, old))?;
    }
    Ok(())
}

fn corrupt(path: &Path, reason: impl ToString) -> ReidError {
    ReidError::CheckpointCorrupt {
        path: path.to_path_buf(),
        reason: reason.to_string(),
    }
}

pub fn load_state(path: &Path) -> Result<StateDict> {
    let file = std::fs::File::open(path)?;
    serde_json::from_reader(BufReader::new(file)).map_err(|e| corrupt(path, e))
}

/// Restores a parameter checkpoint into `model`. Anything that does not fit is
/// reported as corruption.
pub fn restore(path: &Path, model: &mut ReidModel) -> Result<()> {
    let state = load_state(path)?;
    model.load_state_dict(&state).map_err(|e| corrupt(path, e))
}

pub fn load_full(path: &Path) -> Result<ReidModel> {
    ReidModel::load(path).map_err(|e| match e {
        ReidError::Json(e) => corrupt(path, e),
        other => other,
    })
}
