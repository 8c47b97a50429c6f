use crate::error::{ReidError, Result};
use crate::utils::softmax_rows;
use ndarray::Array2;

/// Label-smoothed cross-entropy averaged over the batch. Returns the loss and
/// its gradient with respect to `logits`.
pub fn cross_entropy(
    logits: &Array2<f64>,
    labels: &[usize],
    epsilon: f64,
) -> Result<(f64, Array2<f64>)> {
    let (batch, classes) = logits.dim();
    if labels.len() != batch {
        return Err(ReidError::Shape(format!(
            "{} labels for {} logits rows",
            labels.len(),
            batch
        )));
    }
    if let Some(label) = labels.iter().find(|label| **label >= classes) {
        return Err(ReidError::Shape(format!(
            "label {} out of range for {} classes",
            label, classes
        )));
    }

    let smooth = epsilon / classes as f64;
    let mut targets = Array2::from_elem((batch, classes), smooth);
    for (row, label) in labels.iter().enumerate() {
        targets[[row, *label]] += 1. - epsilon;
    }

    let probs = softmax_rows(logits, 1.);
    let loss = -(&targets * &probs.mapv(|p| p.max(f64::MIN_POSITIVE).ln())).sum() / batch as f64;
    let grad = (probs - targets) / batch as f64;
    Ok((loss, grad))
}
