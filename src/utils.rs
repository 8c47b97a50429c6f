use crate::error::Result;
use ndarray::{Array1, Array2, ArrayView2, Axis, Zip};
use serde::Serialize;
use std::io::{BufWriter, Write};
use std::path::Path;

const NORM_EPSILON: f64 = 1e-12;

pub fn time_now() -> String {
    chrono::Local::now().format("%Y-%m-%d %H:%M:%S").to_string()
}

/// Serialises `value` to `<path>.tmp`, syncs it and renames it over `path`, so
/// `path` never holds a partial file.
pub fn write_json<T: Serialize + ?Sized>(path: &Path, value: &T) -> Result<()> {
    let mut tmp_name = path.file_name().unwrap_or_default().to_os_string();
    tmp_name.push(".tmp");
    let tmp = path.with_file_name(tmp_name);

    let mut writer = BufWriter::new(std::fs::File::create(&tmp)?);
    serde_json::to_writer(&mut writer, value)?;
    writer.flush()?;
    writer.get_ref().sync_all()?;
    std::fs::rename(&tmp, path)?;
    Ok(())
}

/// L2-normalises every row, returning the normalised rows and the row norms
/// that were divided out.
pub fn l2_normalize_rows(input: &ArrayView2<f64>) -> (Array2<f64>, Array1<f64>) {
    let norms = input.map_axis(Axis(1), |row| row.dot(&row).sqrt().max(NORM_EPSILON));
    let mut normalized = input.to_owned();
    normalized
        .outer_iter_mut()
        .zip(norms.iter())
        .for_each(|(mut row, norm)| row /= *norm);
    (normalized, norms)
}

/// Gradient of `x / |x|` (row-wise) with respect to `x`.
pub fn l2_normalize_rows_backward(
    normalized: &Array2<f64>,
    norms: &Array1<f64>,
    d_normalized: &Array2<f64>,
) -> Array2<f64> {
    let mut d_input = d_normalized.clone();
    Zip::from(d_input.rows_mut())
        .and(normalized.rows())
        .and(norms)
        .for_each(|mut d_row, row, norm| {
            let projection = row.dot(&d_row);
            d_row.scaled_add(-projection, &row);
            d_row /= *norm;
        });
    d_input
}

pub fn softmax_rows(logits: &Array2<f64>, temperature: f64) -> Array2<f64> {
    let mut probs = logits / temperature;
    probs.outer_iter_mut().for_each(|mut row| {
        let max = row.fold(f64::NEG_INFINITY, |acc, x| acc.max(*x));
        row.mapv_inplace(|x| (x - max).exp());
        let sum = row.sum();
        row /= sum;
    });
    probs
}

pub fn log_softmax_rows(logits: &Array2<f64>, temperature: f64) -> Array2<f64> {
    let mut log_probs = logits / temperature;
    log_probs.outer_iter_mut().for_each(|mut row| {
        let max = row.fold(f64::NEG_INFINITY, |acc, x| acc.max(*x));
        let log_sum = row.iter().map(|x| (x - max).exp()).sum::<f64>().ln() + max;
        row.mapv_inplace(|x| x - log_sum);
    });
    log_probs
}

pub fn argmax_rows(values: &Array2<f64>) -> Vec<usize> {
    values
        .outer_iter()
        .map(|row| {
            row.iter()
                .enumerate()
                .fold((0, f64::NEG_INFINITY), |best, (idx, val)| {
                    if *val > best.1 {
                        (idx, *val)
                    } else {
                        best
                    }
                })
                .0
        })
        .collect()
}

/// Top-1 accuracy of `logits` against integer labels.
pub fn accuracy(logits: &Array2<f64>, labels: &[usize]) -> f64 {
    if labels.is_empty() {
        return 0.;
    }
    let hits = argmax_rows(logits)
        .iter()
        .zip(labels)
        .filter(|(pred, label)| pred == label)
        .count();
    hits as f64 / labels.len() as f64
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_abs_diff_eq;
    use ndarray::array;

    #[test]
    fn json_is_renamed_into_place() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("values.json");
        std::fs::write(&path, "[0.0").unwrap();
        write_json(&path, &[1.5, -2.0]).unwrap();

        let text = std::fs::read_to_string(&path).unwrap();
        let values: Vec<f64> = serde_json::from_str(&text).unwrap();
        assert_eq!(values, [1.5, -2.0]);
        let names: Vec<_> = std::fs::read_dir(dir.path())
            .unwrap()
            .map(|entry| entry.unwrap().file_name())
            .collect();
        assert_eq!(names, ["values.json"]);
    }

    #[test]
    fn softmax_rows_sum_to_one() {
        let probs = softmax_rows(&array![[1., 2., 3.], [-5., 0., 5.]], 1.);
        for row in probs.outer_iter() {
            assert_abs_diff_eq!(row.sum(), 1., epsilon = 1e-12);
        }
        let log_probs = log_softmax_rows(&array![[1., 2., 3.]], 2.);
        let expected = softmax_rows(&array![[1., 2., 3.]], 2.).mapv(f64::ln);
        assert_abs_diff_eq!(log_probs, expected, epsilon = 1e-12);
    }

    #[test]
    fn normalize_backward_is_orthogonal_to_row() {
        let input = array![[3., 4.], [1., 0.]];
        let (normalized, norms) = l2_normalize_rows(&input.view());
        assert_abs_diff_eq!(normalized[[0, 0]], 0.6, epsilon = 1e-12);
        assert_abs_diff_eq!(norms[0], 5., epsilon = 1e-12);

        let grad = l2_normalize_rows_backward(&normalized, &norms, &array![[0.6, 0.8], [2., 0.]]);
        assert_abs_diff_eq!(grad, Array2::<f64>::zeros((2, 2)), epsilon = 1e-12);
    }

    #[test]
    fn accuracy_counts_top1_hits() {
        let logits = array![[0.1, 0.9], [0.8, 0.2], [0.3, 0.7]];
        assert_abs_diff_eq!(accuracy(&logits, &[1, 0, 0]), 2. / 3., epsilon = 1e-12);
    }
}
