use crate::error::{ReidError, Result};
use crate::utils::{l2_normalize_rows, l2_normalize_rows_backward, log_softmax_rows, softmax_rows};
use ndarray::Array2;

/// `KL(softmax(target / T) || softmax(student / T)) * T^2`, averaged over the
/// batch. The target is constant; the gradient is for `student` only.
pub fn kl_divergence(
    student: &Array2<f64>,
    target: &Array2<f64>,
    temperature: f64,
) -> Result<(f64, Array2<f64>)> {
    if student.dim() != target.dim() {
        return Err(ReidError::Shape(format!(
            "distillation between logits of shape {:?} and {:?}",
            student.dim(),
            target.dim()
        )));
    }
    let batch = student.nrows().max(1) as f64;
    let log_p_student = log_softmax_rows(student, temperature);
    let log_p_target = log_softmax_rows(target, temperature);
    let p_target = softmax_rows(target, temperature);
    let p_student = log_p_student.mapv(f64::exp);

    let loss = (&p_target * &(&log_p_target - &log_p_student)).sum() / batch
        * temperature
        * temperature;
    let grad = (p_student - p_target) * (temperature / batch);
    Ok((loss, grad))
}

/// Mean squared difference between the cosine-similarity matrices of two
/// batches of embeddings. Widths may differ; batch sizes may not. The gradient
/// is for `student` only.
pub fn similarity_mse(student: &Array2<f64>, target: &Array2<f64>) -> Result<(f64, Array2<f64>)> {
    if student.nrows() != target.nrows() {
        return Err(ReidError::Shape(format!(
            "similarity distillation between batches of {} and {}",
            student.nrows(),
            target.nrows()
        )));
    }
    let (student_hat, student_norms) = l2_normalize_rows(&student.view());
    let (target_hat, _) = l2_normalize_rows(&target.view());
    let student_sim = student_hat.dot(&student_hat.t());
    let target_sim = target_hat.dot(&target_hat.t());

    let diff = student_sim - target_sim;
    let count = diff.len().max(1) as f64;
    let loss = diff.mapv(|d| d * d).sum() / count;

    let d_sim = diff * (2. / count);
    let d_hat = (&d_sim + &d_sim.t()).dot(&student_hat);
    let grad = l2_normalize_rows_backward(&student_hat, &student_norms, &d_hat);
    Ok((loss, grad))
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_abs_diff_eq;
    use ndarray::array;

    #[test]
    fn identical_distributions_have_no_divergence() {
        let logits = array![[1., 2., 0.5], [0., -1., 3.]];
        let (loss, grad) = kl_divergence(&logits, &logits, 4.).unwrap();
        assert_abs_diff_eq!(loss, 0., epsilon = 1e-12);
        assert_abs_diff_eq!(grad, Array2::<f64>::zeros((2, 3)), epsilon = 1e-12);
    }

    #[test]
    fn kl_gradient_matches_finite_difference() {
        let student = array![[0.2, -0.4, 1.0]];
        let target = array![[1.5, 0.0, -0.5]];
        let (_, grad) = kl_divergence(&student, &target, 4.).unwrap();
        let h = 1e-6;
        for k in 0..3 {
            let mut plus = student.clone();
            plus[[0, k]] += h;
            let mut minus = student.clone();
            minus[[0, k]] -= h;
            let numeric = (kl_divergence(&plus, &target, 4.).unwrap().0
                - kl_divergence(&minus, &target, 4.).unwrap().0)
                / (2. * h);
            assert_abs_diff_eq!(grad[[0, k]], numeric, epsilon = 1e-6);
        }
    }

    #[test]
    fn similarity_ignores_scale_and_width() {
        let target = array![[1., 0., 0., 0.], [0., 1., 0., 0.]];
        let student = array![[3., 0.], [0., 0.5]];
        let (loss, grad) = similarity_mse(&student, &target).unwrap();
        assert_abs_diff_eq!(loss, 0., epsilon = 1e-12);
        assert_abs_diff_eq!(grad, Array2::<f64>::zeros((2, 2)), epsilon = 1e-12);
    }

    #[test]
    fn similarity_gradient_matches_finite_difference() {
        let student = array![[0.3, 1.0], [0.9, -0.2], [-0.5, 0.4]];
        let target = array![[1., 0., 2.], [0., 1., 1.], [1., 1., 0.]];
        let (_, grad) = similarity_mse(&student, &target).unwrap();
        let h = 1e-6;
        for (r, c) in [(0, 0), (1, 1), (2, 0)] {
            let mut plus = student.clone();
            plus[[r, c]] += h;
            let mut minus = student.clone();
            minus[[r, c]] -= h;
            let numeric = (similarity_mse(&plus, &target).unwrap().0
                - similarity_mse(&minus, &target).unwrap().0)
                / (2. * h);
            assert_abs_diff_eq!(grad[[r, c]], numeric, epsilon = 1e-6);
        }
    }
}
