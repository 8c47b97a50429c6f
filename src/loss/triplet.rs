use crate::error::{ReidError, Result};
use ndarray::{Array2, Axis};

const DISTANCE_EPSILON: f64 = 1e-12;

/// Batch-hard triplet loss on euclidean distances: for every anchor the
/// farthest positive and the closest negative form the triplet. Anchors without
/// a positive or a negative in the batch do not contribute.
pub fn batch_hard_triplet(
    feats: &Array2<f64>,
    labels: &[usize],
    margin: f64,
) -> Result<(f64, Array2<f64>)> {
    let batch = feats.nrows();
    if labels.len() != batch {
        return Err(ReidError::Shape(format!(
            "{} labels for {} feature rows",
            labels.len(),
            batch
        )));
    }

    let sq_norms = feats.map_axis(Axis(1), |row| row.dot(&row));
    let gram = feats.dot(&feats.t());
    let dist = Array2::from_shape_fn((batch, batch), |(i, j)| {
        ((sq_norms[i] + sq_norms[j] - 2. * gram[[i, j]]).max(0.) + DISTANCE_EPSILON).sqrt()
    });

    let mut grad: Array2<f64> = Array2::zeros(feats.raw_dim());
    let mut loss = 0.;
    for anchor in 0..batch {
        let positive = (0..batch)
            .filter(|&j| j != anchor && labels[j] == labels[anchor])
            .max_by(|&a, &b| dist[[anchor, a]].total_cmp(&dist[[anchor, b]]));
        let negative = (0..batch)
            .filter(|&j| labels[j] != labels[anchor])
            .min_by(|&a, &b| dist[[anchor, a]].total_cmp(&dist[[anchor, b]]));
        let (Some(positive), Some(negative)) = (positive, negative) else {
            continue;
        };

        let hinge = dist[[anchor, positive]] - dist[[anchor, negative]] + margin;
        if hinge <= 0. {
            continue;
        }
        loss += hinge;
        for (other, sign) in [(positive, 1.), (negative, -1.)] {
            let diff = &feats.row(anchor) - &feats.row(other);
            let step = diff * (sign / dist[[anchor, other]] / batch as f64);
            let mut anchor_grad = grad.row_mut(anchor);
            anchor_grad += &step;
            let mut other_grad = grad.row_mut(other);
            other_grad -= &step;
        }
    }
    Ok((loss / batch.max(1) as f64, grad))
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_abs_diff_eq;
    use ndarray::array;

    #[test]
    fn separated_identities_have_zero_loss() {
        let feats = array![[0., 0.], [0.1, 0.], [10., 10.], [10., 10.1]];
        let (loss, grad) = batch_hard_triplet(&feats, &[0, 0, 1, 1], 0.3).unwrap();
        assert_eq!(loss, 0.);
        assert!(grad.iter().all(|g| *g == 0.));
    }

    #[test]
    fn violating_triplet_matches_hinge() {
        // Anchor 0: positive at distance 2, negative at distance 1.
        let feats = array![[0., 0.], [2., 0.], [0., 1.], [2., 1.]];
        let (loss, grad) = batch_hard_triplet(&feats, &[0, 0, 1, 1], 0.5).unwrap();
        assert!(loss > 0.);
        // Pulling anchor 0 towards its positive lowers the loss.
        assert!(grad[[0, 0]] < 0.);

        let h = 1e-6;
        let mut plus = feats.clone();
        plus[[0, 0]] += h;
        let mut minus = feats.clone();
        minus[[0, 0]] -= h;
        let numeric = (batch_hard_triplet(&plus, &[0, 0, 1, 1], 0.5).unwrap().0
            - batch_hard_triplet(&minus, &[0, 0, 1, 1], 0.5).unwrap().0)
            / (2. * h);
        assert_abs_diff_eq!(grad[[0, 0]], numeric, epsilon = 1e-5);
    }
}
