use crate::error::{ReidError, Result};
use crate::model::param::{join_name, Module, NamedParam, Param};
use crate::utils::{l2_normalize_rows, l2_normalize_rows_backward};
use ndarray::{Array1, Array2, Ix2};
use rand::Rng;
use rand_distr::StandardNormal;
use serde::{Deserialize, Serialize};

const CLASSIFIER_INIT_STD: f64 = 0.001;

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub enum ClassifierKind {
    Linear,
    /// Scaled cosine similarity to normalised class weights.
    Cosine { scale: f64 },
    /// Circle-loss logits; the adaptive weights are treated as constants.
    Circle { scale: f64, margin: f64 },
}

/// Identity classifier over `num_classes`; weights are `(num_classes, in_dim)`.
#[derive(Serialize, Deserialize)]
pub struct Classifier {
    kind: ClassifierKind,
    in_dim: usize,
    num_classes: usize,
    weights: Param<Ix2>,
    #[serde(skip)]
    cache: Option<ClassifierCache>,
}

struct ClassifierCache {
    input: Array2<f64>,
    cosine: Option<CosineCache>,
}

struct CosineCache {
    input_hat: Array2<f64>,
    input_norms: Array1<f64>,
    weights_hat: Array2<f64>,
    weight_norms: Array1<f64>,
    cos: Array2<f64>,
    /// d logits / d cosine, elementwise.
    slope: Array2<f64>,
}

impl Classifier {
    pub fn new<R: Rng>(
        kind: ClassifierKind,
        in_dim: usize,
        num_classes: usize,
        rng: &mut R,
    ) -> Self {
        let weights = Array2::from_shape_fn((num_classes, in_dim), |_| {
            rng.sample::<f64, _>(StandardNormal) * CLASSIFIER_INIT_STD
        });
        Classifier {
            kind,
            in_dim,
            num_classes,
            weights: Param::new(weights),
            cache: None,
        }
    }

    pub fn kind(&self) -> ClassifierKind {
        self.kind
    }

    pub fn num_classes(&self) -> usize {
        self.num_classes
    }

    /// Labels are required for margin-based classifiers in training.
    pub fn forward_propagate(
        &mut self,
        input: &Array2<f64>,
        labels: Option<&[usize]>,
        is_training: bool,
    ) -> Result<Array2<f64>> {
        self.check_input(input, labels)?;
        let (logits, cosine) = match self.kind {
            ClassifierKind::Linear => (input.dot(&self.weights.value().t()), None),
            ClassifierKind::Cosine { scale } => {
                let cache = self.cosine(input, |_, _, _| scale);
                (&cache.slope * &cache.cos, Some(cache))
            }
            ClassifierKind::Circle { scale, margin } => match labels.filter(|_| is_training) {
                Some(labels) => {
                    let cache = self.cosine(input, |row, col, cos| {
                        if labels[row] == col {
                            scale * (1. + margin - cos).max(0.)
                        } else {
                            scale * (cos + margin).max(0.)
                        }
                    });
                    let mut logits = &cache.slope * &cache.cos;
                    logits.indexed_iter_mut().for_each(|((row, col), logit)| {
                        let delta = if labels[row] == col { 1. - margin } else { margin };
                        *logit -= cache.slope[[row, col]] * delta;
                    });
                    (logits, Some(cache))
                }
                None => {
                    let cache = self.cosine(input, |_, _, _| scale);
                    (&cache.slope * &cache.cos, Some(cache))
                }
            },
        };
        self.cache = if is_training {
            Some(ClassifierCache {
                input: input.clone(),
                cosine,
            })
        } else {
            None
        };
        Ok(logits)
    }

    pub fn infer(&self, input: &Array2<f64>) -> Result<Array2<f64>> {
        self.check_input(input, None)?;
        Ok(match self.kind {
            ClassifierKind::Linear => input.dot(&self.weights.value().t()),
            ClassifierKind::Cosine { scale } | ClassifierKind::Circle { scale, .. } => {
                let cache = self.cosine(input, |_, _, _| scale);
                &cache.slope * &cache.cos
            }
        })
    }

    pub fn backward_propagate(&mut self, error: &Array2<f64>) -> Result<Array2<f64>> {
        let cache = self
            .cache
            .take()
            .ok_or(ReidError::MissingCache("classifier"))?;
        match cache.cosine {
            None => {
                self.weights.accumulate_grad(&error.t().dot(&cache.input));
                Ok(error.dot(self.weights.value()))
            }
            Some(cosine) => {
                let d_cos = error * &cosine.slope;
                let d_input_hat = d_cos.dot(&cosine.weights_hat);
                let d_weights_hat = d_cos.t().dot(&cosine.input_hat);
                self.weights.accumulate_grad(&l2_normalize_rows_backward(
                    &cosine.weights_hat,
                    &cosine.weight_norms,
                    &d_weights_hat,
                ));
                Ok(l2_normalize_rows_backward(
                    &cosine.input_hat,
                    &cosine.input_norms,
                    &d_input_hat,
                ))
            }
        }
    }

    pub fn zero_grad(&mut self) {
        self.weights.zero_grad();
    }

    fn cosine<F>(&self, input: &Array2<f64>, slope: F) -> CosineCache
    where
        F: Fn(usize, usize, f64) -> f64,
    {
        let (input_hat, input_norms) = l2_normalize_rows(&input.view());
        let (weights_hat, weight_norms) = l2_normalize_rows(&self.weights.value().view());
        let cos = input_hat.dot(&weights_hat.t());
        let slope = Array2::from_shape_fn(cos.raw_dim(), |(row, col)| {
            slope(row, col, cos[[row, col]])
        });
        CosineCache {
            input_hat,
            input_norms,
            weights_hat,
            weight_norms,
            cos,
            slope,
        }
    }

    fn check_input(&self, input: &Array2<f64>, labels: Option<&[usize]>) -> Result<()> {
        if input.ncols() != self.in_dim {
            return Err(ReidError::Shape(format!(
                "classifier expects {} features, got {}",
                self.in_dim,
                input.ncols()
            )));
        }
        if let Some(labels) = labels {
            if labels.len() != input.nrows() {
                return Err(ReidError::Shape(format!(
                    "{} labels for a batch of {}",
                    labels.len(),
                    input.nrows()
                )));
            }
            if let Some(label) = labels.iter().find(|label| **label >= self.num_classes) {
                return Err(ReidError::Shape(format!(
                    "label {} out of range for {} classes",
                    label, self.num_classes
                )));
            }
        }
        Ok(())
    }
}

impl Module for Classifier {
    fn params<'a>(&'a mut self, prefix: &str, out: &mut Vec<NamedParam<'a>>) {
        out.push(NamedParam::new(join_name(prefix, "weight"), &mut self.weights));
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_abs_diff_eq;
    use ndarray::array;
    use rand::{rngs::StdRng, SeedableRng};

    fn classifier(kind: ClassifierKind) -> Classifier {
        let mut rng = StdRng::seed_from_u64(11);
        Classifier::new(kind, 3, 4, &mut rng)
    }

    #[test]
    fn cosine_logits_are_bounded_by_scale() {
        let mut cls = classifier(ClassifierKind::Cosine { scale: 16. });
        let logits = cls
            .forward_propagate(&array![[1., 2., 3.], [-1., 0., 4.]], None, true)
            .unwrap();
        assert_eq!(logits.dim(), (2, 4));
        assert!(logits.iter().all(|l| l.abs() <= 16. + 1e-9));
    }

    #[test]
    fn circle_requires_labels_only_in_training() {
        let input = array![[1., 2., 3.], [-1., 0., 4.]];
        let mut cls = classifier(ClassifierKind::Circle { scale: 64., margin: 0.35 });
        let train = cls.forward_propagate(&input, Some(&[0, 3]), true).unwrap();
        let eval = cls.infer(&input).unwrap();
        assert_eq!(train.dim(), eval.dim());
        assert!(cls.forward_propagate(&input, Some(&[0, 9]), true).is_err());
    }

    #[test]
    fn cosine_backward_matches_finite_difference() {
        let input = array![[0.3, -0.7, 1.1]];
        let mut cls = classifier(ClassifierKind::Cosine { scale: 2. });
        // loss = logits[0, 1]
        let mut error = Array2::zeros((1, 4));
        error[[0, 1]] = 1.;
        cls.forward_propagate(&input, None, true).unwrap();
        let d_input = cls.backward_propagate(&error).unwrap();

        let h = 1e-6;
        for k in 0..3 {
            let mut plus = input.clone();
            plus[[0, k]] += h;
            let mut minus = input.clone();
            minus[[0, k]] -= h;
            let numeric =
                (cls.infer(&plus).unwrap()[[0, 1]] - cls.infer(&minus).unwrap()[[0, 1]]) / (2. * h);
            assert_abs_diff_eq!(d_input[[0, k]], numeric, epsilon = 1e-6);
        }
    }
}
