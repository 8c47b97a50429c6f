use crate::error::{ReidError, Result};
use crate::model::param::{join_name, Module, NamedBuffer, NamedParam, Param};
use ndarray::{Array1, Array2, Axis, Ix1};

/// Batch normalisation over the feature axis of a `(batch, features)` input.
#[derive(serde::Serialize, serde::Deserialize)]
pub struct BatchNormLayer {
    features: usize,
    epsilon: f64,
    momentum: f64,
    gamma: Param<Ix1>,
    beta: Param<Ix1>,
    moving_mean: Array1<f64>,
    moving_variance: Array1<f64>,
    #[serde(skip)]
    cache: Option<BNCache>,
}

struct BNCache {
    xhat: Array2<f64>,
    var_inv: Array1<f64>,
}

impl BatchNormLayer {
    pub fn new(features: usize, epsilon: f64, momentum: f64) -> Self {
        BatchNormLayer {
            features,
            epsilon,
            momentum,
            gamma: Param::new(Array1::ones(features)),
            beta: Param::new(Array1::zeros(features)),
            moving_mean: Array1::zeros(features),
            moving_variance: Array1::ones(features),
            cache: None,
        }
    }

    pub fn features(&self) -> usize {
        self.features
    }

    pub fn forward_propagate(
        &mut self,
        activations: &Array2<f64>,
        is_training: bool,
    ) -> Result<Array2<f64>> {
        self.check_width(activations)?;
        if !is_training {
            self.cache = None;
            return self.infer(activations);
        }
        let batch = activations.nrows().max(1) as f64;
        let mean = activations.sum_axis(Axis(0)) / batch;
        let xmu = activations - &mean;
        let var = xmu.mapv(|x| x * x).sum_axis(Axis(0)) / batch;
        let var_inv = var.mapv(|v| 1. / (v + self.epsilon).sqrt());
        let xhat = &xmu * &var_inv;
        let output = self.scale_and_shift(&xhat);

        self.moving_mean = &self.moving_mean * self.momentum + &mean * (1. - self.momentum);
        self.moving_variance =
            &self.moving_variance * self.momentum + &var * (1. - self.momentum);

        self.cache = Some(BNCache { xhat, var_inv });
        Ok(output)
    }

    /// Normalises with the running statistics.
    pub fn infer(&self, activations: &Array2<f64>) -> Result<Array2<f64>> {
        self.check_width(activations)?;
        let var_inv = self
            .moving_variance
            .mapv(|v| 1. / (v + self.epsilon).sqrt());
        let xhat = (activations - &self.moving_mean) * &var_inv;
        Ok(self.scale_and_shift(&xhat))
    }

    pub fn backward_propagate(&mut self, error: &Array2<f64>) -> Result<Array2<f64>> {
        let cache = self
            .cache
            .take()
            .ok_or(ReidError::MissingCache("batch norm layer"))?;
        let m = error.nrows().max(1) as f64;

        let d_gamma = (error * &cache.xhat).sum_axis(Axis(0));
        let d_beta = error.sum_axis(Axis(0));

        let d_xhat = error * self.gamma.value();
        let d_xhat_sum = d_xhat.sum_axis(Axis(0));
        let d_xhat_xhat_sum = (&d_xhat * &cache.xhat).sum_axis(Axis(0));
        let d_x = (&d_xhat * m - &d_xhat_sum - &cache.xhat * &d_xhat_xhat_sum) * &cache.var_inv
            / m;

        self.gamma.accumulate_grad(&d_gamma);
        self.beta.accumulate_grad(&d_beta);
        Ok(d_x)
    }

    pub fn zero_grad(&mut self) {
        self.gamma.zero_grad();
        self.beta.zero_grad();
    }

    fn scale_and_shift(&self, xhat: &Array2<f64>) -> Array2<f64> {
        xhat * self.gamma.value() + self.beta.value()
    }

    fn check_width(&self, activations: &Array2<f64>) -> Result<()> {
        if activations.ncols() != self.features {
            return Err(ReidError::Shape(format!(
                "batch norm expects {} features, got {}",
                self.features,
                activations.ncols()
            )));
        }
        Ok(())
    }
}

impl Module for BatchNormLayer {
    fn params<'a>(&'a mut self, prefix: &str, out: &mut Vec<NamedParam<'a>>) {
        out.push(NamedParam::new(join_name(prefix, "weight"), &mut self.gamma));
        out.push(NamedParam::new(join_name(prefix, "bias"), &mut self.beta));
    }

    fn buffers<'a>(&'a mut self, prefix: &str, out: &mut Vec<NamedBuffer<'a>>) {
        out.push(NamedBuffer {
            name: join_name(prefix, "running_mean"),
            value: self.moving_mean.view_mut().into_dyn(),
        });
        out.push(NamedBuffer {
            name: join_name(prefix, "running_var"),
            value: self.moving_variance.view_mut().into_dyn(),
        });
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_abs_diff_eq;
    use ndarray::array;

    #[test]
    fn training_output_is_standardised() {
        let mut bn = BatchNormLayer::new(2, 1e-5, 0.9);
        let input = array![[1., 10.], [3., 20.], [5., 30.]];
        let output = bn.forward_propagate(&input, true).unwrap();
        let mean = output.sum_axis(Axis(0)) / 3.;
        assert_abs_diff_eq!(mean, array![0., 0.], epsilon = 1e-9);
        assert_abs_diff_eq!(bn.moving_mean, array![0.3, 2.0], epsilon = 1e-9);
    }

    #[test]
    fn gradient_of_summed_output_is_zero() {
        // The normalised output is shift invariant, so sum(output) has no
        // gradient with respect to the input.
        let mut bn = BatchNormLayer::new(2, 1e-5, 0.9);
        let input = array![[0.5, -1.], [1.5, 2.], [-0.5, 0.]];
        bn.forward_propagate(&input, true).unwrap();
        let d_x = bn.backward_propagate(&Array2::ones((3, 2))).unwrap();
        assert_abs_diff_eq!(d_x, Array2::<f64>::zeros((3, 2)), epsilon = 1e-9);
        assert_eq!(bn.beta.grad().cloned(), Some(array![3., 3.]));
    }

    #[test]
    fn exposes_running_statistics_as_buffers() {
        let mut bn = BatchNormLayer::new(4, 1e-5, 0.9);
        let mut buffers = vec![];
        bn.buffers("bn", &mut buffers);
        let names: Vec<_> = buffers.iter().map(|b| b.name.as_str()).collect();
        assert_eq!(names, ["bn.running_mean", "bn.running_var"]);
    }
}
