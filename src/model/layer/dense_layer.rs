use crate::error::{ReidError, Result};
use crate::model::param::{join_name, Module, NamedParam, Param};
use ndarray::{Array1, Array2, Axis, Ix1, Ix2};
use rand::Rng;
use rand_distr::StandardNormal;

#[derive(serde::Serialize, serde::Deserialize)]
pub struct DenseLayer {
    input_size: usize,
    output_size: usize,
    weights: Param<Ix2>,
    biases: Option<Param<Ix1>>,
    #[serde(skip)]
    input: Option<Array2<f64>>,
}

impl DenseLayer {
    /// He-normal initialised layer.
    pub fn new<R: Rng>(
        input_size: usize,
        output_size: usize,
        bias: Option<f64>,
        rng: &mut R,
    ) -> Self {
        let std_dev = (2.0 / input_size.max(1) as f64).sqrt();
        Self::with_std(input_size, output_size, bias, std_dev, rng)
    }

    pub fn with_std<R: Rng>(
        input_size: usize,
        output_size: usize,
        bias: Option<f64>,
        std_dev: f64,
        rng: &mut R,
    ) -> Self {
        let weights: Array2<f64> = Array2::from_shape_fn((output_size, input_size), |_| {
            rng.sample::<f64, _>(StandardNormal) * std_dev
        });
        DenseLayer {
            input_size,
            output_size,
            weights: Param::new(weights),
            biases: bias.map(|b| Param::new(Array1::from_elem(output_size, b))),
            input: None,
        }
    }

    pub fn input_size(&self) -> usize {
        self.input_size
    }

    pub fn output_size(&self) -> usize {
        self.output_size
    }

    pub fn forward_propagate(
        &mut self,
        input: &Array2<f64>,
        is_training: bool,
    ) -> Result<Array2<f64>> {
        let output = self.infer(input)?;
        self.input = if is_training { Some(input.clone()) } else { None };
        Ok(output)
    }

    pub fn infer(&self, input: &Array2<f64>) -> Result<Array2<f64>> {
        if input.ncols() != self.input_size {
            return Err(ReidError::Shape(format!(
                "dense layer expects {} inputs, got {}",
                self.input_size,
                input.ncols()
            )));
        }
        let mut output = input.dot(&self.weights.value().t());
        if let Some(biases) = &self.biases {
            output += biases.value();
        }
        Ok(output)
    }

    /// Accumulates weight and bias gradients and returns the gradient with
    /// respect to the layer input.
    pub fn backward_propagate(&mut self, error: &Array2<f64>) -> Result<Array2<f64>> {
        let input = self.input.take().ok_or(ReidError::MissingCache("dense layer"))?;
        self.weights.accumulate_grad(&error.t().dot(&input));
        if let Some(biases) = &mut self.biases {
            biases.accumulate_grad(&error.sum_axis(Axis(0)));
        }
        Ok(error.dot(self.weights.value()))
    }

    pub fn zero_grad(&mut self) {
        self.weights.zero_grad();
        if let Some(biases) = &mut self.biases {
            biases.zero_grad();
        }
    }
}

impl Module for DenseLayer {
    fn params<'a>(&'a mut self, prefix: &str, out: &mut Vec<NamedParam<'a>>) {
        out.push(NamedParam::new(join_name(prefix, "weight"), &mut self.weights));
        if let Some(biases) = &mut self.biases {
            out.push(NamedParam::new(join_name(prefix, "bias"), biases));
        }
    }
}
