use crate::error::{ReidError, Result};
use crate::model::activation::Activation;
use ndarray::{Array2, Zip};
use rayon::prelude::*;

#[derive(serde::Serialize, serde::Deserialize)]
pub struct ActivationLayer {
    #[serde(skip)]
    input: Option<Array2<f64>>,
    activation: Activation,
}

impl ActivationLayer {
    pub fn new(activation: Activation) -> Self {
        ActivationLayer {
            activation,
            input: None,
        }
    }

    pub fn activation(&self) -> Activation {
        self.activation
    }

    pub fn forward_propagate(&mut self, input: &Array2<f64>, is_training: bool) -> Array2<f64> {
        let output = self.infer(input);
        self.input = if is_training { Some(input.clone()) } else { None };
        output
    }

    pub fn infer(&self, input: &Array2<f64>) -> Array2<f64> {
        let mut output = input.to_owned();
        output
            .par_iter_mut()
            .for_each(|inp| *inp = self.activation.activate(*inp));
        output
    }

    pub fn backward_propagate(&mut self, error: &Array2<f64>) -> Result<Array2<f64>> {
        let input = self
            .input
            .take()
            .ok_or(ReidError::MissingCache("activation layer"))?;
        let mut error = error.to_owned();
        Zip::from(&mut error)
            .and(&input)
            .par_for_each(|err, inp| *err *= self.activation.deactivate(*inp));
        Ok(error)
    }
}
