#[derive(Debug, Clone, Copy, PartialEq, serde::Serialize, serde::Deserialize)]
pub enum Activation {
    Linear,
    ReLU,
    Sigmoid,
    Tanh,
}

impl Activation {
    pub fn activate(&self, x: f64) -> f64 {
        match self {
            Activation::Linear => Self::linear(x),
            Activation::ReLU => Self::relu(x),
            Activation::Sigmoid => Self::sigmoid(x),
            Activation::Tanh => Self::tanh(x),
        }
    }

    /// Derivative evaluated at the pre-activation input `x`.
    pub fn deactivate(&self, x: f64) -> f64 {
        match self {
            Activation::Linear => Self::linear_deriv(x),
            Activation::ReLU => Self::relu_deriv(x),
            Activation::Sigmoid => Self::sigmoid_deriv(x),
            Activation::Tanh => Self::tanh_deriv(x),
        }
    }

    pub fn linear(x: f64) -> f64 {
        x
    }

    pub fn linear_deriv(_: f64) -> f64 {
        1.0
    }

    pub fn relu(x: f64) -> f64 {
        x.max(0.0)
    }

    pub fn relu_deriv(x: f64) -> f64 {
        if x > 0.0 {
            1.0
        } else {
            0.0
        }
    }

    pub fn sigmoid(x: f64) -> f64 {
        1.0 / (1.0 + (-x).exp())
    }

    pub fn sigmoid_deriv(x: f64) -> f64 {
        let sigmoid_x = Self::sigmoid(x);
        sigmoid_x * (1.0 - sigmoid_x)
    }

    pub fn tanh(x: f64) -> f64 {
        x.tanh()
    }

    pub fn tanh_deriv(x: f64) -> f64 {
        let tanh_x = x.tanh();
        1.0 - tanh_x * tanh_x
    }
}

#[cfg(test)]
mod tests {
    use super::Activation;

    #[test]
    fn tanh_is_bounded() {
        for x in [-50., -1., 0., 1., 50.] {
            let y = Activation::Tanh.activate(x);
            assert!(y >= -1. && y <= 1.);
        }
        assert_eq!(Activation::Tanh.deactivate(0.), 1.);
    }

    #[test]
    fn relu_derivative_is_a_step() {
        assert_eq!(Activation::ReLU.deactivate(-0.5), 0.);
        assert_eq!(Activation::ReLU.deactivate(2.5), 1.);
    }
}
