use ndarray::{ArrayD, ArrayViewD, Zip};

#[derive(Debug, Clone, Copy, PartialEq, serde::Serialize, serde::Deserialize)]
pub struct AdamParameters {
    pub epsilon: f64,
    pub beta_1: f64,
    pub beta_2: f64,
    pub ams_grad: bool,
}

impl Default for AdamParameters {
    fn default() -> Self {
        AdamParameters {
            epsilon: 1e-8,
            beta_1: 0.9,
            beta_2: 0.999,
            ams_grad: false,
        }
    }
}

pub struct Adam {
    epsilon: f64,
    beta_1: f64,
    beta_2: f64,
    momentum: ArrayD<f64>,
    velocity: ArrayD<f64>,
    max_velocity: Option<ArrayD<f64>>,
    iteration_num: i32,
}

impl Adam {
    pub fn new(params: &AdamParameters, shape: &[usize]) -> Self {
        Self {
            epsilon: params.epsilon,
            beta_1: params.beta_1,
            beta_2: params.beta_2,
            momentum: ArrayD::zeros(shape),
            velocity: ArrayD::zeros(shape),
            max_velocity: params.ams_grad.then(|| ArrayD::zeros(shape)),
            iteration_num: 0,
        }
    }

    pub fn optimize(&mut self, changes: &ArrayViewD<f64>, lr: f64) -> ArrayD<f64> {
        self.iteration_num += 1;
        self.momentum = &self.momentum * self.beta_1 + changes * (1. - self.beta_1);
        self.velocity = &self.velocity * self.beta_2 + changes.mapv(|c| c * c) * (1. - self.beta_2);

        let m_hat = &self.momentum / (1. - self.beta_1.powi(self.iteration_num));
        let v_hat = &self.velocity / (1. - self.beta_2.powi(self.iteration_num));
        let v = match &mut self.max_velocity {
            Some(max_velocity) => {
                Zip::from(&mut *max_velocity)
                    .and(&v_hat)
                    .for_each(|max, v| *max = max.max(*v));
                max_velocity.view()
            }
            None => v_hat.view(),
        };

        m_hat * lr / (v.mapv(f64::sqrt) + self.epsilon)
    }
}
