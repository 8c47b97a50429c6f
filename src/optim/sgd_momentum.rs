use ndarray::{ArrayD, ArrayViewD};

#[derive(Debug, Clone, Copy, PartialEq, serde::Serialize, serde::Deserialize)]
pub struct SgdmParameters {
    pub momentum: f64,
}

pub struct SgdMomentum {
    momentum: f64,
    changes: ArrayD<f64>,
}

impl SgdMomentum {
    pub fn new(params: &SgdmParameters, shape: &[usize]) -> Self {
        Self {
            momentum: params.momentum,
            changes: ArrayD::zeros(shape),
        }
    }

    pub fn optimize(&mut self, changes: &ArrayViewD<f64>, lr: f64) -> ArrayD<f64> {
        self.changes = changes * lr + &self.changes * self.momentum;
        self.changes.clone()
    }
}
