use crate::error::{ReidError, Result};
use ndarray::{Array, ArrayViewD, ArrayViewMutD, Dimension};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::sync::atomic::{AtomicU64, Ordering};

static NEXT_PARAM_ID: AtomicU64 = AtomicU64::new(0);

/// Process-unique identity of a learnable tensor. Two models never share an id,
/// and an id survives in-place value updates (checkpoint loads, optimizer steps).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ParamId(u64);

impl ParamId {
    pub fn fresh() -> Self {
        ParamId(NEXT_PARAM_ID.fetch_add(1, Ordering::Relaxed))
    }
}

impl Default for ParamId {
    fn default() -> Self {
        Self::fresh()
    }
}

#[derive(Serialize, Deserialize)]
#[serde(bound(serialize = "D: Serialize", deserialize = "D: Deserialize<'de>"))]
pub struct Param<D>
where
    D: Dimension,
{
    #[serde(skip)]
    id: ParamId,
    value: Array<f64, D>,
    #[serde(skip)]
    grad: Array<f64, D>,
    #[serde(skip)]
    has_grad: bool,
}

impl<D> Param<D>
where
    D: Dimension,
{
    pub fn new(value: Array<f64, D>) -> Self {
        Self {
            id: ParamId::fresh(),
            grad: Array::zeros(value.raw_dim()),
            value,
            has_grad: false,
        }
    }

    pub fn id(&self) -> ParamId {
        self.id
    }

    pub fn value(&self) -> &Array<f64, D> {
        &self.value
    }

    pub fn grad(&self) -> Option<&Array<f64, D>> {
        self.has_grad.then_some(&self.grad)
    }

    pub fn accumulate_grad(&mut self, grad: &Array<f64, D>) {
        if self.has_grad {
            self.grad += grad;
        } else {
            self.grad = grad.to_owned();
            self.has_grad = true;
        }
    }

    pub fn zero_grad(&mut self) {
        self.has_grad = false;
    }

    pub fn slot(&mut self) -> ParamSlot<'_> {
        let grad = if self.has_grad {
            Some(self.grad.view().into_dyn())
        } else {
            None
        };
        ParamSlot {
            id: self.id,
            value: self.value.view_mut().into_dyn(),
            grad,
        }
    }
}

/// Mutable view of one parameter handed to optimizers and checkpoint code.
pub struct ParamSlot<'a> {
    pub id: ParamId,
    pub value: ArrayViewMutD<'a, f64>,
    pub grad: Option<ArrayViewD<'a, f64>>,
}

pub struct NamedParam<'a> {
    pub name: String,
    pub slot: ParamSlot<'a>,
}

impl<'a> NamedParam<'a> {
    pub fn new<D: Dimension>(name: String, param: &'a mut Param<D>) -> Self {
        NamedParam {
            name,
            slot: param.slot(),
        }
    }
}

/// Non-learnable persistent tensor, e.g. batch-norm running statistics.
pub struct NamedBuffer<'a> {
    pub name: String,
    pub value: ArrayViewMutD<'a, f64>,
}

/// Anything owning parameters.
pub trait Module {
    fn params<'a>(&'a mut self, prefix: &str, out: &mut Vec<NamedParam<'a>>);

    fn buffers<'a>(&'a mut self, _prefix: &str, _out: &mut Vec<NamedBuffer<'a>>) {}
}

pub fn join_name(prefix: &str, name: &str) -> String {
    if prefix.is_empty() {
        name.to_string()
    } else {
        format!("{}.{}", prefix, name)
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StoredTensor {
    pub shape: Vec<usize>,
    pub data: Vec<f64>,
}

impl StoredTensor {
    fn from_view(view: &ArrayViewMutD<f64>) -> Self {
        StoredTensor {
            shape: view.shape().to_vec(),
            data: view.iter().copied().collect(),
        }
    }

    fn write_into(&self, name: &str, target: &mut ArrayViewMutD<f64>) -> Result<()> {
        if self.shape != target.shape() || self.data.len() != target.len() {
            return Err(ReidError::Shape(format!(
                "tensor {} has shape {:?} in the state dict but {:?} in the model",
                name,
                self.shape,
                target.shape()
            )));
        }
        target
            .iter_mut()
            .zip(&self.data)
            .for_each(|(value, stored)| *value = *stored);
        Ok(())
    }
}

/// Parameters and buffers of a model keyed by their dotted names.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct StateDict {
    pub tensors: BTreeMap<String, StoredTensor>,
}

impl StateDict {
    pub fn capture<M: Module>(module: &mut M) -> Self {
        let mut tensors = BTreeMap::new();
        let mut params = vec![];
        module.params("", &mut params);
        for param in &params {
            tensors.insert(param.name.clone(), StoredTensor::from_view(&param.slot.value));
        }
        drop(params);
        let mut buffers = vec![];
        module.buffers("", &mut buffers);
        for buffer in &buffers {
            tensors.insert(buffer.name.clone(), StoredTensor::from_view(&buffer.value));
        }
        StateDict { tensors }
    }

    /// Strict load: every tensor of the module must be present with the same
    /// shape, and the dict may not carry extra names.
    pub fn restore<M: Module>(&self, module: &mut M) -> Result<()> {
        let mut seen = 0;
        let mut params = vec![];
        module.params("", &mut params);
        for param in params.iter_mut() {
            let stored = self.lookup(&param.name)?;
            stored.write_into(&param.name, &mut param.slot.value)?;
            seen += 1;
        }
        drop(params);
        let mut buffers = vec![];
        module.buffers("", &mut buffers);
        for buffer in buffers.iter_mut() {
            let stored = self.lookup(&buffer.name)?;
            stored.write_into(&buffer.name, &mut buffer.value)?;
            seen += 1;
        }
        if seen != self.tensors.len() {
            return Err(ReidError::Shape(format!(
                "state dict holds {} tensors but the model has {}",
                self.tensors.len(),
                seen
            )));
        }
        Ok(())
    }

    fn lookup(&self, name: &str) -> Result<&StoredTensor> {
        self.tensors
            .get(name)
            .ok_or_else(|| ReidError::Shape(format!("missing key {} in state dict", name)))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use ndarray::{array, Ix1, Ix2};

    struct Pair {
        weight: Param<Ix2>,
        bias: Param<Ix1>,
    }

    impl Module for Pair {
        fn params<'a>(&'a mut self, prefix: &str, out: &mut Vec<NamedParam<'a>>) {
            out.push(NamedParam::new(join_name(prefix, "weight"), &mut self.weight));
            out.push(NamedParam::new(join_name(prefix, "bias"), &mut self.bias));
        }
    }

    #[test]
    fn fresh_ids_are_unique() {
        let a = Param::new(array![1., 2.]);
        let b = Param::new(array![1., 2.]);
        assert_ne!(a.id(), b.id());
    }

    #[test]
    fn grads_accumulate_until_zeroed() {
        let mut param = Param::new(array![1., 2.]);
        assert!(param.grad().is_none());
        param.accumulate_grad(&array![0.5, 0.5]);
        param.accumulate_grad(&array![0.5, 1.5]);
        assert_eq!(param.grad(), Some(&array![1., 2.]));
        param.zero_grad();
        assert!(param.slot().grad.is_none());
    }

    #[test]
    fn state_dict_restores_values_and_rejects_mismatch() {
        let mut source = Pair {
            weight: Param::new(array![[1., 2.], [3., 4.]]),
            bias: Param::new(array![5., 6.]),
        };
        let dict = StateDict::capture(&mut source);
        assert_eq!(dict.tensors.len(), 2);

        let mut target = Pair {
            weight: Param::new(Array::zeros((2, 2))),
            bias: Param::new(Array::zeros(2)),
        };
        let id_before = target.weight.id();
        dict.restore(&mut target).unwrap();
        assert_eq!(target.weight.value(), &array![[1., 2.], [3., 4.]]);
        assert_eq!(target.weight.id(), id_before);

        let mut wrong = Pair {
            weight: Param::new(Array::zeros((3, 2))),
            bias: Param::new(Array::zeros(2)),
        };
        assert!(matches!(dict.restore(&mut wrong), Err(ReidError::Shape(_))));
    }
}
