use crate::error::Result;
use crate::io::{StateDict, StateDictDiff, TensorData, diff_state_dict};
use crate::tensor::Tensor;
use std::collections::{BTreeMap, HashSet};
use std::rc::Rc;

pub mod layers;

pub use layers::{
    Activation, AvgPool2d, BatchNorm2d, Conv2d, DropPath, Dropout, Embedding, LayerNorm, Linear,
    MultiheadAttention, NormPrecision,
};

/// Whether a tensor is trainable state or a persistent buffer
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum TensorKind {
    Parameter,
    Buffer,
}

/// Layer kinds the precision converter and the tower locks dispatch on
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum LayerKind {
    Linear,
    Conv,
    Attention,
    /// Layer or batch normalization; never downcast
    Norm,
    Other,
}

fn join(prefix: &str, name: &str) -> String {
    if prefix.is_empty() {
        name.to_string()
    } else {
        format!("{prefix}.{name}")
    }
}

pub trait Module {
    /// Persistent tensors owned directly by this module (not its children)
    fn own_tensors(&self, _f: &mut dyn FnMut(&str, &Tensor, TensorKind)) {}

    /// Named child modules, in registration order
    fn for_each_child(&self, _f: &mut dyn FnMut(&str, &dyn Module)) {}

    fn for_each_child_mut(&mut self, _f: &mut dyn FnMut(&str, &mut dyn Module)) {}

    fn layer_kind(&self) -> LayerKind {
        LayerKind::Other
    }

    /// Switch between training and evaluation modes.
    /// Important for layers like `BatchNorm` and Dropout.
    fn train(&mut self, mode: bool) {
        self.for_each_child_mut(&mut |_, child| child.train(mode));
    }

    fn eval(&mut self) {
        self.train(false);
    }

    /// Visit every persistent tensor in the tree with its dotted path
    fn visit_tensors(&self, prefix: &str, f: &mut dyn FnMut(&str, &Tensor, TensorKind)) {
        self.own_tensors(&mut |name, t, kind| f(&join(prefix, name), t, kind));
        self.for_each_child(&mut |name, child| child.visit_tensors(&join(prefix, name), &mut *f));
    }

    // State dict methods
    fn state_dict(&self) -> StateDict {
        let mut state = BTreeMap::new();
        self.visit_tensors("", &mut |name, t, _| {
            state.insert(name.to_string(), TensorData::from_tensor(t));
        });
        state
    }

    /// Parameters with their paths; a tensor reachable by several paths is
    /// reported once, under the first path.
    fn named_parameters(&self) -> Vec<(String, Tensor)> {
        let mut seen = HashSet::new();
        let mut params = Vec::new();
        self.visit_tensors("", &mut |name, t, kind| {
            if kind == TensorKind::Parameter && seen.insert(Rc::as_ptr(t)) {
                params.push((name.to_string(), t.clone()));
            }
        });
        params
    }

    fn parameters(&self) -> Vec<Tensor> {
        self.named_parameters().into_iter().map(|(_, t)| t).collect()
    }

    /// Set `requires_grad` on every parameter of this subtree
    fn set_requires_grad(&self, flag: bool) {
        self.visit_tensors("", &mut |_, t, kind| {
            if kind == TensorKind::Parameter {
                t.borrow_mut().requires_grad = flag;
            }
        });
    }

    /// Copy `state` into this module's tensors.
    ///
    /// Shape mismatches are always fatal. With `strict`, missing or unexpected
    /// keys are fatal too. Every check runs before any tensor is written.
    /// Values are rounded into each destination tensor's dtype.
    fn load_state_dict(&mut self, state: &StateDict, strict: bool) -> Result<StateDictDiff> {
        let mut expected: BTreeMap<String, Tensor> = BTreeMap::new();
        self.visit_tensors("", &mut |name, t, _| {
            expected.insert(name.to_string(), t.clone());
        });

        let diff = diff_state_dict(&self.state_dict(), state);
        if !diff.shape_mismatches.is_empty() || (strict && !diff.is_empty()) {
            return Err(diff.into_error());
        }
        for key in expected.keys() {
            if let Some(td) = state.get(key) {
                td.check_len(key)?;
            }
        }

        for (key, t) in &expected {
            if let Some(td) = state.get(key) {
                let mut dst = t.borrow_mut();
                dst.data.copy_from_slice(&td.data);
                let dtype = dst.dtype;
                dtype.round_slice(&mut dst.data);
            }
        }
        Ok(diff)
    }
}

/// Depth-first pre-order walk over a module tree
pub fn walk_modules(module: &dyn Module, f: &mut dyn FnMut(&dyn Module)) {
    f(module);
    module.for_each_child(&mut |_, child| walk_modules(child, &mut *f));
}
