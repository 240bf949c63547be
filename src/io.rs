use crate::dtype::DType;
use crate::error::{ClipError, Result};
use crate::tensor::Tensor;
use bincode::{Decode, Encode, config};
use std::collections::BTreeMap;
use std::fs::File;
use std::io::{Read, Write};
use std::path::Path;

pub mod mapping;

/// Flat, ordered mapping from dotted parameter path to tensor value.
pub type StateDict = BTreeMap<String, TensorData>;

// Serializable representation of tensor data
#[derive(Encode, Decode, Clone, Debug, PartialEq)]
pub struct TensorData {
    pub data: Vec<f32>,
    pub shape: Vec<usize>,
    pub dtype: DType,
}

/// Summary of differences between two state dicts.
///
/// `expected` is usually taken from `model.state_dict()`, and `loaded` is
/// what was deserialized or passed in.
#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct StateDictDiff {
    /// Keys that exist in `expected` but are missing from `loaded`.
    pub missing_keys: Vec<String>,
    /// Keys that exist in `loaded` but not in `expected`.
    pub unexpected_keys: Vec<String>,
    /// Keys present in both, but with differing shapes:
    /// `(key, expected_shape, loaded_shape)`.
    pub shape_mismatches: Vec<(String, Vec<usize>, Vec<usize>)>,
}

impl StateDictDiff {
    /// Returns true if there are no missing, unexpected, or shape-mismatched keys.
    pub fn is_empty(&self) -> bool {
        self.missing_keys.is_empty()
            && self.unexpected_keys.is_empty()
            && self.shape_mismatches.is_empty()
    }

    pub fn into_error(self) -> ClipError {
        ClipError::StateDictMismatch {
            missing: self.missing_keys,
            unexpected: self.unexpected_keys,
            shape_mismatches: self.shape_mismatches,
        }
    }
}

impl TensorData {
    pub fn new(data: Vec<f32>, shape: &[usize], dtype: DType) -> Self {
        let mut data = data;
        dtype.round_slice(&mut data);
        TensorData {
            data,
            shape: shape.to_vec(),
            dtype,
        }
    }

    /// Fails unless `data` holds exactly as many values as `shape` describes
    pub fn check_len(&self, key: &str) -> Result<()> {
        let expected: usize = self.shape.iter().product();
        if self.data.len() != expected {
            return Err(ClipError::InvalidParameter(format!(
                "'{key}' has {} values but shape {:?} needs {expected}",
                self.data.len(),
                self.shape
            )));
        }
        Ok(())
    }

    pub fn from_tensor(t: &Tensor) -> Self {
        let borrowed = t.borrow();
        TensorData {
            data: borrowed.data.clone(),
            shape: borrowed.shape.clone(),
            dtype: borrowed.dtype,
        }
    }
}

/// Compute a diff between an "expected" and a "loaded" state dict.
///
/// This function **does not mutate any tensors** and is purely informational.
pub fn diff_state_dict(expected: &StateDict, loaded: &StateDict) -> StateDictDiff {
    let mut diff = StateDictDiff::default();

    // 1. Missing keys and shape mismatches
    for (key, expected_td) in expected {
        match loaded.get(key) {
            None => diff.missing_keys.push(key.clone()),
            Some(actual_td) => {
                if expected_td.shape != actual_td.shape {
                    diff.shape_mismatches.push((
                        key.clone(),
                        expected_td.shape.clone(),
                        actual_td.shape.clone(),
                    ));
                }
            }
        }
    }

    // 2. Unexpected keys present only in `loaded`
    for key in loaded.keys() {
        if !expected.contains_key(key) {
            diff.unexpected_keys.push(key.clone());
        }
    }

    diff
}

pub fn save_state_dict<P: AsRef<Path>>(state: &StateDict, path: P) -> Result<()> {
    let mut file = File::create(path)?;
    let encoded = bincode::encode_to_vec(state, config::standard())
        .map_err(|e| ClipError::Codec(e.to_string()))?;
    file.write_all(&encoded)?;
    Ok(())
}

pub fn load_state_dict<P: AsRef<Path>>(path: P) -> Result<StateDict> {
    let mut file = File::open(path)?;
    let mut buffer = Vec::new();
    file.read_to_end(&mut buffer)?;
    let (state, _): (StateDict, _) = bincode::decode_from_slice(&buffer, config::standard())
        .map_err(|e| ClipError::Codec(e.to_string()))?;
    Ok(state)
}

#[cfg(test)]
mod io_tests {
    use super::*;
    use crate::nn::Module;
    use crate::nn::layers::Linear;

    #[test]
    fn test_save_load_round_trip_keeps_dtype() {
        let layer = Linear::new(2, 3, true);
        layer.weight.borrow_mut().cast_(DType::F16);

        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("linear.bin");
        let state = layer.state_dict();
        save_state_dict(&state, &path).unwrap();

        let loaded = load_state_dict(&path).unwrap();
        assert_eq!(loaded, state);
        assert_eq!(loaded["weight"].dtype, DType::F16);
    }

    #[test]
    fn test_load_garbage_is_codec_error() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("junk.bin");
        std::fs::write(&path, [0xff, 0xff, 0xff]).unwrap();
        assert!(matches!(load_state_dict(&path), Err(ClipError::Codec(_))));
    }

    #[test]
    fn test_state_dict_diff_reports_mismatches() {
        let layer = Linear::new(2, 3, true);
        let expected = layer.state_dict();

        let mut loaded = expected.clone();
        loaded.remove("bias");
        loaded.insert(
            "extra".to_string(),
            TensorData::new(vec![0.0], &[1], DType::F32),
        );
        if let Some(td) = loaded.get_mut("weight") {
            td.shape = vec![999];
        }

        let diff = diff_state_dict(&expected, &loaded);
        assert!(!diff.is_empty());
        assert_eq!(diff.missing_keys, vec!["bias".to_string()]);
        assert_eq!(diff.unexpected_keys, vec!["extra".to_string()]);
        assert!(diff.shape_mismatches.iter().any(|(k, _, _)| k == "weight"));
    }
}
