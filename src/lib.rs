//! Configuration-driven assembly of CLIP-style dual-encoder models.
//!
//! A small CPU tensor core (`tensor`, `ops`) and module system (`nn`) carry
//! the towers in [`clip`]: vision and text encoders selected from a config,
//! composed into a shared embedding space, and loaded from legacy
//! checkpoints by shape inference.

pub mod clip;
pub mod dtype;
pub mod error;
pub mod io;
pub mod nn;
pub mod ops;
pub mod tensor;

pub use dtype::DType;
pub use error::{ClipError, Result};
pub use tensor::{RawTensor, Tensor, TensorOps, manual_seed, with_rng};
