// Operation enums and RawTensor implementations
pub mod binary;
pub mod matmul;
pub mod movement;
pub mod reduce;
pub mod resample;
pub mod unary;

// Re-export operation types
pub use binary::BinaryOp;
pub use movement::cat;
pub use reduce::ReduceOp;
pub use resample::InterpolationMode;
pub use unary::{UnaryOp, erf};
