pub mod activation;
pub mod attention;
pub mod batchnorm;
pub mod conv;
pub mod dropout;
pub mod embedding;
pub mod layernorm;
pub mod linear;
pub mod pool;

pub use activation::Activation;
pub use attention::{MultiheadAttention, scaled_dot_product_attention};
pub use batchnorm::BatchNorm2d;
pub use conv::Conv2d;
pub use dropout::{DropPath, Dropout};
pub use embedding::Embedding;
pub use layernorm::{LayerNorm, NormPrecision};
pub use linear::{Linear, linear};
pub use pool::AvgPool2d;
