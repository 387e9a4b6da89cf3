//! Image classifiers (LeNet, VGG and NFNet variants) and a variational
//! autoencoder, trained on the CPU with a small autograd layer over `ndarray`.

#[cfg(feature = "blas")]
extern crate blas_src;

pub mod checkpoint;
pub mod config;
pub mod dataset;
pub mod error;
pub mod history;
pub mod model_utils;
pub mod models;
pub mod nn;
pub mod optim;
pub mod tensor;
pub mod utils;
pub mod vae;

pub use config::{load_config, Config};
pub use error::{Error, Result};
pub use model_utils::{ModelUtils, Predictions};
