use std::path::PathBuf;

use thiserror::Error;

#[derive(Error, Debug)]
pub enum Error {
	#[error("io error: {0}")]
	Io(#[from] std::io::Error),

	#[error("image error: {0}")]
	Image(#[from] image::ImageError),

	#[error("csv error: {0}")]
	Csv(#[from] csv::Error),

	#[error("json error: {0}")]
	Json(#[from] serde_json::Error),

	#[error("safetensors error: {0}")]
	SafeTensors(#[from] safetensors::SafeTensorError),

	#[error("shape error: {0}")]
	Shape(#[from] ndarray::ShapeError),

	#[error("shape mismatch in {op}: expected {expected:?}, got {actual:?}")]
	ShapeMismatch {
		op: &'static str,
		expected: Vec<usize>,
		actual: Vec<usize>,
	},

	#[error("invalid config: {0}")]
	Config(String),

	#[error("invalid dataset: {0}")]
	Dataset(String),

	#[error("checkpoint not found: {0}")]
	CheckpointNotFound(PathBuf),

	#[error("tensor '{0}' missing from state dict")]
	MissingTensor(String),

	#[error("unsupported tensor dtype {0}")]
	UnsupportedDtype(String),
}

pub type Result<T> = std::result::Result<T, Error>;
