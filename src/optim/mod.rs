//! Parameter update rules.
//!
//! Optimizers hold clones of the parameter handles they update, so a step
//! writes straight into the model's tensors.

mod adam;
mod grad_scaler;
mod sgd_agc;

use crate::checkpoint::StateDict;
use crate::error::Result;
use crate::tensor::Tensor;

pub use adam::Adam;
pub use grad_scaler::{GradScaler, GradScalerState};
pub use sgd_agc::{unitwise_norm, ParamGroup, SgdAgc};

pub trait Optimizer {
	/// Applies one update from the accumulated gradients. Parameters without
	/// a gradient are left untouched.
	fn step(&mut self);

	fn zero_grad(&mut self) {
		self.parameters().iter().for_each(|(_, p)| p.zero_grad());
	}

	fn learning_rate(&self) -> f32;

	fn set_learning_rate(&mut self, lr: f32);

	fn parameters(&self) -> Vec<(String, Tensor)>;

	/// Per-parameter buffers keyed by `"<param name>.<buffer>"`.
	fn state_dict(&self) -> StateDict;

	fn load_state_dict(&mut self, state: &StateDict) -> Result<()>;
}
