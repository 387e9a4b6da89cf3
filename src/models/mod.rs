//! Image classifiers over `[batch, 3, size, size]` inputs.

mod lenet;
mod nfnet;
mod vgg;

use crate::config::Config;
use crate::error::{Error, Result};
use crate::nn::Module;
use crate::optim::{Adam, Optimizer};

pub use lenet::FatLeNet5;
pub use nfnet::{NfNet, NfnetArch, NfnetVariant};
pub use vgg::FakeVgg16;

/// A network producing `[batch, num_class]` logits.
pub trait Classifier: Module {
	/// Used to name checkpoint directories.
	fn name(&self) -> &str;

	fn num_class(&self) -> usize;

	fn optimizer(&self, config: &Config) -> Box<dyn Optimizer> {
		Box::new(Adam::new(self.parameters(), config.learning_rate))
	}

	/// Whether training runs through a `GradScaler`.
	fn uses_grad_scaler(&self) -> bool {
		false
	}
}

pub(crate) fn check_image_size(model: &str, size: usize, min: usize) -> Result<()> {
	if size < min {
		return Err(Error::Config(format!(
			"{} needs images of at least {}x{}, got {}",
			model, min, min, size
		)));
	}
	Ok(())
}
