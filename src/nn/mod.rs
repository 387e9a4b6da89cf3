//! Layers built on the autograd `Tensor`.
//!
//! Every layer owns its parameters under a dotted name fixed at
//! construction (`"features.0.weight"`), which is also the key used in
//! checkpoints and by optimizers to pick per-parameter settings.

mod layers;

use rand::{rngs::StdRng, SeedableRng};

use crate::error::Result;
use crate::tensor::Tensor;

pub use layers::{Activation, Conv2d, ConvOptions, ConvTranspose2d, Dropout, Flatten, Linear, MaxPool2d};

/// Forward-pass context: train/eval switch and the RNG used by dropout,
/// stochastic depth and latent sampling.
pub struct Pass {
	training: bool,
	rng: StdRng,
}
impl Pass {
	pub fn train(seed: u64) -> Self {
		Self {
			training: true,
			rng: StdRng::seed_from_u64(seed),
		}
	}

	pub fn eval() -> Self {
		Self {
			training: false,
			rng: StdRng::seed_from_u64(0),
		}
	}

	pub fn training(&self) -> bool {
		self.training
	}

	pub fn rng(&mut self) -> &mut StdRng {
		&mut self.rng
	}
}

pub trait Module {
	fn forward(&self, input: &Tensor, pass: &mut Pass) -> Result<Tensor>;

	/// Named trainable parameters, in a stable order.
	fn parameters(&self) -> Vec<(String, Tensor)>;

	fn parameter_count(&self) -> usize {
		self.parameters().iter().map(|(_, p)| p.len()).sum()
	}
}

/// Layers applied in order.
#[derive(Default)]
pub struct Sequential {
	layers: Vec<Box<dyn Module>>,
}
impl Sequential {
	pub fn new() -> Self {
		Self::default()
	}

	pub fn push<M: Module + 'static>(&mut self, layer: M) {
		self.layers.push(Box::new(layer));
	}

	pub fn with<M: Module + 'static>(mut self, layer: M) -> Self {
		self.push(layer);
		self
	}

	pub fn len(&self) -> usize {
		self.layers.len()
	}

	pub fn is_empty(&self) -> bool {
		self.layers.is_empty()
	}
}
impl Module for Sequential {
	fn forward(&self, input: &Tensor, pass: &mut Pass) -> Result<Tensor> {
		self.layers
			.iter()
			.try_fold(input.clone(), |x, layer| layer.forward(&x, pass))
	}

	fn parameters(&self) -> Vec<(String, Tensor)> {
		self.layers.iter().flat_map(|l| l.parameters()).collect()
	}
}
