use rand::{rngs::StdRng, SeedableRng};

use super::{check_image_size, Classifier};
use crate::config::Config;
use crate::error::Result;
use crate::nn::{Activation, Conv2d, ConvOptions, Dropout, Flatten, Linear, MaxPool2d, Module, Pass, Sequential};
use crate::tensor::Tensor;

#[derive(Debug, Clone, Copy)]
enum VggLayer {
	Conv(usize),
	MaxPool,
}

/// The VGG-16 layer pattern with every width divided by four.
fn vgg16_quarter_config() -> Vec<VggLayer> {
	use VggLayer::{Conv, MaxPool};
	vec![
		Conv(16),
		Conv(16),
		MaxPool,
		Conv(32),
		Conv(32),
		MaxPool,
		Conv(64),
		Conv(64),
		Conv(64),
		MaxPool,
		Conv(128),
		Conv(128),
		Conv(128),
		MaxPool,
		Conv(128),
		Conv(128),
		Conv(128),
		MaxPool,
	]
}

const HIDDEN: usize = 512;

/// Thirteen 3x3 convolutions and five max pools followed by a
/// three-layer dropout classifier.
pub struct FakeVgg16 {
	net: Sequential,
	num_class: usize,
}
impl FakeVgg16 {
	pub fn new(config: &Config) -> Result<Self> {
		check_image_size("FakeVgg16", config.image_size, 32)?;
		let mut rng = StdRng::seed_from_u64(config.seed);
		let mut net = Sequential::new();
		let (mut channels, mut side) = (3, config.image_size);

		for (i, layer) in vgg16_quarter_config().into_iter().enumerate() {
			match layer {
				VggLayer::Conv(out) => {
					let name = format!("features.{}", i);
					net.push(Conv2d::new(&name, channels, out, 3, ConvOptions::new(1, 1), &mut rng));
					net.push(Activation::Relu);
					channels = out;
				}
				VggLayer::MaxPool => {
					net.push(MaxPool2d::new(2, 2));
					side /= 2;
				}
			}
		}

		net.push(Flatten);
		net.push(Linear::new("classifier.0", channels * side * side, HIDDEN, &mut rng));
		net.push(Activation::Relu);
		net.push(Dropout::new(config.dropout_rate));
		net.push(Linear::new("classifier.3", HIDDEN, HIDDEN, &mut rng));
		net.push(Activation::Relu);
		net.push(Dropout::new(config.dropout_rate));
		net.push(Linear::new("classifier.6", HIDDEN, config.num_class, &mut rng));
		Ok(Self {
			net,
			num_class: config.num_class,
		})
	}
}
impl Module for FakeVgg16 {
	fn forward(&self, input: &Tensor, pass: &mut Pass) -> Result<Tensor> {
		self.net.forward(input, pass)
	}

	fn parameters(&self) -> Vec<(String, Tensor)> {
		self.net.parameters()
	}
}
impl Classifier for FakeVgg16 {
	fn name(&self) -> &str {
		"FakeVgg16"
	}

	fn num_class(&self) -> usize {
		self.num_class
	}
}

#[cfg(test)]
mod tests {
	use super::*;
	use crate::tensor::Array;
	use ndarray::IxDyn;

	#[test]
	fn thirteen_convolutions_and_three_linears() {
		let config = Config {
			image_size: 32,
			num_class: 3,
			..Config::default()
		};
		let model = FakeVgg16::new(&config).unwrap();
		let weights = model
			.parameters()
			.into_iter()
			.filter(|(name, _)| name.ends_with(".weight"))
			.count();
		assert_eq!(weights, 16);

		let x = Tensor::new(Array::zeros(IxDyn(&[1, 3, 32, 32])));
		assert_eq!(model.forward(&x, &mut Pass::eval()).unwrap().shape(), vec![1, 3]);
	}
}
