use rand::{rngs::StdRng, SeedableRng};

use super::{check_image_size, Classifier};
use crate::config::Config;
use crate::error::Result;
use crate::nn::{Activation, Conv2d, ConvOptions, Dropout, Flatten, Linear, MaxPool2d, Module, Pass, Sequential};
use crate::tensor::{conv_output_size, Tensor};

/// LeNet-5 with wider feature maps and dropout in the classifier.
///
/// conv5(3→16) relu pool2, conv5(16→32) relu pool2, then
/// fc(→240) relu dropout, fc(→168) relu dropout, fc(→num_class).
pub struct FatLeNet5 {
	net: Sequential,
	num_class: usize,
}
impl FatLeNet5 {
	pub fn new(config: &Config) -> Result<Self> {
		check_image_size("FatLeNet5", config.image_size, 16)?;
		let mut rng = StdRng::seed_from_u64(config.seed);
		let side = [5, 5].iter().fold(config.image_size, |s, &k| conv_output_size(s, k, 1, 0) / 2);
		let features = 32 * side * side;

		let net = Sequential::new()
			.with(Conv2d::new("features.0", 3, 16, 5, ConvOptions::default(), &mut rng))
			.with(Activation::Relu)
			.with(MaxPool2d::new(2, 2))
			.with(Conv2d::new("features.3", 16, 32, 5, ConvOptions::default(), &mut rng))
			.with(Activation::Relu)
			.with(MaxPool2d::new(2, 2))
			.with(Flatten)
			.with(Linear::new("classifier.0", features, 240, &mut rng))
			.with(Activation::Relu)
			.with(Dropout::new(config.dropout_rate))
			.with(Linear::new("classifier.3", 240, 168, &mut rng))
			.with(Activation::Relu)
			.with(Dropout::new(config.dropout_rate))
			.with(Linear::new("classifier.6", 168, config.num_class, &mut rng));
		Ok(Self {
			net,
			num_class: config.num_class,
		})
	}
}
impl Module for FatLeNet5 {
	fn forward(&self, input: &Tensor, pass: &mut Pass) -> Result<Tensor> {
		self.net.forward(input, pass)
	}

	fn parameters(&self) -> Vec<(String, Tensor)> {
		self.net.parameters()
	}
}
impl Classifier for FatLeNet5 {
	fn name(&self) -> &str {
		"FatLeNet5"
	}

	fn num_class(&self) -> usize {
		self.num_class
	}
}

#[cfg(test)]
mod tests {
	use super::*;
	use crate::error::Error;
	use crate::tensor::Array;
	use ndarray::IxDyn;

	fn config(size: usize) -> Config {
		Config {
			image_size: size,
			num_class: 4,
			..Config::default()
		}
	}

	#[test]
	fn logits_have_one_column_per_class() {
		let model = FatLeNet5::new(&config(20)).unwrap();
		let x = Tensor::new(Array::zeros(IxDyn(&[2, 3, 20, 20])));
		assert_eq!(model.forward(&x, &mut Pass::train(0)).unwrap().shape(), vec![2, 4]);
	}

	#[test]
	fn too_small_images_are_rejected() {
		assert!(matches!(FatLeNet5::new(&config(12)), Err(Error::Config(_))));
	}
}
