use ndarray::IxDyn;
use rand::{rngs::StdRng, Rng};
use serde::{Deserialize, Serialize};

use super::{Module, Pass};
use crate::error::{Error, Result};
use crate::tensor::{Array, Tensor};
use crate::utils::WeightInitializer;

fn check_rank(op: &'static str, input: &Tensor, rank: usize, channels: Option<(usize, usize)>) -> Result<()> {
	let shape = input.shape();
	let channel_ok = channels.map_or(true, |(axis, expected)| shape.get(axis) == Some(&expected));
	if shape.len() != rank || !channel_ok {
		let mut expected = vec![0; rank];
		if let Some((axis, c)) = channels {
			expected[axis] = c;
		}
		return Err(Error::ShapeMismatch {
			op,
			expected,
			actual: shape,
		});
	}
	Ok(())
}

/// Fully connected layer, `y = x W^T + b`.
pub struct Linear {
	weight: Tensor,
	bias: Tensor,
	name: String,
	in_features: usize,
}
impl Linear {
	pub fn new(name: &str, in_features: usize, out_features: usize, rng: &mut StdRng) -> Self {
		Self::with_init(name, in_features, out_features, WeightInitializer::UNIFORM, rng)
	}

	pub fn with_init(
		name: &str,
		in_features: usize,
		out_features: usize,
		wi: WeightInitializer,
		rng: &mut StdRng,
	) -> Self {
		Self {
			weight: Tensor::parameter(wi.array(rng, in_features, &[out_features, in_features])),
			bias: Tensor::parameter(WeightInitializer::UNIFORM.array(rng, in_features, &[out_features])),
			name: name.to_string(),
			in_features,
		}
	}

	pub fn weight(&self) -> &Tensor {
		&self.weight
	}
}
impl Module for Linear {
	fn forward(&self, input: &Tensor, _pass: &mut Pass) -> Result<Tensor> {
		check_rank("linear", input, 2, Some((1, self.in_features)))?;
		Ok(input.linear(&self.weight, Some(&self.bias)))
	}

	fn parameters(&self) -> Vec<(String, Tensor)> {
		vec![
			(format!("{}.weight", self.name), self.weight.clone()),
			(format!("{}.bias", self.name), self.bias.clone()),
		]
	}
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ConvOptions {
	pub stride: usize,
	pub padding: usize,
	pub groups: usize,
}
impl ConvOptions {
	pub fn new(stride: usize, padding: usize) -> Self {
		Self {
			stride,
			padding,
			groups: 1,
		}
	}

	pub fn groups(mut self, groups: usize) -> Self {
		self.groups = groups;
		self
	}
}
impl Default for ConvOptions {
	fn default() -> Self {
		Self::new(1, 0)
	}
}

pub struct Conv2d {
	weight: Tensor,
	bias: Option<Tensor>,
	name: String,
	in_channels: usize,
	opts: ConvOptions,
}
impl Conv2d {
	pub fn new(name: &str, in_channels: usize, out_channels: usize, kernel: usize, opts: ConvOptions, rng: &mut StdRng) -> Self {
		let fan_in = in_channels / opts.groups * kernel * kernel;
		Self {
			weight: Tensor::parameter(WeightInitializer::UNIFORM.array(
				rng,
				fan_in,
				&[out_channels, in_channels / opts.groups, kernel, kernel],
			)),
			bias: Some(Tensor::parameter(WeightInitializer::UNIFORM.array(rng, fan_in, &[out_channels]))),
			name: name.to_string(),
			in_channels,
			opts,
		}
	}

	pub fn weight(&self) -> &Tensor {
		&self.weight
	}

	pub fn out_channels(&self) -> usize {
		self.weight.shape()[0]
	}
}
impl Module for Conv2d {
	fn forward(&self, input: &Tensor, _pass: &mut Pass) -> Result<Tensor> {
		check_rank("conv2d", input, 4, Some((1, self.in_channels)))?;
		let ConvOptions { stride, padding, groups } = self.opts;
		Ok(input.conv2d(&self.weight, self.bias.as_ref(), stride, padding, groups))
	}

	fn parameters(&self) -> Vec<(String, Tensor)> {
		let mut params = vec![(format!("{}.weight", self.name), self.weight.clone())];
		if let Some(bias) = &self.bias {
			params.push((format!("{}.bias", self.name), bias.clone()));
		}
		params
	}
}

pub struct ConvTranspose2d {
	weight: Tensor,
	bias: Tensor,
	name: String,
	in_channels: usize,
	stride: usize,
	padding: usize,
}
impl ConvTranspose2d {
	pub fn new(
		name: &str,
		in_channels: usize,
		out_channels: usize,
		kernel: usize,
		stride: usize,
		padding: usize,
		rng: &mut StdRng,
	) -> Self {
		let fan_in = out_channels * kernel * kernel;
		Self {
			weight: Tensor::parameter(WeightInitializer::UNIFORM.array(
				rng,
				fan_in,
				&[in_channels, out_channels, kernel, kernel],
			)),
			bias: Tensor::parameter(WeightInitializer::UNIFORM.array(rng, fan_in, &[out_channels])),
			name: name.to_string(),
			in_channels,
			stride,
			padding,
		}
	}
}
impl Module for ConvTranspose2d {
	fn forward(&self, input: &Tensor, _pass: &mut Pass) -> Result<Tensor> {
		check_rank("conv_transpose2d", input, 4, Some((1, self.in_channels)))?;
		Ok(input.conv_transpose2d(&self.weight, Some(&self.bias), self.stride, self.padding))
	}

	fn parameters(&self) -> Vec<(String, Tensor)> {
		vec![
			(format!("{}.weight", self.name), self.weight.clone()),
			(format!("{}.bias", self.name), self.bias.clone()),
		]
	}
}

pub struct MaxPool2d {
	kernel: usize,
	stride: usize,
}
impl MaxPool2d {
	pub fn new(kernel: usize, stride: usize) -> Self {
		Self { kernel, stride }
	}
}
impl Module for MaxPool2d {
	fn forward(&self, input: &Tensor, _pass: &mut Pass) -> Result<Tensor> {
		check_rank("max_pool2d", input, 4, None)?;
		Ok(input.max_pool2d(self.kernel, self.stride))
	}

	fn parameters(&self) -> Vec<(String, Tensor)> {
		Vec::new()
	}
}

/// Inverted dropout: zeroes elements with probability `p` while training
/// and rescales the survivors by `1 / (1 - p)`.
pub struct Dropout {
	p: f32,
}
impl Dropout {
	pub fn new(p: f32) -> Self {
		Self { p }
	}
}
impl Module for Dropout {
	fn forward(&self, input: &Tensor, pass: &mut Pass) -> Result<Tensor> {
		if !pass.training() || self.p <= 0.0 {
			return Ok(input.clone());
		}
		let keep = 1.0 - self.p;
		let shape = input.shape();
		let len: usize = shape.iter().product();
		let rng = pass.rng();
		let mask: Vec<f32> = (0..len)
			.map(|_| if rng.random::<f32>() < keep { 1.0 / keep } else { 0.0 })
			.collect();
		let mask = Array::from_shape_vec(IxDyn(&shape), mask)?;
		Ok(input.mul(&Tensor::new(mask)))
	}

	fn parameters(&self) -> Vec<(String, Tensor)> {
		Vec::new()
	}
}

pub struct Flatten;
impl Module for Flatten {
	fn forward(&self, input: &Tensor, _pass: &mut Pass) -> Result<Tensor> {
		Ok(input.flatten())
	}

	fn parameters(&self) -> Vec<(String, Tensor)> {
		Vec::new()
	}
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Activation {
	Relu,
	Gelu,
	Sigmoid,
}
impl Activation {
	pub fn apply(&self, x: &Tensor) -> Tensor {
		match self {
			Activation::Relu => x.relu(),
			Activation::Gelu => x.gelu(),
			Activation::Sigmoid => x.sigmoid(),
		}
	}
}
impl Module for Activation {
	fn forward(&self, input: &Tensor, _pass: &mut Pass) -> Result<Tensor> {
		Ok(self.apply(input))
	}

	fn parameters(&self) -> Vec<(String, Tensor)> {
		Vec::new()
	}
}

#[cfg(test)]
mod tests {
	use super::*;
	use crate::nn::Sequential;
	use rand::SeedableRng;

	#[test]
	fn sequential_collects_named_parameters() {
		let mut rng = StdRng::seed_from_u64(1);
		let net = Sequential::new()
			.with(Conv2d::new("features.0", 3, 4, 3, ConvOptions::new(1, 1), &mut rng))
			.with(Activation::Relu)
			.with(MaxPool2d::new(2, 2))
			.with(Flatten)
			.with(Linear::new("classifier", 4 * 4 * 4, 2, &mut rng));
		let names: Vec<String> = net.parameters().into_iter().map(|(n, _)| n).collect();
		assert_eq!(
			names,
			vec!["features.0.weight", "features.0.bias", "classifier.weight", "classifier.bias"]
		);
		assert_eq!(net.parameter_count(), 4 * 3 * 9 + 4 + 64 * 2 + 2);

		let x = Tensor::new(Array::zeros(IxDyn(&[2, 3, 8, 8])));
		let y = net.forward(&x, &mut Pass::eval()).unwrap();
		assert_eq!(y.shape(), vec![2, 2]);
	}

	#[test]
	fn wrong_channel_count_is_an_error() {
		let mut rng = StdRng::seed_from_u64(1);
		let conv = Conv2d::new("c", 3, 4, 3, ConvOptions::default(), &mut rng);
		let x = Tensor::new(Array::zeros(IxDyn(&[1, 1, 8, 8])));
		assert!(matches!(
			conv.forward(&x, &mut Pass::eval()),
			Err(Error::ShapeMismatch { op: "conv2d", .. })
		));
	}

	#[test]
	fn dropout_is_identity_in_eval_and_scales_in_train() {
		let x = Tensor::new(Array::ones(IxDyn(&[1000])));
		let d = Dropout::new(0.5);
		let y = d.forward(&x, &mut Pass::eval()).unwrap();
		assert_eq!(*y.value(), *x.value());

		let y = d.forward(&x, &mut Pass::train(9)).unwrap();
		assert!(y.value().iter().all(|&v| v == 0.0 || v == 2.0));
		let kept = y.value().iter().filter(|&&v| v > 0.0).count();
		assert!(kept > 400 && kept < 600);
	}
}
