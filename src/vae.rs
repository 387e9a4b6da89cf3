//! Convolutional variational autoencoder for MNIST- and CIFAR-shaped images.

use std::path::Path;

use ndarray::{s, Axis, IxDyn};
use rand::seq::SliceRandom;
use rand::{rngs::StdRng, Rng, SeedableRng};
use rand_distr::StandardNormal;
use serde::{Deserialize, Serialize};
use tracing::info;

use crate::checkpoint::{load_safetensors, load_state_dict, save_safetensors, state_dict};
use crate::config::Config;
use crate::dataset::Dataset;
use crate::error::{Error, Result};
use crate::nn::{Conv2d, ConvOptions, ConvTranspose2d, Linear, Module, Pass};
use crate::optim::{Adam, Optimizer};
use crate::tensor::{Array, NoGradGuard, Tensor};
use crate::utils::{braille_preview, progress_bar};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum InputShape {
	/// 28x28, one channel.
	Mnist,
	/// 32x32, three channels.
	Cifar,
}
impl InputShape {
	pub fn side(self) -> usize {
		match self {
			InputShape::Mnist => 28,
			InputShape::Cifar => 32,
		}
	}

	pub fn channels(self) -> usize {
		match self {
			InputShape::Mnist => 1,
			InputShape::Cifar => 3,
		}
	}
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct VaeConfig {
	pub latent_dims: usize,
	pub capacity: usize,
	/// Weight of the KL term.
	pub variational_beta: f32,
	pub input_shape: InputShape,
}
impl Default for VaeConfig {
	fn default() -> Self {
		Self {
			latent_dims: 2,
			capacity: 64,
			variational_beta: 1.0,
			input_shape: InputShape::Mnist,
		}
	}
}
impl VaeConfig {
	pub fn validate(&self) -> Result<()> {
		if self.latent_dims == 0 || self.capacity == 0 {
			return Err(Error::Config("vae.latent_dims and vae.capacity must be positive".to_string()));
		}
		if self.variational_beta < 0.0 {
			return Err(Error::Config("vae.variational_beta must be non-negative".to_string()));
		}
		Ok(())
	}

	/// Channels after the first convolution.
	fn c(&self) -> usize {
		self.capacity * self.input_shape.channels()
	}

	/// Flattened size of the encoder's last feature map.
	fn dim(&self) -> usize {
		let quarter = self.input_shape.side() / 4;
		2 * self.c() * quarter * quarter
	}
}

pub struct Encoder {
	conv1: Conv2d,
	conv2: Conv2d,
	fc: Linear,
	fc_mu: Linear,
	fc_logvar: Linear,
}
impl Encoder {
	pub fn new(config: &VaeConfig, rng: &mut StdRng) -> Self {
		let (c, dim) = (config.c(), config.dim());
		let down = ConvOptions::new(2, 1);
		Self {
			conv1: Conv2d::new("encoder.conv1", config.input_shape.channels(), c, 4, down, rng),
			conv2: Conv2d::new("encoder.conv2", c, 2 * c, 4, down, rng),
			fc: Linear::new("encoder.fc", dim, dim / 2, rng),
			fc_mu: Linear::new("encoder.fc_mu", dim / 2, config.latent_dims, rng),
			fc_logvar: Linear::new("encoder.fc_logvar", dim / 2, config.latent_dims, rng),
		}
	}

	/// Mean and log-variance of the approximate posterior.
	pub fn forward(&self, x: &Tensor, pass: &mut Pass) -> Result<(Tensor, Tensor)> {
		let h = self.conv1.forward(x, pass)?.relu();
		let h = self.conv2.forward(&h, pass)?.relu().flatten();
		let h = self.fc.forward(&h, pass)?.relu();
		Ok((self.fc_mu.forward(&h, pass)?, self.fc_logvar.forward(&h, pass)?))
	}

	pub fn parameters(&self) -> Vec<(String, Tensor)> {
		[&self.conv1, &self.conv2]
			.iter()
			.flat_map(|l| l.parameters())
			.chain([&self.fc, &self.fc_mu, &self.fc_logvar].iter().flat_map(|l| l.parameters()))
			.collect()
	}
}

pub struct Decoder {
	fc0: Linear,
	fc1: Linear,
	conv2: ConvTranspose2d,
	conv1: ConvTranspose2d,
	config: VaeConfig,
}
impl Decoder {
	pub fn new(config: &VaeConfig, rng: &mut StdRng) -> Self {
		let (c, dim) = (config.c(), config.dim());
		Self {
			fc0: Linear::new("decoder.fc.0", config.latent_dims, dim / 2, rng),
			fc1: Linear::new("decoder.fc.2", dim / 2, dim, rng),
			conv2: ConvTranspose2d::new("decoder.conv2", 2 * c, c, 4, 2, 1, rng),
			conv1: ConvTranspose2d::new("decoder.conv1", c, config.input_shape.channels(), 4, 2, 1, rng),
			config: config.clone(),
		}
	}
}
impl Module for Decoder {
	/// Pixel probabilities `[b, channels, side, side]` from latents `[b, latent_dims]`.
	fn forward(&self, z: &Tensor, pass: &mut Pass) -> Result<Tensor> {
		let h = self.fc0.forward(z, pass)?.relu();
		let h = self.fc1.forward(&h, pass)?.relu();
		let quarter = self.config.input_shape.side() / 4;
		let h = h.reshape(&[z.shape()[0], 2 * self.config.c(), quarter, quarter]);
		let h = self.conv2.forward(&h, pass)?.relu();
		Ok(self.conv1.forward(&h, pass)?.sigmoid())
	}

	fn parameters(&self) -> Vec<(String, Tensor)> {
		let mut params = self.fc0.parameters();
		params.extend(self.fc1.parameters());
		params.extend(self.conv2.parameters());
		params.extend(self.conv1.parameters());
		params
	}
}

pub struct VariationalAutoencoder {
	pub encoder: Encoder,
	pub decoder: Decoder,
	config: VaeConfig,
}
impl VariationalAutoencoder {
	pub fn new(config: &VaeConfig, seed: u64) -> Result<Self> {
		config.validate()?;
		let mut rng = StdRng::seed_from_u64(seed);
		Ok(Self {
			encoder: Encoder::new(config, &mut rng),
			decoder: Decoder::new(config, &mut rng),
			config: config.clone(),
		})
	}

	pub fn config(&self) -> &VaeConfig {
		&self.config
	}

	/// Reconstruction, mean and log-variance.
	pub fn forward(&self, x: &Tensor, pass: &mut Pass) -> Result<(Tensor, Tensor, Tensor)> {
		let (mu, logvar) = self.encoder.forward(x, pass)?;
		let z = self.latent_sample(&mu, &logvar, pass);
		Ok((self.decoder.forward(&z, pass)?, mu, logvar))
	}

	/// Reparameterised sample `mu + eps * exp(logvar / 2)` while training,
	/// the mean otherwise.
	pub fn latent_sample(&self, mu: &Tensor, logvar: &Tensor, pass: &mut Pass) -> Tensor {
		if !pass.training() {
			return mu.clone();
		}
		let shape = mu.shape();
		let rng = pass.rng();
		let eps = Array::from_shape_fn(IxDyn(&shape), |_| rng.sample::<f32, _>(StandardNormal));
		mu.add(&logvar.scale(0.5).exp().mul(&Tensor::new(eps)))
	}

	/// Summed pixel binary cross entropy plus `variational_beta` times the KL
	/// divergence from the unit Gaussian prior.
	pub fn criterion(&self, x: &Array, recon: &Tensor, mu: &Tensor, logvar: &Tensor) -> Tensor {
		let recon_loss = recon.binary_cross_entropy_sum(x);
		let kl = logvar
			.add_scalar(1.0)
			.sub(&mu.square())
			.sub(&logvar.exp())
			.sum()
			.scale(-0.5);
		recon_loss.add(&kl.scale(self.config.variational_beta))
	}

	pub fn parameters(&self) -> Vec<(String, Tensor)> {
		let mut params = self.encoder.parameters();
		params.extend(self.decoder.parameters());
		params
	}
}

/// Trains a `VariationalAutoencoder` on in-memory images in `[0, 1]`.
pub struct VaeTrainer {
	model: VariationalAutoencoder,
	optimizer: Adam,
	config: Config,
	epoch: usize,
}
impl VaeTrainer {
	pub fn new(config: &Config) -> Result<Self> {
		let model = VariationalAutoencoder::new(&config.vae, config.seed)?;
		let optimizer = Adam::new(model.parameters(), config.learning_rate).weight_decay(1e-5);
		info!(
			latent_dims = config.vae.latent_dims,
			capacity = config.vae.capacity,
			params = model.parameters().iter().map(|(_, p)| p.len()).sum::<usize>(),
			"variational autoencoder"
		);
		Ok(Self {
			model,
			optimizer,
			config: config.clone(),
			epoch: 0,
		})
	}

	pub fn model(&self) -> &VariationalAutoencoder {
		&self.model
	}

	fn check_images(&self, images: &Array) -> Result<()> {
		let shape = self.model.config.input_shape;
		let expected = [shape.channels(), shape.side(), shape.side()];
		if images.ndim() != 4 || images.shape()[1..] != expected {
			return Err(Error::ShapeMismatch {
				op: "vae",
				expected: [&[0][..], &expected[..]].concat(),
				actual: images.shape().to_vec(),
			});
		}
		Ok(())
	}

	/// One shuffled pass; returns the loss per image.
	pub fn train_epoch(&mut self, images: &Array) -> Result<f32> {
		self.check_images(images)?;
		self.epoch += 1;
		let n = images.shape()[0];
		let mut order: Vec<usize> = (0..n).collect();
		order.shuffle(&mut StdRng::seed_from_u64(self.config.seed.wrapping_add(self.epoch as u64)));
		let batch_size = self.config.batch_size.train;
		let bar = progress_bar((n + batch_size - 1) / batch_size, &format!("epoch {}", self.epoch));
		let mut pass = Pass::train(self.config.seed ^ self.epoch as u64);
		let mut total = 0.0f64;

		for chunk in order.chunks(batch_size) {
			let x = images.select(Axis(0), chunk);
			self.optimizer.zero_grad();
			let (recon, mu, logvar) = self.model.forward(&Tensor::new(x.clone()), &mut pass)?;
			let loss = self.model.criterion(&x, &recon, &mu, &logvar);
			loss.backward();
			self.optimizer.step();
			total += loss.item() as f64;
			bar.inc(1);
		}
		bar.finish_and_clear();
		Ok((total / n.max(1) as f64) as f32)
	}

	/// Loss per image with the posterior mean as latent.
	pub fn eval_epoch(&self, images: &Array) -> Result<f32> {
		self.check_images(images)?;
		let _guard = NoGradGuard::new();
		let n = images.shape()[0];
		let mut pass = Pass::eval();
		let mut total = 0.0f64;
		for start in (0..n).step_by(self.config.batch_size.eval) {
			let end = (start + self.config.batch_size.eval).min(n);
			let x = images.slice_axis(Axis(0), (start..end).into()).to_owned();
			let (recon, mu, logvar) = self.model.forward(&Tensor::new(x.clone()), &mut pass)?;
			total += self.model.criterion(&x, &recon, &mu, &logvar).item() as f64;
		}
		Ok((total / n.max(1) as f64) as f32)
	}

	/// Trains for `epochs` epochs, logging train and test loss per epoch.
	pub fn fit(&mut self, epochs: usize, train: &Array, test: &Array) -> Result<Vec<(f32, f32)>> {
		let mut losses = Vec::with_capacity(epochs);
		for _ in 0..epochs {
			let train_loss = self.train_epoch(train)?;
			let test_loss = if test.shape()[0] > 0 { self.eval_epoch(test)? } else { f32::NAN };
			info!(epoch = self.epoch, "train loss {:.2} | test loss {:.2}", train_loss, test_loss);
			losses.push((train_loss, test_loss));
		}
		Ok(losses)
	}

	pub fn reconstruct(&self, images: &Array) -> Result<Array> {
		self.check_images(images)?;
		let _guard = NoGradGuard::new();
		let (recon, _, _) = self.model.forward(&Tensor::new(images.clone()), &mut Pass::eval())?;
		let recon = recon.value().clone();
		Ok(recon)
	}

	/// Decodes `n` latents drawn from the unit Gaussian prior.
	pub fn generate(&self, n: usize, seed: u64) -> Result<Array> {
		let _guard = NoGradGuard::new();
		let mut rng = StdRng::seed_from_u64(seed);
		let z = Array::from_shape_fn(IxDyn(&[n, self.model.config.latent_dims]), |_| {
			rng.sample::<f32, _>(StandardNormal)
		});
		let images = self.model.decoder.forward(&Tensor::new(z), &mut Pass::eval())?;
		let images = images.value().clone();
		Ok(images)
	}

	pub fn save<P: AsRef<Path>>(&self, path: P) -> Result<()> {
		save_safetensors(path, &state_dict(&self.model.parameters()))
	}

	pub fn load<P: AsRef<Path>>(&mut self, path: P) -> Result<()> {
		load_state_dict(&self.model.parameters(), &load_safetensors(path)?)
	}
}

/// Renders the first channel of up to `max` images as braille.
pub fn preview(images: &Array, max: usize) -> String {
	let count = images.shape().first().copied().unwrap_or(0).min(max);
	let frames: Vec<_> = (0..count)
		.map(|i| {
			images.slice(s![i, 0, .., ..]).to_owned()
		})
		.collect();
	let captions: Vec<String> = (0..count).map(|i| i.to_string()).collect();
	braille_preview(&frames, &captions)
}

/// Loads MNIST idx files from `dir` as `[n, 1, 28, 28]` arrays in `[0, 1]`,
/// returning (train, test).
pub fn load_mnist<P: AsRef<Path>>(dir: P, train_len: usize, test_len: usize) -> Result<(Array, Array)> {
	const FILES: [&str; 4] = [
		"train-images-idx3-ubyte",
		"train-labels-idx1-ubyte",
		"t10k-images-idx3-ubyte",
		"t10k-labels-idx1-ubyte",
	];
	let dir = dir.as_ref();
	if let Some(missing) = FILES.iter().find(|f| !dir.join(f).is_file()) {
		return Err(Error::Dataset(format!("{} not found in {}", missing, dir.display())));
	}
	if train_len == 0 || train_len > 60_000 || test_len > 10_000 {
		return Err(Error::Dataset(format!(
			"MNIST has 60000 training and 10000 test images, asked for {} and {}",
			train_len, test_len
		)));
	}
	let base = format!("{}/", dir.display());
	let mnist::Mnist { trn_img, tst_img, .. } = mnist::MnistBuilder::new()
		.label_format_digit()
		.base_path(&base)
		.training_set_length(train_len as u32)
		.validation_set_length(0)
		.test_set_length(test_len.max(1) as u32)
		.finalize();
	let to_array = |bytes: Vec<u8>, n: usize| -> Result<Array> {
		let pixels: Vec<f32> = bytes.into_iter().take(n * 28 * 28).map(|b| b as f32 / 255.0).collect();
		Ok(Array::from_shape_vec(IxDyn(&[n, 1, 28, 28]), pixels)?)
	};
	Ok((to_array(trn_img, train_len)?, to_array(tst_img, test_len)?))
}

/// Decodes every image of a dataset into one `[n, channels, side, side]`
/// array; single-channel output averages RGB.
pub fn images_from_dataset(dataset: &Dataset, channels: usize) -> Result<Array> {
	let mut batches = Vec::new();
	for batch in dataset.data_loader(0)? {
		let images = batch?.images;
		let images = if channels == 1 {
			images.mean_axis(Axis(1)).map(|m| m.insert_axis(Axis(1))).ok_or_else(|| {
				Error::Dataset("cannot average an image without channels".to_string())
			})?
		} else {
			images
		};
		batches.push(images);
	}
	if batches.is_empty() {
		return Err(Error::Dataset("no images to load".to_string()));
	}
	let views: Vec<_> = batches.iter().map(|b| b.view()).collect();
	Ok(ndarray::concatenate(Axis(0), &views)?)
}

#[cfg(test)]
mod tests {
	use super::*;
	use approx::assert_abs_diff_eq;

	fn small() -> VaeConfig {
		VaeConfig {
			latent_dims: 3,
			capacity: 2,
			..VaeConfig::default()
		}
	}

	fn digits(n: usize) -> Array {
		Array::from_shape_fn(IxDyn(&[n, 1, 28, 28]), |i| if (i[2] + i[3] + i[0]) % 5 == 0 { 1.0 } else { 0.0 })
	}

	#[test]
	fn shapes_follow_the_config() {
		let vae = VariationalAutoencoder::new(&small(), 0).unwrap();
		let x = Tensor::new(digits(2));
		let (recon, mu, logvar) = vae.forward(&x, &mut Pass::train(1)).unwrap();
		assert_eq!(recon.shape(), vec![2, 1, 28, 28]);
		assert_eq!(mu.shape(), vec![2, 3]);
		assert_eq!(logvar.shape(), vec![2, 3]);
		assert!(recon.value().iter().all(|&p| p > 0.0 && p < 1.0));

		let cifar = VaeConfig {
			input_shape: InputShape::Cifar,
			..small()
		};
		let vae = VariationalAutoencoder::new(&cifar, 0).unwrap();
		let x = Tensor::new(Array::zeros(IxDyn(&[1, 3, 32, 32])));
		assert_eq!(vae.forward(&x, &mut Pass::eval()).unwrap().0.shape(), vec![1, 3, 32, 32]);
	}

	#[test]
	fn eval_latent_is_the_mean() {
		let vae = VariationalAutoencoder::new(&small(), 0).unwrap();
		let mu = Tensor::new(Array::from_elem(IxDyn(&[2, 3]), 0.5));
		let logvar = Tensor::new(Array::zeros(IxDyn(&[2, 3])));
		let z = vae.latent_sample(&mu, &logvar, &mut Pass::eval());
		assert!(z.ptr_eq(&mu));
		let z = vae.latent_sample(&mu, &logvar, &mut Pass::train(3));
		assert_ne!(*z.value(), *mu.value());
	}

	#[test]
	fn kl_term_vanishes_at_the_prior() {
		let vae = VariationalAutoencoder::new(&small(), 0).unwrap();
		let x = Array::from_elem(IxDyn(&[1, 1, 2, 2]), 1.0);
		let recon = Tensor::new(Array::from_elem(IxDyn(&[1, 1, 2, 2]), 0.5));
		let zeros = Tensor::new(Array::zeros(IxDyn(&[1, 3])));
		let loss = vae.criterion(&x, &recon, &zeros, &zeros);
		assert_abs_diff_eq!(loss.item(), 4.0 * 2f32.ln(), epsilon = 1e-5);

		let mu = Tensor::new(Array::from_elem(IxDyn(&[1, 3]), 1.0));
		let loss = vae.criterion(&x, &recon, &mu, &zeros);
		assert_abs_diff_eq!(loss.item(), 4.0 * 2f32.ln() + 1.5, epsilon = 1e-5);
	}

	#[test]
	fn training_lowers_the_loss() {
		let config = Config {
			learning_rate: 1e-2,
			batch_size: crate::config::BatchSize { train: 4, eval: 4 },
			vae: small(),
			..Config::default()
		};
		let mut trainer = VaeTrainer::new(&config).unwrap();
		let images = digits(8);
		let before = trainer.eval_epoch(&images).unwrap();
		for _ in 0..5 {
			trainer.train_epoch(&images).unwrap();
		}
		assert!(trainer.eval_epoch(&images).unwrap() < before);

		let samples = trainer.generate(3, 0).unwrap();
		assert_eq!(samples.shape(), &[3, 1, 28, 28]);
		let art = preview(&samples, 2);
		assert!(art.lines().count() > 1);
		assert!(art.ends_with(&format!("{:<14}{:<14}", "0", "1")));
	}

	#[test]
	fn wrong_image_shape_is_rejected() {
		let trainer = VaeTrainer::new(&Config {
			vae: small(),
			..Config::default()
		})
		.unwrap();
		let images = Array::zeros(IxDyn(&[2, 3, 28, 28]));
		assert!(matches!(trainer.eval_epoch(&images), Err(Error::ShapeMismatch { .. })));
	}
}
