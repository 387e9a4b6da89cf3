//! Normalizer-free ResNets (NFNet-F0 to F7).
//!
//! Batch normalisation is replaced by scaled weight standardisation in every
//! convolution, explicit signal-propagation scaling of the residual branches
//! (`beta` on the way in, `alpha * skip_gain` on the way out) and adaptive
//! gradient clipping in the optimizer.

use std::fmt;
use std::path::Path;

use ndarray::IxDyn;
use rand::{rngs::StdRng, Rng, SeedableRng};
use serde::{Deserialize, Serialize};
use tracing::info;

use super::Classifier;
use crate::checkpoint::{load_safetensors, load_state_dict, StateDict};
use crate::config::Config;
use crate::error::{Error, Result};
use crate::nn::{Activation, Dropout, Linear, Module, Pass};
use crate::optim::{Optimizer, SgdAgc};
use crate::tensor::{Array, Tensor};
use crate::utils::WeightInitializer;

const WS_EPS: f32 = 1e-4;
const EXPANSION: f32 = 0.5;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum NfnetVariant {
	F0,
	F1,
	F2,
	F3,
	F4,
	F5,
	F6,
	F7,
}
impl NfnetVariant {
	pub fn arch(self) -> NfnetArch {
		use NfnetVariant::*;
		let (multiplier, drop_rate) = match self {
			F0 => (1, 0.2),
			F1 => (2, 0.3),
			F2 => (3, 0.4),
			F3 => (4, 0.4),
			F4 => (5, 0.5),
			F5 => (6, 0.5),
			F6 => (7, 0.5),
			F7 => (8, 0.5),
		};
		NfnetArch {
			stem: [16, 32, 64, 128],
			widths: vec![256, 512, 1536, 1536],
			depths: [1, 2, 6, 3].iter().map(|d| d * multiplier).collect(),
			group_size: 128,
			drop_rate,
		}
	}
}
impl fmt::Display for NfnetVariant {
	fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
		write!(f, "{:?}", self)
	}
}

/// Layer sizes of one network.
#[derive(Debug, Clone, PartialEq)]
pub struct NfnetArch {
	/// Output channels of the four stem convolutions.
	pub stem: [usize; 4],
	pub widths: Vec<usize>,
	pub depths: Vec<usize>,
	/// Channels per group in the grouped 3x3 convolutions.
	pub group_size: usize,
	pub drop_rate: f32,
}

/// Scales an activation so that it preserves unit variance for unit
/// Gaussian inputs.
fn gamma(activation: Activation) -> f32 {
	match activation {
		Activation::Relu => 1.713_958_8,
		Activation::Gelu => 1.701_504_3,
		Activation::Sigmoid => 4.803_835_4,
	}
}

fn act(activation: Activation, x: &Tensor) -> Tensor {
	activation.apply(x).scale(gamma(activation))
}

/// Convolution with scaled weight standardisation:
/// `W_hat = gain * (W - mean(W)) / sqrt(fan_in * var(W) + eps)` per filter.
struct WsConv2d {
	weight: Tensor,
	gain: Tensor,
	bias: Tensor,
	name: String,
	stride: usize,
	padding: usize,
	groups: usize,
}
impl WsConv2d {
	#[allow(clippy::too_many_arguments)]
	fn new(
		name: String,
		in_channels: usize,
		out_channels: usize,
		kernel: usize,
		stride: usize,
		padding: usize,
		groups: usize,
		rng: &mut StdRng,
	) -> Self {
		let fan_in = in_channels / groups * kernel * kernel;
		Self {
			weight: Tensor::parameter(WeightInitializer::KAIMING_NORMAL.array(
				rng,
				fan_in,
				&[out_channels, in_channels / groups, kernel, kernel],
			)),
			gain: Tensor::parameter(Array::ones(IxDyn(&[out_channels, 1, 1, 1]))),
			bias: Tensor::parameter(Array::zeros(IxDyn(&[out_channels]))),
			name,
			stride,
			padding,
			groups,
		}
	}

	fn standardized_weight(&self) -> Tensor {
		let shape = self.weight.shape();
		let fan_in: usize = shape[1..].iter().product();
		let centered = self.weight.sub(&self.weight.mean_axes(&[1, 2, 3]));
		let var = centered.square().mean_axes(&[1, 2, 3]);
		let std = var.scale(fan_in as f32).add_scalar(WS_EPS).sqrt();
		centered.div(&std).mul(&self.gain)
	}
}
impl Module for WsConv2d {
	fn forward(&self, input: &Tensor, _pass: &mut Pass) -> Result<Tensor> {
		let in_channels = self.weight.shape()[1] * self.groups;
		let shape = input.shape();
		if shape.len() != 4 || shape[1] != in_channels {
			return Err(Error::ShapeMismatch {
				op: "ws_conv2d",
				expected: vec![0, in_channels, 0, 0],
				actual: shape,
			});
		}
		Ok(input.conv2d(
			&self.standardized_weight(),
			Some(&self.bias),
			self.stride,
			self.padding,
			self.groups,
		))
	}

	fn parameters(&self) -> Vec<(String, Tensor)> {
		vec![
			(format!("{}.weight", self.name), self.weight.clone()),
			(format!("{}.gain", self.name), self.gain.clone()),
			(format!("{}.bias", self.name), self.bias.clone()),
		]
	}
}

/// 2x2 average pooling with stride 2, as a fixed depthwise convolution.
fn avg_pool2(x: &Tensor) -> Tensor {
	let channels = x.shape()[1];
	let kernel = Tensor::new(Array::from_elem(IxDyn(&[channels, 1, 2, 2]), 0.25));
	x.conv2d(&kernel, None, 2, 0, channels)
}

struct SqueezeExcite {
	fc0: Linear,
	fc1: Linear,
}
impl SqueezeExcite {
	fn new(name: &str, channels: usize, se_ratio: f32, rng: &mut StdRng) -> Self {
		let hidden = ((channels as f32 * se_ratio) as usize).max(1);
		Self {
			fc0: Linear::new(&format!("{}.fc0", name), channels, hidden, rng),
			fc1: Linear::new(&format!("{}.fc1", name), hidden, channels, rng),
		}
	}
}
impl Module for SqueezeExcite {
	/// Per-channel gates in `(0, 1)`, shaped `[b, c, 1, 1]`.
	fn forward(&self, input: &Tensor, pass: &mut Pass) -> Result<Tensor> {
		let shape = input.shape();
		let pooled = input.mean_axes(&[2, 3]).reshape(&shape[..2]);
		let hidden = self.fc0.forward(&pooled, pass)?.relu();
		let gates = self.fc1.forward(&hidden, pass)?.sigmoid();
		Ok(gates.reshape(&[shape[0], shape[1], 1, 1]))
	}

	fn parameters(&self) -> Vec<(String, Tensor)> {
		let mut params = self.fc0.parameters();
		params.extend(self.fc1.parameters());
		params
	}
}

struct NfBlock {
	conv0: WsConv2d,
	conv1: WsConv2d,
	conv1b: WsConv2d,
	conv2: WsConv2d,
	conv_shortcut: Option<WsConv2d>,
	squeeze_excite: SqueezeExcite,
	skip_gain: Tensor,
	name: String,
	stride: usize,
	alpha: f32,
	beta: f32,
	stochdepth_rate: f32,
	activation: Activation,
}
impl NfBlock {
	#[allow(clippy::too_many_arguments)]
	fn new(
		name: String,
		in_channels: usize,
		out_channels: usize,
		stride: usize,
		alpha: f32,
		beta: f32,
		stochdepth_rate: f32,
		arch: &NfnetArch,
		config: &Config,
		rng: &mut StdRng,
	) -> Result<Self> {
		let groups = (out_channels as f32 * EXPANSION) as usize / arch.group_size;
		if groups == 0 {
			return Err(Error::Config(format!(
				"{}: width {} too small for group size {}",
				name, out_channels, arch.group_size
			)));
		}
		let width = groups * arch.group_size;
		let conv = |suffix: &str| format!("{}.{}", name, suffix);
		let use_projection = stride > 1 || in_channels != out_channels;
		Ok(Self {
			conv0: WsConv2d::new(conv("conv0"), in_channels, width, 1, 1, 0, 1, rng),
			conv1: WsConv2d::new(conv("conv1"), width, width, 3, stride, 1, groups, rng),
			conv1b: WsConv2d::new(conv("conv1b"), width, width, 3, 1, 1, groups, rng),
			conv2: WsConv2d::new(conv("conv2"), width, out_channels, 1, 1, 0, 1, rng),
			conv_shortcut: use_projection
				.then(|| WsConv2d::new(conv("conv_shortcut"), in_channels, out_channels, 1, 1, 0, 1, rng)),
			squeeze_excite: SqueezeExcite::new(&conv("squeeze_excite"), out_channels, config.nfnet.se_ratio, rng),
			skip_gain: Tensor::parameter(Array::zeros(IxDyn(&[]))),
			name,
			stride,
			alpha,
			beta,
			stochdepth_rate,
			activation: config.nfnet.activation,
		})
	}

	/// Zeroes the residual branch of whole samples with probability
	/// `stochdepth_rate` while training.
	fn stochastic_depth(&self, x: Tensor, pass: &mut Pass) -> Tensor {
		if !pass.training() || self.stochdepth_rate <= 0.0 {
			return x;
		}
		let batch = x.shape()[0];
		let keep = 1.0 - self.stochdepth_rate;
		let rng = pass.rng();
		let mask = Array::from_shape_fn(IxDyn(&[batch, 1, 1, 1]), |_| (rng.random::<f32>() + keep).floor());
		x.mul(&Tensor::new(mask))
	}
}
impl Module for NfBlock {
	fn forward(&self, input: &Tensor, pass: &mut Pass) -> Result<Tensor> {
		let out = act(self.activation, input).scale(self.beta);
		let shortcut = match &self.conv_shortcut {
			Some(conv) if self.stride > 1 => conv.forward(&avg_pool2(&out), pass)?,
			Some(conv) => conv.forward(&out, pass)?,
			None => input.clone(),
		};

		let out = act(self.activation, &self.conv0.forward(&out, pass)?);
		let out = act(self.activation, &self.conv1.forward(&out, pass)?);
		let out = act(self.activation, &self.conv1b.forward(&out, pass)?);
		let out = self.conv2.forward(&out, pass)?;
		let gates = self.squeeze_excite.forward(&out, pass)?;
		let out = out.mul(&gates.scale(2.0));
		let out = self.stochastic_depth(out, pass);
		Ok(out.scale(self.alpha).mul(&self.skip_gain).add(&shortcut))
	}

	fn parameters(&self) -> Vec<(String, Tensor)> {
		let mut params = Vec::new();
		for conv in [&self.conv0, &self.conv1, &self.conv1b, &self.conv2] {
			params.extend(conv.parameters());
		}
		if let Some(conv) = &self.conv_shortcut {
			params.extend(conv.parameters());
		}
		params.extend(self.squeeze_excite.parameters());
		params.push((format!("{}.skip_gain", self.name), self.skip_gain.clone()));
		params
	}
}

pub struct NfNet {
	stem: Vec<WsConv2d>,
	body: Vec<NfBlock>,
	final_conv: WsConv2d,
	dropout: Dropout,
	linear: Linear,
	activation: Activation,
	num_class: usize,
	name: String,
}
impl NfNet {
	pub fn new(config: &Config) -> Result<Self> {
		let variant = config.nfnet.variant;
		Self::with_arch(config, variant.arch(), format!("NFNet-{}", variant))
	}

	pub fn with_arch(config: &Config, arch: NfnetArch, name: String) -> Result<Self> {
		if arch.widths.is_empty() || arch.widths.len() != arch.depths.len() {
			return Err(Error::Config("nfnet widths and depths must be non-empty and of equal length".to_string()));
		}
		let reduction = 1 << (arch.widths.len() + 1);
		if config.image_size % reduction != 0 {
			return Err(Error::Config(format!(
				"{} needs an image size divisible by {}, got {}",
				name, reduction, config.image_size
			)));
		}
		let mut rng = StdRng::seed_from_u64(config.seed);
		let activation = config.nfnet.activation;

		let [s0, s1, s2, s3] = arch.stem;
		let stem = vec![
			WsConv2d::new("stem.conv0".to_string(), 3, s0, 3, 2, 1, 1, &mut rng),
			WsConv2d::new("stem.conv1".to_string(), s0, s1, 3, 1, 1, 1, &mut rng),
			WsConv2d::new("stem.conv2".to_string(), s1, s2, 3, 1, 1, 1, &mut rng),
			WsConv2d::new("stem.conv3".to_string(), s2, s3, 3, 2, 1, 1, &mut rng),
		];

		let num_blocks: usize = arch.depths.iter().sum();
		let alpha = config.nfnet.alpha;
		let mut body = Vec::with_capacity(num_blocks);
		let mut in_channels = s3;
		let mut expected_std = 1.0f32;
		for (stage, (&width, &depth)) in arch.widths.iter().zip(&arch.depths).enumerate() {
			let stride = if stage == 0 { 1 } else { 2 };
			for block in 0..depth {
				let index = body.len();
				let rate = config.nfnet.stochdepth_rate * index as f32 / num_blocks as f32;
				body.push(NfBlock::new(
					format!("body.{}", index),
					in_channels,
					width,
					if block == 0 { stride } else { 1 },
					alpha,
					1.0 / expected_std,
					rate,
					&arch,
					config,
					&mut rng,
				)?);
				in_channels = width;
				if block == 0 {
					expected_std = 1.0;
				}
				expected_std = (expected_std * expected_std + alpha * alpha).sqrt();
			}
		}

		let final_channels = 2 * in_channels;
		Ok(Self {
			stem,
			body,
			final_conv: WsConv2d::new("final_conv".to_string(), in_channels, final_channels, 1, 1, 0, 1, &mut rng),
			dropout: Dropout::new(arch.drop_rate),
			linear: Linear::with_init(
				"linear",
				final_channels,
				config.num_class,
				WeightInitializer::STANDARD_NORMAL_SQRT,
				&mut rng,
			),
			activation,
			num_class: config.num_class,
			name,
		})
	}

	/// Loads pretrained weights, replacing the output layer when its class
	/// count differs from this network's.
	pub fn from_pretrained<P: AsRef<Path>>(path: P, config: &Config) -> Result<Self> {
		let model = Self::new(config)?;
		let state = load_safetensors(path.as_ref())?;
		let state = Self::fix_output_layer(state, config.num_class, config.seed);
		load_state_dict(&model.parameters(), &state)?;
		info!(path = %path.as_ref().display(), "loaded pretrained {}", model.name);
		Ok(model)
	}

	/// Re-initialises `linear.*` in `state` for `num_class` outputs when the
	/// stored shape has a different number of classes.
	pub fn fix_output_layer(mut state: StateDict, num_class: usize, seed: u64) -> StateDict {
		let in_features = match state.get("linear.weight") {
			Some(w) if w.ndim() == 2 && w.shape()[0] != num_class => w.shape()[1],
			_ => return state,
		};
		let mut rng = StdRng::seed_from_u64(seed);
		state.insert(
			"linear.weight".to_string(),
			WeightInitializer::STANDARD_NORMAL_SQRT.array(&mut rng, in_features, &[num_class, in_features]),
		);
		state.insert("linear.bias".to_string(), Array::zeros(IxDyn(&[num_class])));
		state
	}

	/// Biases and gains of the stem and of every convolution, and the
	/// residual `skip_gain`s.
	pub fn exclude_from_weight_decay(name: &str) -> bool {
		let bias_or_gain_after = |marker: &str| {
			name.find(marker)
				.map(|at| &name[at + marker.len()..])
				.map_or(false, |rest| rest.contains("bias") || rest.contains("gain"))
		};
		bias_or_gain_after("stem") || bias_or_gain_after("conv") || name.contains("skip_gain")
	}

	/// The output layer is never clipped.
	pub fn exclude_from_clipping(name: &str) -> bool {
		name.starts_with("linear")
	}
}
impl Module for NfNet {
	fn forward(&self, input: &Tensor, pass: &mut Pass) -> Result<Tensor> {
		let last = self.stem.len() - 1;
		let mut out = input.clone();
		for (i, conv) in self.stem.iter().enumerate() {
			out = conv.forward(&out, pass)?;
			if i != last {
				out = act(self.activation, &out);
			}
		}
		for block in &self.body {
			out = block.forward(&out, pass)?;
		}
		let out = act(self.activation, &self.final_conv.forward(&out, pass)?);
		let shape = out.shape();
		let pooled = out.mean_axes(&[2, 3]).reshape(&shape[..2]);
		let pooled = self.dropout.forward(&pooled, pass)?;
		self.linear.forward(&pooled, pass)
	}

	fn parameters(&self) -> Vec<(String, Tensor)> {
		let mut params: Vec<(String, Tensor)> = self.stem.iter().flat_map(|c| c.parameters()).collect();
		params.extend(self.body.iter().flat_map(|b| b.parameters()));
		params.extend(self.final_conv.parameters());
		params.extend(self.linear.parameters());
		params
	}
}
impl Classifier for NfNet {
	fn name(&self) -> &str {
		&self.name
	}

	fn num_class(&self) -> usize {
		self.num_class
	}

	/// SGD with adaptive gradient clipping; gains, biases and the output
	/// layer get their own settings.
	fn optimizer(&self, config: &Config) -> Box<dyn Optimizer> {
		let nf = &config.nfnet;
		let clipping = nf.do_clip.then_some(nf.clipping);
		let mut optimizer = SgdAgc::new(
			self.parameters(),
			config.learning_rate,
			nf.momentum,
			clipping,
			nf.weight_decay,
			nf.nesterov,
		);
		for group in optimizer.groups_mut() {
			if Self::exclude_from_weight_decay(&group.name) {
				group.weight_decay = 0.0;
			}
			if Self::exclude_from_clipping(&group.name) {
				group.clipping = None;
			}
		}
		Box::new(optimizer)
	}

	fn uses_grad_scaler(&self) -> bool {
		true
	}
}
