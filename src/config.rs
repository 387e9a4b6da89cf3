//! Training configuration.
//!
//! A `Config` is built from defaults and optionally overridden by a JSON
//! file; every field may be omitted from the file.
//!
//! ```json
//! {
//!   "learning_rate": 0.001,
//!   "batch_size": { "train": 16, "eval": 16 },
//!   "num_class": 10,
//!   "nfnet": { "variant": "F1", "clipping": 0.1 }
//! }
//! ```

use std::fs;
use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};
use serde_json::Value;
use tracing::info;

use crate::error::{Error, Result};
use crate::models::NfnetVariant;
use crate::nn::Activation;
use crate::vae::VaeConfig;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct BatchSize {
	pub train: usize,
	pub eval: usize,
}
impl Default for BatchSize {
	fn default() -> Self {
		Self { train: 32, eval: 32 }
	}
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
	pub learning_rate: f32,
	pub batch_size: BatchSize,
	/// Threads decoding images for a batch.
	pub num_workers: usize,
	pub persistent_workers: bool,
	pub pin_memory: bool,
	/// Images are resized to `image_size` x `image_size`.
	pub image_size: usize,
	pub num_class: usize,
	pub dropout_rate: f32,
	/// Epochs without a better validation loss before training stops; 0 disables.
	pub early_stopping_threshold: usize,
	pub epochs_per_checkpoint: usize,
	pub checkpoint_root: PathBuf,
	pub seed: u64,
	pub device: String,
	pub nfnet: NfnetConfig,
	pub vae: VaeConfig,
}
impl Default for Config {
	fn default() -> Self {
		Self {
			learning_rate: 1e-3,
			batch_size: BatchSize::default(),
			num_workers: 4,
			persistent_workers: false,
			pin_memory: false,
			image_size: 224,
			num_class: 15,
			dropout_rate: 0.5,
			early_stopping_threshold: 10,
			epochs_per_checkpoint: 5,
			checkpoint_root: PathBuf::from("checkpoints"),
			seed: 0,
			device: "cpu".to_string(),
			nfnet: NfnetConfig::default(),
			vae: VaeConfig::default(),
		}
	}
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct NfnetConfig {
	/// Automatic mixed precision. Accepted for compatibility; arithmetic stays f32.
	pub amp: bool,
	pub variant: NfnetVariant,
	pub activation: Activation,
	/// Probability that a residual branch is dropped for one step (last block).
	pub stochdepth_rate: f32,
	/// Residual branch scaling at the end of each block.
	pub alpha: f32,
	/// Squeeze-excite expansion ratio.
	pub se_ratio: f32,
	pub use_fp16: bool,
	/// Train on a single batch only.
	pub overfit: bool,
	pub momentum: f32,
	pub weight_decay: f32,
	pub nesterov: bool,
	/// Adaptive gradient clipping.
	pub do_clip: bool,
	pub clipping: f32,
	pub epochs_per_checkpoint: usize,
}
impl Default for NfnetConfig {
	fn default() -> Self {
		Self {
			amp: false,
			variant: NfnetVariant::F1,
			activation: Activation::Gelu,
			stochdepth_rate: 0.25,
			alpha: 0.2,
			se_ratio: 0.5,
			use_fp16: false,
			overfit: false,
			momentum: 0.9,
			weight_decay: 0.00002,
			nesterov: true,
			do_clip: true,
			clipping: 0.1,
			epochs_per_checkpoint: 1,
		}
	}
}

impl Config {
	/// Defaults for NFNet training: checkpoints every epoch.
	pub fn nfnet() -> Self {
		let nfnet = NfnetConfig::default();
		Self {
			epochs_per_checkpoint: nfnet.epochs_per_checkpoint,
			nfnet,
			..Self::default()
		}
	}

	/// Overrides `self` with the fields present in a JSON file.
	pub fn merge_file<P: AsRef<Path>>(&self, path: P) -> Result<Self> {
		let contents = fs::read_to_string(path)?;
		let overrides: Value = serde_json::from_str(&contents)?;
		let mut base = serde_json::to_value(self)?;
		merge_json(&mut base, overrides);
		let config: Config = serde_json::from_value(base)?;
		config.validate()?;
		Ok(config)
	}

	pub fn validate(&self) -> Result<()> {
		let invalid = |msg: &str| -> Result<()> { Err(Error::Config(msg.to_string())) };
		if !(self.learning_rate > 0.0) {
			return invalid("learning_rate must be positive");
		}
		if self.batch_size.train == 0 || self.batch_size.eval == 0 {
			return invalid("batch sizes must be positive");
		}
		if self.num_class == 0 {
			return invalid("num_class must be positive");
		}
		if self.image_size < 4 {
			return invalid("image_size must be at least 4");
		}
		if !(0.0..1.0).contains(&self.dropout_rate) {
			return invalid("dropout_rate must be in [0, 1)");
		}
		if self.epochs_per_checkpoint == 0 {
			return invalid("epochs_per_checkpoint must be positive");
		}
		if !(0.0..1.0).contains(&self.nfnet.stochdepth_rate) {
			return invalid("nfnet.stochdepth_rate must be in [0, 1)");
		}
		if self.nfnet.se_ratio <= 0.0 {
			return invalid("nfnet.se_ratio must be positive");
		}
		if self.nfnet.do_clip && self.nfnet.clipping <= 0.0 {
			return invalid("nfnet.clipping must be positive when clipping is enabled");
		}
		if self.nfnet.momentum < 0.0 || self.nfnet.weight_decay < 0.0 {
			return invalid("nfnet.momentum and nfnet.weight_decay must be non-negative");
		}
		self.vae.validate()
	}

	/// Logs every field, one line each.
	pub fn display(&self) {
		let value = match serde_json::to_value(self) {
			Ok(value) => value,
			Err(_) => return,
		};
		let mut lines = Vec::new();
		flatten_json("", &value, &mut lines);
		for (key, value) in lines {
			info!("{:<32} {}", key, value);
		}
	}
}

/// Loads a configuration file over the defaults.
pub fn load_config<P: AsRef<Path>>(path: P) -> Result<Config> {
	Config::default().merge_file(path)
}

fn merge_json(base: &mut Value, overrides: Value) {
	match (base, overrides) {
		(Value::Object(base), Value::Object(overrides)) => {
			for (key, value) in overrides {
				match base.get_mut(&key) {
					Some(slot) => merge_json(slot, value),
					None => {
						base.insert(key, value);
					}
				}
			}
		}
		(slot, value) => *slot = value,
	}
}

fn flatten_json(prefix: &str, value: &Value, out: &mut Vec<(String, String)>) {
	match value {
		Value::Object(map) => {
			for (key, value) in map {
				let key = if prefix.is_empty() { key.clone() } else { format!("{}.{}", prefix, key) };
				flatten_json(&key, value, out);
			}
		}
		other => out.push((prefix.to_string(), other.to_string())),
	}
}
