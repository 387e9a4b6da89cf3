//! Checkpoint directories.
//!
//! ```text
//! <run>/epoch_0005/model.safetensors
//! <run>/epoch_0005/optimizer.safetensors
//! <run>/epoch_0005/checkpoint.json
//! <run>/best/...
//! <run>/history.csv
//! ```

use std::collections::BTreeMap;
use std::fs;
use std::path::{Path, PathBuf};

use ndarray::IxDyn;
use safetensors::tensor::{SafeTensors, TensorView};
use safetensors::{serialize_to_file, Dtype};
use serde::{Deserialize, Serialize};

use crate::error::{Error, Result};
use crate::optim::{GradScalerState, Optimizer};
use crate::tensor::{Array, Tensor};

pub type StateDict = BTreeMap<String, Array>;

const MODEL_FILE: &str = "model.safetensors";
const OPTIMIZER_FILE: &str = "optimizer.safetensors";
const META_FILE: &str = "checkpoint.json";
pub const BEST_DIR: &str = "best";

/// Everything besides tensors needed to resume a run.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CheckpointMeta {
	pub model: String,
	/// Number of completed epochs.
	pub epoch: usize,
	pub best_valid_loss: Option<f32>,
	pub epochs_without_improvement: usize,
	pub learning_rate: f32,
	pub scaler: Option<GradScalerState>,
	pub saved_at: String,
}

pub fn epoch_dir_name(epoch: usize) -> String {
	format!("epoch_{:04}", epoch)
}

/// Epoch number of a directory named by `epoch_dir_name`.
pub fn parse_epoch_dir(name: &str) -> Option<usize> {
	name.strip_prefix("epoch_")?.parse().ok()
}

pub fn state_dict(params: &[(String, Tensor)]) -> StateDict {
	params
		.iter()
		.map(|(name, p)| (name.clone(), p.value().clone()))
		.collect()
}

/// Copies every tensor of `state` into the parameter of the same name.
/// Missing names and shape differences are errors; extra entries are ignored.
pub fn load_state_dict(params: &[(String, Tensor)], state: &StateDict) -> Result<()> {
	for (name, param) in params {
		let value = state.get(name).ok_or_else(|| Error::MissingTensor(name.clone()))?;
		if value.shape() != param.shape().as_slice() {
			return Err(Error::ShapeMismatch {
				op: "load_state_dict",
				expected: param.shape(),
				actual: value.shape().to_vec(),
			});
		}
		param.set_value(value.clone());
	}
	Ok(())
}

pub fn save_safetensors<P: AsRef<Path>>(path: P, state: &StateDict) -> Result<()> {
	let bytes: Vec<(&String, Vec<usize>, Vec<u8>)> = state
		.iter()
		.map(|(name, arr)| {
			let data = arr.iter().flat_map(|v| v.to_le_bytes()).collect();
			(name, arr.shape().to_vec(), data)
		})
		.collect();
	let views = bytes
		.iter()
		.map(|(name, shape, data)| Ok((name.as_str(), TensorView::new(Dtype::F32, shape.clone(), data)?)))
		.collect::<Result<Vec<_>>>()?;
	serialize_to_file(views, &None, path.as_ref())?;
	Ok(())
}

pub fn load_safetensors<P: AsRef<Path>>(path: P) -> Result<StateDict> {
	let buffer = fs::read(path)?;
	let tensors = SafeTensors::deserialize(&buffer)?;
	let mut state = StateDict::new();
	for (name, view) in tensors.tensors() {
		if view.dtype() != Dtype::F32 {
			return Err(Error::UnsupportedDtype(format!("{:?} ({})", view.dtype(), name)));
		}
		let values: Vec<f32> = view
			.data()
			.chunks_exact(4)
			.map(|c| f32::from_le_bytes([c[0], c[1], c[2], c[3]]))
			.collect();
		state.insert(name, Array::from_shape_vec(IxDyn(view.shape()), values)?);
	}
	Ok(state)
}

pub fn save_checkpoint(
	dir: &Path,
	params: &[(String, Tensor)],
	optimizer: &dyn Optimizer,
	meta: &CheckpointMeta,
) -> Result<()> {
	fs::create_dir_all(dir)?;
	save_safetensors(dir.join(MODEL_FILE), &state_dict(params))?;
	save_safetensors(dir.join(OPTIMIZER_FILE), &optimizer.state_dict())?;
	fs::write(dir.join(META_FILE), serde_json::to_string_pretty(meta)?)?;
	Ok(())
}

/// Restores weights and optimizer buffers and returns the stored metadata.
pub fn load_checkpoint(dir: &Path, params: &[(String, Tensor)], optimizer: &mut dyn Optimizer) -> Result<CheckpointMeta> {
	if !dir.join(META_FILE).is_file() {
		return Err(Error::CheckpointNotFound(dir.to_path_buf()));
	}
	load_state_dict(params, &load_safetensors(dir.join(MODEL_FILE))?)?;
	optimizer.load_state_dict(&load_safetensors(dir.join(OPTIMIZER_FILE))?)?;
	let meta: CheckpointMeta = serde_json::from_str(&fs::read_to_string(dir.join(META_FILE))?)?;
	optimizer.set_learning_rate(meta.learning_rate);
	Ok(meta)
}

/// The checkpoint of `run` with the highest epoch.
pub fn last_epoch_dir(run: &Path) -> Result<Option<PathBuf>> {
	let mut best: Option<(usize, PathBuf)> = None;
	for entry in fs::read_dir(run)? {
		let path = entry?.path();
		let epoch = match path.file_name().and_then(|n| n.to_str()).and_then(parse_epoch_dir) {
			Some(epoch) if path.join(META_FILE).is_file() => epoch,
			_ => continue,
		};
		if best.as_ref().map_or(true, |(e, _)| epoch > *e) {
			best = Some((epoch, path));
		}
	}
	Ok(best.map(|(_, path)| path))
}

#[cfg(test)]
mod tests {
	use super::*;
	use crate::optim::Adam;
	use ndarray::arr2;
	use tempfile::tempdir;

	fn params() -> Vec<(String, Tensor)> {
		vec![
			("fc.weight".to_string(), Tensor::parameter(arr2(&[[1.0f32, 2.0], [3.0, 4.0]]).into_dyn())),
			("fc.bias".to_string(), Tensor::parameter(Array::zeros(IxDyn(&[2])))),
		]
	}

	#[test]
	fn safetensors_round_trip() {
		let dir = tempdir().unwrap();
		let path = dir.path().join("w.safetensors");
		let state = state_dict(&params());
		save_safetensors(&path, &state).unwrap();
		assert_eq!(load_safetensors(&path).unwrap(), state);
	}

	#[test]
	fn loading_checks_names_and_shapes() {
		let target = params();
		let mut state = state_dict(&target);
		state.remove("fc.bias");
		assert!(matches!(load_state_dict(&target, &state), Err(Error::MissingTensor(n)) if n == "fc.bias"));

		state.insert("fc.bias".to_string(), Array::zeros(IxDyn(&[3])));
		assert!(matches!(load_state_dict(&target, &state), Err(Error::ShapeMismatch { .. })));
	}

	#[test]
	fn newest_epoch_directory_wins() {
		let run = tempdir().unwrap();
		let p = params();
		let adam = Adam::new(p.clone(), 0.01);
		for epoch in [2, 10, 5] {
			let meta = CheckpointMeta {
				model: "m".to_string(),
				epoch,
				best_valid_loss: None,
				epochs_without_improvement: 0,
				learning_rate: 0.01,
				scaler: None,
				saved_at: String::new(),
			};
			save_checkpoint(&run.path().join(epoch_dir_name(epoch)), &p, &adam, &meta).unwrap();
		}
		fs::create_dir(run.path().join("epoch_0099")).unwrap();
		let last = last_epoch_dir(run.path()).unwrap().unwrap();
		assert!(last.ends_with("epoch_0010"));

		let mut adam = Adam::new(p.clone(), 0.5);
		let meta = load_checkpoint(&last, &p, &mut adam).unwrap();
		assert_eq!(meta.epoch, 10);
		assert_eq!(adam.learning_rate(), 0.01);
	}

	#[test]
	fn missing_checkpoint_is_reported() {
		let dir = tempdir().unwrap();
		let p = params();
		let mut adam = Adam::new(p.clone(), 0.01);
		assert!(matches!(
			load_checkpoint(dir.path(), &p, &mut adam),
			Err(Error::CheckpointNotFound(_))
		));
	}
}
