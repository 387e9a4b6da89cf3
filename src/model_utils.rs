//! Training, checkpointing and inference for classifiers.
//!
//! A run lives in `<checkpoint_root>/<model name>/<YYYYmmdd-HHMMSS>/` and
//! holds one directory per saved epoch, a `best` directory and
//! `history.csv`.

use std::fs;
use std::path::{Path, PathBuf};

use chrono::Local;
use ndarray::{Axis, Ix2};
use tracing::{debug, info, warn};

use crate::checkpoint::{self, epoch_dir_name, CheckpointMeta, BEST_DIR};
use crate::config::Config;
use crate::dataset::{check_categories, Dataset, Mode, Record};
use crate::error::{Error, Result};
use crate::history::{EpochRecord, History};
use crate::models::{Classifier, NfNet};
use crate::nn::Pass;
use crate::optim::{GradScaler, Optimizer};
use crate::tensor::{Array, NoGradGuard};
use crate::utils::progress_bar;

const HISTORY_FILE: &str = "history.csv";

/// Predicted category per dataset row.
#[derive(Debug, Clone, PartialEq)]
pub struct Predictions {
	pub labels: Vec<String>,
	/// Softmax probability of the predicted category.
	pub confidence: Option<Vec<f32>>,
}
impl Predictions {
	pub fn len(&self) -> usize {
		self.labels.len()
	}

	pub fn is_empty(&self) -> bool {
		self.labels.is_empty()
	}

	/// Writes `img,label[,confidence]` rows, `img` being the file name of
	/// each record.
	pub fn write_csv<P: AsRef<Path>>(&self, path: P, records: &[Record]) -> Result<()> {
		if records.len() != self.labels.len() {
			return Err(Error::Dataset(format!(
				"{} predictions for {} records",
				self.labels.len(),
				records.len()
			)));
		}
		let mut w = csv::Writer::from_path(path)?;
		match &self.confidence {
			Some(_) => w.write_record(["img", "label", "confidence"])?,
			None => w.write_record(["img", "label"])?,
		}
		for (i, (record, label)) in records.iter().zip(&self.labels).enumerate() {
			let img = record
				.path
				.file_name()
				.map(|n| n.to_string_lossy().into_owned())
				.unwrap_or_default();
			match &self.confidence {
				Some(confidence) => w.write_record([img, label.clone(), confidence[i].to_string()])?,
				None => w.write_record([img, label.clone()])?,
			}
		}
		w.flush()?;
		Ok(())
	}
}

/// Rows whose largest logit is at the target index.
fn count_correct(logits: &Array, targets: &[usize]) -> usize {
	let logits = match logits.view().into_dimensionality::<Ix2>() {
		Ok(logits) => logits,
		Err(_) => return 0,
	};
	logits
		.axis_iter(Axis(0))
		.zip(targets)
		.filter(|(row, t)| argmax(row.iter().copied()).0 == **t)
		.count()
}

fn argmax<I: Iterator<Item = f32>>(values: I) -> (usize, f32) {
	values
		.enumerate()
		.fold((0, f32::NEG_INFINITY), |best, (i, v)| if v > best.1 { (i, v) } else { best })
}

/// Reports a run of NaN batch losses once when it starts and once when it ends.
#[derive(Debug, Default)]
struct NanMonitor {
	is_nan: bool,
}
impl NanMonitor {
	/// Returns whether `loss` switched between NaN and finite.
	fn observe(&mut self, epoch: usize, loss: f64) -> bool {
		if loss.is_nan() == self.is_nan {
			return false;
		}
		self.is_nan = loss.is_nan();
		if self.is_nan {
			warn!(epoch, "loss is nan");
		} else {
			info!(epoch, "loss no longer nan");
		}
		true
	}
}

pub struct ModelUtils {
	model: Box<dyn Classifier>,
	config: Config,
	optimizer: Box<dyn Optimizer>,
	scaler: Option<GradScaler>,
	/// Completed epochs.
	epoch: usize,
	root: PathBuf,
	history: History,
	best_valid_loss: Option<f32>,
	epochs_without_improvement: usize,
}
impl ModelUtils {
	fn assemble(model: Box<dyn Classifier>, config: &Config, root: PathBuf) -> Self {
		let optimizer = model.optimizer(config);
		let scaler = model.uses_grad_scaler().then(GradScaler::new);
		if config.nfnet.amp || config.nfnet.use_fp16 {
			debug!("amp/use_fp16 requested; computing in f32");
		}
		Self {
			model,
			config: config.clone(),
			optimizer,
			scaler,
			epoch: 0,
			root,
			history: History::new(),
			best_valid_loss: None,
			epochs_without_improvement: 0,
		}
	}

	fn runs_dir(config: &Config, model: &dyn Classifier) -> PathBuf {
		config.checkpoint_root.join(model.name())
	}

	/// Starts a run in a fresh timestamped directory.
	pub fn start_new_training(model: Box<dyn Classifier>, config: &Config) -> Result<Self> {
		let mut root = Self::runs_dir(config, model.as_ref()).join(Local::now().format("%Y%m%d-%H%M%S").to_string());
		// two runs started within the same second
		let mut suffix = 1;
		while root.exists() {
			root.set_extension(suffix.to_string());
			suffix += 1;
		}
		fs::create_dir_all(&root)?;
		info!(model = model.name(), root = %root.display(), params = model.parameter_count(), "new training run");
		Ok(Self::assemble(model, config, root))
	}

	/// Starts a run for an NFNet initialised from pretrained safetensors
	/// weights, its output layer resized to `config.num_class`.
	pub fn start_new_training_from_pretrained<P: AsRef<Path>>(config: &Config, weights: P) -> Result<Self> {
		Self::start_new_training(Box::new(NfNet::from_pretrained(weights, config)?), config)
	}

	/// Resumes from a checkpoint directory (`<run>/epoch_NNNN` or `<run>/best`).
	pub fn load_checkpoint<P: AsRef<Path>>(model: Box<dyn Classifier>, config: &Config, checkpoint_path: P) -> Result<Self> {
		let path = checkpoint_path.as_ref();
		let root = path
			.parent()
			.map(Path::to_path_buf)
			.ok_or_else(|| Error::CheckpointNotFound(path.to_path_buf()))?;
		let mut utils = Self::assemble(model, config, root);
		let meta = checkpoint::load_checkpoint(path, &utils.model.parameters(), utils.optimizer.as_mut())?;
		if let (Some(scaler), Some(state)) = (utils.scaler.as_mut(), meta.scaler) {
			scaler.load_state(state);
		}
		let history_path = utils.root.join(HISTORY_FILE);
		if history_path.is_file() {
			let mut history = History::load(&history_path)?;
			history.truncate(meta.epoch);
			utils.history = history;
		}
		utils.epoch = meta.epoch;
		utils.best_valid_loss = meta.best_valid_loss;
		utils.epochs_without_improvement = meta.epochs_without_improvement;
		info!(model = utils.model.name(), checkpoint = %path.display(), epoch = meta.epoch, "resumed");
		Ok(utils)
	}

	/// Resumes the newest run of this model from its highest saved epoch, or
	/// starts a new run when there is none.
	pub fn load_last_checkpoint(model: Box<dyn Classifier>, config: &Config) -> Result<Self> {
		let runs = Self::runs_dir(config, model.as_ref());
		let mut candidates: Vec<PathBuf> = match fs::read_dir(&runs) {
			Ok(entries) => entries
				.filter_map(|e| e.ok().map(|e| e.path()))
				.filter(|p| p.is_dir())
				.collect(),
			Err(_) => Vec::new(),
		};
		candidates.sort();
		for run in candidates.iter().rev() {
			if let Some(last) = checkpoint::last_epoch_dir(run)? {
				return Self::load_checkpoint(model, config, last);
			}
		}
		warn!(runs = %runs.display(), "no checkpoint found, starting a new run");
		Self::start_new_training(model, config)
	}

	pub fn model(&self) -> &dyn Classifier {
		self.model.as_ref()
	}

	pub fn history(&self) -> &History {
		&self.history
	}

	pub fn root(&self) -> &Path {
		&self.root
	}

	pub fn epoch(&self) -> usize {
		self.epoch
	}

	pub fn scaler(&self) -> Option<&GradScaler> {
		self.scaler.as_ref()
	}

	fn meta(&self) -> CheckpointMeta {
		CheckpointMeta {
			model: self.model.name().to_string(),
			epoch: self.epoch,
			best_valid_loss: self.best_valid_loss,
			epochs_without_improvement: self.epochs_without_improvement,
			learning_rate: self.optimizer.learning_rate(),
			scaler: self.scaler.as_ref().map(GradScaler::state),
			saved_at: Local::now().to_rfc3339(),
		}
	}

	fn save(&self, dir_name: &str) -> Result<PathBuf> {
		let dir = self.root.join(dir_name);
		checkpoint::save_checkpoint(&dir, &self.model.parameters(), self.optimizer.as_ref(), &self.meta())?;
		debug!(dir = %dir.display(), "saved checkpoint");
		Ok(dir)
	}

	/// Trains until `epochs` epochs are completed in total.
	///
	/// Saves a checkpoint every `epochs_per_checkpoint` epochs and after the
	/// last one, keeps the weights with the lowest validation loss in
	/// `best`, stops early after `early_stopping_threshold` epochs without
	/// improvement and finally reports the test set if it is not empty.
	pub fn train(&mut self, epochs: usize, train: &Dataset, valid: &Dataset, test: &Dataset) -> Result<&History> {
		if self.epoch >= epochs {
			warn!(completed = self.epoch, epochs, "nothing to train");
			return Ok(&self.history);
		}
		info!(
			model = self.model.name(),
			train = train.len(),
			valid = valid.len(),
			test = test.len(),
			"training epochs {}..={}",
			self.epoch + 1,
			epochs
		);
		let threshold = self.config.early_stopping_threshold;
		let mut saved_epoch = None;

		for epoch in self.epoch + 1..=epochs {
			let started = Local::now();
			let (train_loss, train_acc) = self.train_epoch(train, epoch)?;
			let (valid_loss, valid_acc) = self.eval_epoch(valid)?;
			let seconds = (Local::now() - started).num_milliseconds() as f64 / 1000.0;
			self.epoch = epoch;
			self.history.push(EpochRecord {
				epoch,
				train_loss,
				train_acc,
				valid_loss,
				valid_acc,
				seconds,
			});

			let improved = match self.best_valid_loss {
				Some(best) => valid_loss < best,
				None => !valid_loss.is_nan(),
			};
			if improved {
				self.best_valid_loss = Some(valid_loss);
				self.epochs_without_improvement = 0;
				self.save(BEST_DIR)?;
			} else {
				self.epochs_without_improvement += 1;
			}
			if epoch % self.config.epochs_per_checkpoint == 0 {
				self.save(&epoch_dir_name(epoch))?;
				saved_epoch = Some(epoch);
			}
			self.history.save(self.root.join(HISTORY_FILE))?;

			if threshold > 0 && self.epochs_without_improvement >= threshold {
				info!(epoch, "no improvement for {} epochs, stopping early", threshold);
				break;
			}
		}
		if saved_epoch != Some(self.epoch) {
			self.save(&epoch_dir_name(self.epoch))?;
		}

		if !test.is_empty() {
			let (test_loss, test_acc) = self.eval_epoch(test)?;
			info!("test loss {:.4} acc {:.2}%", test_loss, test_acc * 100.0);
		}
		for line in self.history.table().lines() {
			info!("{}", line);
		}
		Ok(&self.history)
	}

	/// Labels must index into the model's output layer.
	fn check_labels(&self, dataset: &Dataset) -> Result<()> {
		if dataset.mode() == Mode::Inference {
			return Err(Error::Dataset("cannot compute a loss on an inference-mode dataset".to_string()));
		}
		let num_class = self.model.num_class();
		match dataset.records().iter().filter_map(|r| r.label).find(|&label| label >= num_class) {
			Some(label) => Err(Error::Dataset(format!(
				"label {} does not fit a {}-class model, raise num_class",
				label, num_class
			))),
			None => Ok(()),
		}
	}

	/// One optimisation pass; returns the sample-weighted mean loss and the
	/// accuracy.
	pub fn train_epoch(&mut self, dataset: &Dataset, epoch: usize) -> Result<(f32, f32)> {
		if dataset.is_empty() {
			return Err(Error::Dataset("training set is empty".to_string()));
		}
		self.check_labels(dataset)?;
		let loader = dataset.data_loader(epoch as u64)?;
		let bar = progress_bar(loader.num_batches(), &format!("epoch {}", epoch));
		let mut pass = Pass::train(self.config.seed.wrapping_add(epoch as u64));
		let (mut running_loss, mut correct, mut seen) = (0.0f64, 0usize, 0usize);
		let mut nan = NanMonitor::default();

		for batch in loader {
			let batch = batch?;
			self.optimizer.zero_grad();
			let output = self.model.forward(&batch.input(), &mut pass)?;
			let loss = output.cross_entropy(&batch.targets);
			match self.scaler.as_mut() {
				Some(scaler) => {
					scaler.backward(&loss);
					if !scaler.step(self.optimizer.as_mut()) {
						debug!(scale = scaler.scale(), "skipped step on non-finite gradients");
					}
					scaler.update();
				}
				None => {
					loss.backward();
					self.optimizer.step();
				}
			}

			let batch_loss = loss.item() as f64 * batch.len() as f64;
			nan.observe(epoch, batch_loss);
			running_loss += batch_loss;
			correct += count_correct(&output.value(), &batch.targets);
			seen += batch.len();
			bar.inc(1);
			if self.config.nfnet.overfit {
				break;
			}
		}
		bar.finish_and_clear();
		Ok(((running_loss / seen as f64) as f32, correct as f32 / seen as f32))
	}

	/// Loss and accuracy without recording gradients.
	pub fn eval_epoch(&self, dataset: &Dataset) -> Result<(f32, f32)> {
		if dataset.is_empty() {
			return Err(Error::Dataset("evaluation set is empty".to_string()));
		}
		self.check_labels(dataset)?;
		let _guard = NoGradGuard::new();
		let loader = dataset.data_loader(0)?;
		let bar = progress_bar(loader.num_batches(), "eval");
		let mut pass = Pass::eval();
		let (mut total_loss, mut correct) = (0.0f64, 0usize);
		for batch in loader {
			let batch = batch?;
			let output = self.model.forward(&batch.input(), &mut pass)?;
			total_loss += output.cross_entropy(&batch.targets).item() as f64 * batch.len() as f64;
			correct += count_correct(&output.value(), &batch.targets);
			bar.inc(1);
		}
		bar.finish_and_clear();
		let n = dataset.len();
		Ok(((total_loss / n as f64) as f32, correct as f32 / n as f32))
	}

	/// Predicts a category for every row of an inference-mode dataset.
	/// Without `categories` the class indices are used as names, as they
	/// are for classes past the end of a shorter category list.
	pub fn inference(&self, dataset: &Dataset, categories: Option<&[String]>, confidence: bool) -> Result<Predictions> {
		if dataset.mode() != Mode::Inference {
			return Err(Error::Dataset(format!("inference needs an inference-mode dataset, got {:?}", dataset.mode())));
		}
		let categories = categories.unwrap_or(&[]);
		check_categories(categories, self.model.num_class())?;

		let _guard = NoGradGuard::new();
		let mut labels = vec![String::new(); dataset.len()];
		let mut confidences = vec![0.0f32; dataset.len()];
		let loader = dataset.data_loader(0)?;
		let bar = progress_bar(loader.num_batches(), "inference");
		let mut pass = Pass::eval();
		for batch in loader {
			let batch = batch?;
			let probs = self.model.forward(&batch.input(), &mut pass)?.softmax(1);
			let probs = probs.value();
			for (row, &index) in probs.axis_iter(Axis(0)).zip(&batch.targets) {
				let (class, p) = argmax(row.iter().copied());
				labels[index] = categories.get(class).cloned().unwrap_or_else(|| class.to_string());
				confidences[index] = p;
			}
			bar.inc(1);
		}
		bar.finish_and_clear();
		Ok(Predictions {
			labels,
			confidence: confidence.then_some(confidences),
		})
	}
}

#[cfg(test)]
mod tests {
	use super::*;
	use ndarray::arr2;

	#[test]
	fn counts_rows_whose_argmax_matches() {
		let logits = arr2(&[[0.1f32, 0.9], [2.0, -1.0], [0.0, 3.0]]).into_dyn();
		assert_eq!(count_correct(&logits, &[1, 0, 0]), 2);
	}

	#[test]
	fn argmax_prefers_the_first_maximum() {
		assert_eq!(argmax([1.0f32, 3.0, 3.0].into_iter()), (1, 3.0));
	}

	#[test]
	fn nan_runs_are_reported_on_entry_and_recovery() {
		let mut nan = NanMonitor::default();
		let switches: Vec<bool> = [1.0, f64::NAN, f64::NAN, 2.0, 3.0, f64::NAN]
			.iter()
			.map(|&loss| nan.observe(1, loss))
			.collect();
		assert_eq!(switches, vec![false, true, false, true, false, true]);
	}

	#[test]
	fn predictions_csv_has_optional_confidence() {
		let dir = tempfile::tempdir().unwrap();
		let records = vec![
			Record {
				path: PathBuf::from("imgs/a.jpg"),
				label: None,
			},
			Record {
				path: PathBuf::from("imgs/b.jpg"),
				label: None,
			},
		];
		let mut predictions = Predictions {
			labels: vec!["cat".to_string(), "dog".to_string()],
			confidence: Some(vec![0.5, 0.75]),
		};
		let path = dir.path().join("p.csv");
		predictions.write_csv(&path, &records).unwrap();
		assert_eq!(fs::read_to_string(&path).unwrap(), "img,label,confidence\na.jpg,cat,0.5\nb.jpg,dog,0.75\n");

		predictions.confidence = None;
		predictions.write_csv(&path, &records).unwrap();
		assert_eq!(fs::read_to_string(&path).unwrap(), "img,label\na.jpg,cat\nb.jpg,dog\n");
	}
}
