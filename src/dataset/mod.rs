//! Image classification datasets described by CSV files.
//!
//! A training CSV has a header and two columns, the image file (relative to
//! an image root) and its category name. Test CSVs only need the first
//! column.

mod loader;
mod transform;

use std::collections::BTreeSet;
use std::path::{Path, PathBuf};
#[cfg(feature = "rayon")]
use std::sync::Arc;

use rand::seq::SliceRandom;
use rand::{rngs::StdRng, SeedableRng};
use tracing::debug;

use crate::config::Config;
use crate::error::{Error, Result};

pub use loader::{Batch, DataLoader};
pub use transform::{to_chw, Transform};

const SPLIT_SEED: u64 = 0xAAAA_AAAA;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Record {
	pub path: PathBuf,
	/// Index into the category list; absent for unlabelled test images.
	pub label: Option<usize>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Mode {
	Train,
	Eval,
	Inference,
}

/// Reads a labelled CSV. Categories are the sorted distinct names of the
/// second column and labels index into them.
pub fn load_csv<P: AsRef<Path>, Q: AsRef<Path>>(csv_path: P, images_root: Q) -> Result<(Vec<Record>, Vec<String>)> {
	let mut reader = csv::Reader::from_path(csv_path.as_ref())?;
	let mut rows = Vec::new();
	for row in reader.records() {
		let row = row?;
		match (row.get(0), row.get(1)) {
			(Some(file), Some(category)) => rows.push((file.to_string(), category.to_string())),
			_ => {
				return Err(Error::Dataset(format!(
					"{}: expected two columns, got {:?}",
					csv_path.as_ref().display(),
					row
				)))
			}
		}
	}
	let categories: Vec<String> = rows
		.iter()
		.map(|(_, c)| c.clone())
		.collect::<BTreeSet<_>>()
		.into_iter()
		.collect();
	let records = rows
		.into_iter()
		.map(|(file, category)| Record {
			path: images_root.as_ref().join(file),
			label: categories.binary_search(&category).ok(),
		})
		.collect();
	Ok((records, categories))
}

/// A model with `num_class` outputs can name every category. Fewer
/// categories than outputs is allowed.
pub fn check_categories(categories: &[String], num_class: usize) -> Result<()> {
	if categories.len() > num_class {
		return Err(Error::Dataset(format!(
			"{} categories do not fit a {}-class model, raise num_class",
			categories.len(),
			num_class
		)));
	}
	Ok(())
}

/// Reads the first column of an unlabelled CSV.
pub fn load_test_csv<P: AsRef<Path>, Q: AsRef<Path>>(csv_path: P, images_root: Q) -> Result<Vec<Record>> {
	let mut reader = csv::Reader::from_path(csv_path.as_ref())?;
	let mut records = Vec::new();
	for row in reader.records() {
		let row = row?;
		let file = row
			.get(0)
			.ok_or_else(|| Error::Dataset(format!("{}: empty row", csv_path.as_ref().display())))?;
		records.push(Record {
			path: images_root.as_ref().join(file),
			label: None,
		});
	}
	Ok(records)
}

pub struct Dataset {
	records: Vec<Record>,
	mode: Mode,
	transform: Transform,
	config: Config,
	#[cfg(feature = "rayon")]
	pool: Option<Arc<rayon::ThreadPool>>,
}
impl Dataset {
	/// `transform` defaults to the train transform in train mode and the eval
	/// transform otherwise.
	pub fn new(records: Vec<Record>, config: &Config, mode: Mode, transform: Option<Transform>) -> Result<Self> {
		if mode != Mode::Inference {
			if let Some(record) = records.iter().find(|r| r.label.is_none()) {
				return Err(Error::Dataset(format!(
					"{} has no label, which {:?} mode requires",
					record.path.display(),
					mode
				)));
			}
		}
		let transform = transform.unwrap_or(match mode {
			Mode::Train => Transform::train(config.image_size),
			_ => Transform::eval(config.image_size),
		});
		Ok(Self {
			records,
			mode,
			transform,
			config: config.clone(),
			#[cfg(feature = "rayon")]
			pool: if config.persistent_workers {
				loader::worker_pool(config.num_workers)?.map(Arc::new)
			} else {
				None
			},
		})
	}

	/// Shuffles `records` with a fixed seed and puts the first
	/// `floor(n * train_ratio)` of them in the first dataset.
	pub fn train_test_split(
		records: Vec<Record>,
		train_ratio: f64,
		config: &Config,
		transforms: Option<(Transform, Transform)>,
		modes: (Mode, Mode),
	) -> Result<(Dataset, Dataset)> {
		if !(0.0..1.0).contains(&train_ratio) {
			return Err(Error::Dataset(format!("train ratio must be in [0, 1), got {}", train_ratio)));
		}
		let train_size = (records.len() as f64 * train_ratio) as usize;
		let (train, rest) = shuffled_split(records, train_size);
		let (t0, t1) = match transforms {
			Some((t0, t1)) => (Some(t0), Some(t1)),
			None => (None, None),
		};
		Ok((
			Dataset::new(train, config, modes.0, t0)?,
			Dataset::new(rest, config, modes.1, t1)?,
		))
	}

	/// Splits into train, valid and test sets. `split_ratio` gives the train
	/// and valid shares; whatever remains is the test set.
	pub fn split(
		records: Vec<Record>,
		split_ratio: [f64; 2],
		config: &Config,
		transforms: Option<(Transform, Transform)>,
	) -> Result<(Dataset, Dataset, Dataset)> {
		let [train_ratio, valid_ratio] = split_ratio;
		let total = train_ratio + valid_ratio;
		if total > 1.0 + f64::EPSILON || train_ratio < 0.0 || valid_ratio < 0.0 {
			return Err(Error::Dataset(format!(
				"split ratios must be non-negative and sum to at most 1, got {:?}",
				split_ratio
			)));
		}
		let (train, rest) = Self::train_test_split(records, train_ratio, config, transforms, (Mode::Train, Mode::Eval))?;
		let valid_share = valid_ratio / (1.0 - train_ratio);
		let eval_transform = transforms.map(|(_, t)| (t, t));
		let (valid, test) = if valid_share >= 1.0 - f64::EPSILON {
			(
				Dataset::new(rest.records, config, Mode::Eval, eval_transform.map(|t| t.0))?,
				Dataset::new(Vec::new(), config, Mode::Eval, eval_transform.map(|t| t.1))?,
			)
		} else {
			Self::train_test_split(rest.records, valid_share, config, eval_transform, (Mode::Eval, Mode::Eval))?
		};
		debug!(train = train.len(), valid = valid.len(), test = test.len(), "split dataset");
		Ok((train, valid, test))
	}

	pub fn len(&self) -> usize {
		self.records.len()
	}

	pub fn is_empty(&self) -> bool {
		self.records.is_empty()
	}

	pub fn mode(&self) -> Mode {
		self.mode
	}

	pub fn records(&self) -> &[Record] {
		&self.records
	}

	pub fn config(&self) -> &Config {
		&self.config
	}

	/// Decodes one sample. The target is the label, or the row index in
	/// inference mode.
	pub fn get(&self, index: usize, rng: &mut StdRng) -> Result<(ndarray::Array3<f32>, usize)> {
		let record = self.records.get(index).ok_or_else(|| {
			Error::Dataset(format!("index {} out of range for {} records", index, self.records.len()))
		})?;
		let image = image::open(&record.path)?;
		let pixels = self.transform.apply(&image, rng);
		let target = match self.mode {
			Mode::Inference => index,
			// checked in `new`
			_ => record.label.unwrap_or_default(),
		};
		Ok((pixels, target))
	}

	/// Batches for one pass. Batch size comes from the config (`eval` for
	/// inference) and only train mode shuffles.
	pub fn data_loader(&self, epoch: u64) -> Result<DataLoader<'_>> {
		let batch_size = match self.mode {
			Mode::Train => self.config.batch_size.train,
			Mode::Eval | Mode::Inference => self.config.batch_size.eval,
		};
		DataLoader::new(self, batch_size, self.mode == Mode::Train, epoch)
	}
}

fn shuffled_split(mut records: Vec<Record>, first: usize) -> (Vec<Record>, Vec<Record>) {
	let mut rng = StdRng::seed_from_u64(SPLIT_SEED);
	records.shuffle(&mut rng);
	let rest = records.split_off(first.min(records.len()));
	(records, rest)
}

#[cfg(test)]
mod tests {
	use super::*;
	use std::collections::HashSet;
	use std::fs;
	use tempfile::tempdir;

	fn records(n: usize) -> Vec<Record> {
		(0..n)
			.map(|i| Record {
				path: PathBuf::from(format!("{}.png", i)),
				label: Some(i % 3),
			})
			.collect()
	}

	#[test]
	fn categories_are_sorted_and_indexed() {
		let dir = tempdir().unwrap();
		let csv = dir.path().join("train.csv");
		fs::write(&csv, "file,species\na.png,zebra\nb.png,cat\nc.png,zebra\n").unwrap();
		let (records, categories) = load_csv(&csv, dir.path()).unwrap();
		assert_eq!(categories, vec!["cat", "zebra"]);
		assert_eq!(records.iter().map(|r| r.label).collect::<Vec<_>>(), vec![Some(1), Some(0), Some(1)]);
		assert_eq!(records[1].path, dir.path().join("b.png"));

		let test_csv = dir.path().join("test.csv");
		fs::write(&test_csv, "file\nx.png\ny.png\n").unwrap();
		let test = load_test_csv(&test_csv, dir.path()).unwrap();
		assert_eq!(test.len(), 2);
		assert!(test.iter().all(|r| r.label.is_none()));
	}

	#[test]
	fn categories_must_fit_the_output_layer() {
		let categories: Vec<String> = ["cat", "dog", "owl"].iter().map(|c| c.to_string()).collect();
		assert!(check_categories(&categories, 3).is_ok());
		assert!(check_categories(&categories, 15).is_ok());
		assert!(matches!(check_categories(&categories, 2), Err(Error::Dataset(_))));
	}

	#[test]
	fn split_sizes_follow_the_ratios() {
		let config = Config::default();
		let (train, valid, test) = Dataset::split(records(100), [0.7, 0.15], &config, None).unwrap();
		// 0.15 / (1 - 0.7) is just below one half, so floor(30 * share) is 14
		assert_eq!(train.len(), 70);
		assert_eq!(valid.len(), 14);
		assert_eq!(test.len(), 16);
		assert_eq!((train.mode(), valid.mode(), test.mode()), (Mode::Train, Mode::Eval, Mode::Eval));

		let all: HashSet<PathBuf> = [&train, &valid, &test]
			.iter()
			.flat_map(|d| d.records().iter().map(|r| r.path.clone()))
			.collect();
		assert_eq!(all.len(), 100);
	}

	#[test]
	fn split_is_deterministic() {
		let config = Config::default();
		let (a, _) = Dataset::train_test_split(records(50), 0.5, &config, None, (Mode::Train, Mode::Eval)).unwrap();
		let (b, _) = Dataset::train_test_split(records(50), 0.5, &config, None, (Mode::Train, Mode::Eval)).unwrap();
		assert_eq!(a.records(), b.records());
		assert_ne!(a.records(), &records(50)[..25]);
	}

	#[test]
	fn full_split_leaves_an_empty_test_set() {
		let config = Config::default();
		let (train, valid, test) = Dataset::split(records(10), [0.5, 0.5], &config, None).unwrap();
		assert_eq!((train.len(), valid.len(), test.len()), (5, 5, 0));
	}

	#[test]
	fn bad_ratios_are_rejected() {
		let config = Config::default();
		assert!(Dataset::split(records(10), [0.7, 0.5], &config, None).is_err());
		assert!(Dataset::train_test_split(records(10), 1.0, &config, None, (Mode::Train, Mode::Eval)).is_err());
	}

	#[test]
	fn labelled_modes_need_labels() {
		let config = Config::default();
		let unlabelled = vec![Record {
			path: PathBuf::from("x.png"),
			label: None,
		}];
		assert!(Dataset::new(unlabelled.clone(), &config, Mode::Eval, None).is_err());
		assert!(Dataset::new(unlabelled, &config, Mode::Inference, None).is_ok());
	}
}
