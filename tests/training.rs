use std::fs;
use std::path::Path;

use image::{Rgb, RgbImage};
use tempfile::{tempdir, TempDir};

use imgclf::checkpoint::{CheckpointMeta, BEST_DIR};
use imgclf::config::BatchSize;
use imgclf::dataset::{check_categories, load_csv, load_test_csv, Dataset, Mode, Transform};
use imgclf::models::{Classifier, FatLeNet5, NfNet, NfnetArch};
use imgclf::vae;
use imgclf::{Config, Error, ModelUtils};

/// Writes `n` labelled images alternating between a red and a blue class,
/// plus an unlabelled test set, in the layout the binary expects.
fn colour_dataset(n: usize) -> TempDir {
	palette_dataset(n, &[("red", [220, 20, 20]), ("blue", [20, 20, 220])])
}

fn palette_dataset(n: usize, classes: &[(&str, [u8; 3])]) -> TempDir {
	let dir = tempdir().unwrap();
	let train = dir.path().join("train_dataset");
	let test = dir.path().join("test_dataset");
	fs::create_dir_all(&train).unwrap();
	fs::create_dir_all(&test).unwrap();

	let mut train_csv = String::from("file,category\n");
	for i in 0..n {
		let (name, colour) = classes[i % classes.len()];
		let file = format!("{:03}.png", i);
		RgbImage::from_pixel(20, 20, Rgb(colour)).save(train.join(&file)).unwrap();
		train_csv.push_str(&format!("{},{}\n", file, name));
	}
	fs::write(dir.path().join("train.csv"), train_csv).unwrap();

	let mut test_csv = String::from("file\n");
	for i in 0..5 {
		let file = format!("t{}.png", i);
		RgbImage::from_pixel(20, 20, Rgb([200, 30, (i * 40) as u8])).save(test.join(&file)).unwrap();
		test_csv.push_str(&format!("{}\n", file));
	}
	fs::write(dir.path().join("test.csv"), test_csv).unwrap();
	dir
}

fn small_config(checkpoints: &Path) -> Config {
	Config {
		batch_size: BatchSize { train: 4, eval: 4 },
		num_workers: 2,
		image_size: 16,
		num_class: 2,
		early_stopping_threshold: 0,
		epochs_per_checkpoint: 1,
		checkpoint_root: checkpoints.to_path_buf(),
		..Config::default()
	}
}

fn splits(data: &Path, config: &Config) -> (Dataset, Dataset, Dataset) {
	let (records, _) = load_csv(data.join("train.csv"), data.join("train_dataset")).unwrap();
	let size = config.image_size;
	Dataset::split(records, [0.7, 0.15], config, Some((Transform::train(size), Transform::eval(size)))).unwrap()
}

#[test]
fn train_resume_and_predict() {
	let data = colour_dataset(20);
	let checkpoints = tempdir().unwrap();
	let config = small_config(checkpoints.path());
	let (train, valid, test) = splits(data.path(), &config);
	assert!(!valid.is_empty());

	let mut utils = ModelUtils::start_new_training(Box::new(FatLeNet5::new(&config).unwrap()), &config).unwrap();
	assert_eq!(utils.train(2, &train, &valid, &test).unwrap().len(), 2);
	let root = utils.root().to_path_buf();
	assert!(root.starts_with(checkpoints.path().join("FatLeNet5")));
	for dir in ["epoch_0001", "epoch_0002", BEST_DIR] {
		assert!(root.join(dir).join("model.safetensors").is_file(), "{} missing", dir);
	}
	assert!(root.join("history.csv").is_file());
	let meta: CheckpointMeta =
		serde_json::from_str(&fs::read_to_string(root.join("epoch_0002").join("checkpoint.json")).unwrap()).unwrap();
	assert_eq!(meta.epoch, 2);
	assert!(meta.scaler.is_none());

	let mut resumed = ModelUtils::load_last_checkpoint(Box::new(FatLeNet5::new(&config).unwrap()), &config).unwrap();
	assert_eq!(resumed.epoch(), 2);
	assert_eq!(resumed.root(), root.as_path());
	assert_eq!(resumed.history().len(), 2);
	assert_eq!(resumed.train(3, &train, &valid, &test).unwrap().len(), 3);
	assert!(root.join("epoch_0003").is_dir());

	let (_, categories) = load_csv(data.path().join("train.csv"), data.path().join("train_dataset")).unwrap();
	assert_eq!(categories, vec!["blue", "red"]);
	let records = load_test_csv(data.path().join("test.csv"), data.path().join("test_dataset")).unwrap();
	let dataset = Dataset::new(records, &config, Mode::Inference, None).unwrap();
	let predictions = resumed.inference(&dataset, Some(&categories), true).unwrap();
	assert_eq!(predictions.len(), 5);
	assert!(predictions.labels.iter().all(|l| categories.contains(l)));
	let confidence = predictions.confidence.as_ref().unwrap();
	assert!(confidence.iter().all(|&p| p >= 0.5 && p <= 1.0));

	let out = data.path().join("predictions.csv");
	predictions.write_csv(&out, dataset.records()).unwrap();
	let written = fs::read_to_string(&out).unwrap();
	assert!(written.starts_with("img,label,confidence\nt0.png,"));
	assert_eq!(written.lines().count(), 6);
}

#[test]
fn inference_needs_an_inference_dataset() {
	let data = colour_dataset(10);
	let checkpoints = tempdir().unwrap();
	let config = small_config(checkpoints.path());
	let (_, valid, _) = splits(data.path(), &config);
	let utils = ModelUtils::start_new_training(Box::new(FatLeNet5::new(&config).unwrap()), &config).unwrap();
	assert!(utils.inference(&valid, None, false).is_err());
}

fn tiny_nfnet(config: &Config) -> NfNet {
	let arch = NfnetArch {
		stem: [4, 4, 8, 8],
		widths: vec![16, 32],
		depths: vec![1, 1],
		group_size: 4,
		drop_rate: 0.2,
	};
	NfNet::with_arch(config, arch, "NFNet-tiny".to_string()).unwrap()
}

#[test]
fn nfnet_trains_through_the_grad_scaler() {
	let data = colour_dataset(12);
	let checkpoints = tempdir().unwrap();
	let config = Config {
		learning_rate: 0.01,
		..small_config(checkpoints.path())
	};
	let model = tiny_nfnet(&config);
	assert!(model.uses_grad_scaler());
	let (train, valid, test) = splits(data.path(), &config);

	let mut utils = ModelUtils::start_new_training(Box::new(model), &config).unwrap();
	let history = utils.train(1, &train, &valid, &test).unwrap();
	assert!(history.records()[0].train_loss.is_finite());
	// one clean scaled step per batch
	assert_eq!(utils.scaler().unwrap().state().growth_tracker, 2);

	let meta: CheckpointMeta = serde_json::from_str(
		&fs::read_to_string(utils.root().join("epoch_0001").join("checkpoint.json")).unwrap(),
	)
	.unwrap();
	assert!(meta.scaler.is_some());
}

#[test]
fn vae_images_can_come_from_a_dataset() {
	let data = colour_dataset(4);
	let records = load_test_csv(data.path().join("test.csv"), data.path().join("test_dataset")).unwrap();
	let config = Config {
		image_size: 28,
		num_workers: 1,
		..Config::default()
	};
	let dataset = Dataset::new(records, &config, Mode::Inference, Some(Transform::eval(28))).unwrap();
	let grey = vae::images_from_dataset(&dataset, 1).unwrap();
	assert_eq!(grey.shape(), &[5, 1, 28, 28]);
	assert!(grey.iter().all(|&v| (0.0..=1.0).contains(&v)));
}

#[test]
fn overfit_trains_on_the_first_batch_only() {
	let data = colour_dataset(12);
	let checkpoints = tempdir().unwrap();
	let mut config = Config {
		learning_rate: 0.01,
		..small_config(checkpoints.path())
	};
	config.nfnet.overfit = true;
	let (train, valid, test) = splits(data.path(), &config);
	assert!(train.len() > config.batch_size.train);

	let mut utils = ModelUtils::start_new_training(Box::new(tiny_nfnet(&config)), &config).unwrap();
	utils.train(2, &train, &valid, &test).unwrap();
	// one step per epoch instead of one per batch
	assert_eq!(utils.scaler().unwrap().state().growth_tracker, 2);
}

#[test]
fn labels_beyond_the_output_layer_are_an_error() {
	let data = palette_dataset(
		16,
		&[("red", [220, 20, 20]), ("green", [20, 220, 20]), ("blue", [20, 20, 220]), ("grey", [128, 128, 128])],
	);
	let checkpoints = tempdir().unwrap();
	let config = small_config(checkpoints.path());
	let (_, categories) = load_csv(data.path().join("train.csv"), data.path().join("train_dataset")).unwrap();
	assert!(matches!(check_categories(&categories, config.num_class), Err(Error::Dataset(_))));

	let (train, valid, test) = splits(data.path(), &config);
	let mut utils = ModelUtils::start_new_training(Box::new(FatLeNet5::new(&config).unwrap()), &config).unwrap();
	assert!(matches!(utils.train(1, &train, &valid, &test), Err(Error::Dataset(_))));
	assert_eq!(utils.epoch(), 0);
}

#[test]
fn fewer_categories_than_outputs_train_and_predict() {
	let data = colour_dataset(10);
	let checkpoints = tempdir().unwrap();
	let config = Config {
		num_class: 3,
		..small_config(checkpoints.path())
	};
	let (train, valid, test) = splits(data.path(), &config);
	let mut utils = ModelUtils::start_new_training(Box::new(FatLeNet5::new(&config).unwrap()), &config).unwrap();
	utils.train(1, &train, &valid, &test).unwrap();

	let (_, categories) = load_csv(data.path().join("train.csv"), data.path().join("train_dataset")).unwrap();
	let records = load_test_csv(data.path().join("test.csv"), data.path().join("test_dataset")).unwrap();
	let dataset = Dataset::new(records, &config, Mode::Inference, None).unwrap();
	let predictions = utils.inference(&dataset, Some(&categories), false).unwrap();
	assert!(predictions
		.labels
		.iter()
		.all(|l| categories.contains(l) || l.as_str() == "2"));
}

#[test]
fn stops_after_threshold_epochs_without_improvement() {
	let data = colour_dataset(20);
	let checkpoints = tempdir().unwrap();
	// a zero step size leaves the validation loss unchanged after epoch one
	let config = Config {
		learning_rate: 0.0,
		early_stopping_threshold: 1,
		epochs_per_checkpoint: 5,
		..small_config(checkpoints.path())
	};
	let (train, valid, test) = splits(data.path(), &config);
	let mut utils = ModelUtils::start_new_training(Box::new(FatLeNet5::new(&config).unwrap()), &config).unwrap();
	assert_eq!(utils.train(6, &train, &valid, &test).unwrap().len(), 2);
	assert_eq!(utils.epoch(), 2);
	let root = utils.root();
	assert!(root.join("epoch_0002").join("checkpoint.json").is_file());
	assert!(!root.join("epoch_0001").exists());
	assert!(root.join(BEST_DIR).is_dir());
}

#[test]
fn nan_losses_do_not_abort_the_epoch() {
	let data = colour_dataset(12);
	let checkpoints = tempdir().unwrap();
	let config = small_config(checkpoints.path());
	let (train, valid, test) = splits(data.path(), &config);
	let mut utils = ModelUtils::start_new_training(Box::new(FatLeNet5::new(&config).unwrap()), &config).unwrap();
	let weight = utils.model().parameters()[0].1.clone();
	weight.update_value(|w| w.fill(f32::NAN));

	let record = utils.train(1, &train, &valid, &test).unwrap().records()[0].clone();
	assert!(record.train_loss.is_nan());
	assert!(record.valid_loss.is_nan());
	assert!((0.0..=1.0).contains(&record.train_acc));
	assert!((0.0..=1.0).contains(&record.valid_acc));
	assert!(!utils.root().join(BEST_DIR).exists());
	assert!(utils.root().join("epoch_0001").join("model.safetensors").is_file());
}
