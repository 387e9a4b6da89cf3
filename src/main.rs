use std::path::{Path, PathBuf};

use clap::{Parser, Subcommand, ValueEnum};
use tracing::info;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use imgclf::dataset::{check_categories, load_csv, load_test_csv, Dataset, Mode, Transform};
use imgclf::models::{Classifier, FakeVgg16, FatLeNet5, NfNet};
use imgclf::vae::{self, InputShape, VaeTrainer};
use imgclf::{Config, ModelUtils, Result};

const SPLIT_RATIO: [f64; 2] = [0.7, 0.15];

#[derive(Parser, Debug)]
#[command(author, version, about = "Train and run image classifiers and a variational autoencoder", long_about = None)]
struct Args {
	/// JSON file overriding the default configuration
	#[arg(short, long, global = true)]
	config: Option<PathBuf>,

	#[command(subcommand)]
	command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
	/// Start a new training run
	Train {
		#[command(flatten)]
		data: DataArgs,
		#[arg(long, value_enum, default_value_t = ModelChoice::Lenet)]
		model: ModelChoice,
		#[arg(long, default_value_t = 30)]
		epochs: usize,
	},
	/// Resume training from a checkpoint directory
	TrainFrom {
		#[command(flatten)]
		data: DataArgs,
		#[arg(long, value_enum, default_value_t = ModelChoice::Lenet)]
		model: ModelChoice,
		#[arg(long, default_value_t = 30)]
		epochs: usize,
		checkpoint: PathBuf,
	},
	/// Resume training from the latest checkpoint of the latest run
	Retrain {
		#[command(flatten)]
		data: DataArgs,
		#[arg(long, value_enum, default_value_t = ModelChoice::Lenet)]
		model: ModelChoice,
		#[arg(long, default_value_t = 30)]
		epochs: usize,
	},
	/// Predict test.csv with the latest checkpoint and write a CSV
	Inference {
		#[command(flatten)]
		data: DataArgs,
		#[arg(long, value_enum, default_value_t = ModelChoice::Lenet)]
		model: ModelChoice,
		#[arg(short, long, default_value = "predictions.csv")]
		output: PathBuf,
	},
	/// Train an NFNet, resuming the latest run if there is one
	TrainNfnet {
		#[command(flatten)]
		data: DataArgs,
		#[arg(long, default_value_t = 50)]
		epochs: usize,
		/// safetensors weights to start from; the output layer is resized
		#[arg(long)]
		pretrained: Option<PathBuf>,
	},
	/// Train the variational autoencoder
	TrainVae {
		/// Directory with the MNIST idx files
		#[arg(long, default_value = "data")]
		mnist: PathBuf,
		/// CSV of `file` names to train on instead of MNIST
		#[arg(long, requires = "images")]
		csv: Option<PathBuf>,
		/// Directory the CSV file names are relative to
		#[arg(long)]
		images: Option<PathBuf>,
		#[arg(long, default_value_t = 10)]
		epochs: usize,
		#[arg(long, default_value_t = 10_000)]
		train_len: usize,
		#[arg(long, default_value_t = 1_000)]
		test_len: usize,
		/// Where the trained weights are written
		#[arg(long, default_value = "vae.safetensors")]
		save: PathBuf,
	},
}

#[derive(clap::Args, Debug)]
struct DataArgs {
	/// Directory holding train.csv, test.csv, train_dataset/ and test_dataset/
	#[arg(long, default_value = "dataset")]
	dataset: PathBuf,
}
impl DataArgs {
	fn train_csv(&self) -> PathBuf {
		self.dataset.join("train.csv")
	}

	fn train_images(&self) -> PathBuf {
		self.dataset.join("train_dataset")
	}

	fn test_csv(&self) -> PathBuf {
		self.dataset.join("test.csv")
	}

	fn test_images(&self) -> PathBuf {
		self.dataset.join("test_dataset")
	}
}

#[derive(ValueEnum, Clone, Copy, Debug)]
enum ModelChoice {
	Lenet,
	Vgg,
}

fn main() {
	let args = Args::parse();

	tracing_subscriber::registry()
		.with(tracing_subscriber::EnvFilter::try_from_default_env().unwrap_or_else(|_| "info".into()))
		.with(tracing_subscriber::fmt::layer())
		.init();

	if let Err(e) = run(args) {
		tracing::error!("{}", e);
		std::process::exit(1);
	}
}

fn run(args: Args) -> Result<()> {
	let config = |base: Config| -> Result<Config> {
		match &args.config {
			Some(path) => base.merge_file(path),
			None => Ok(base),
		}
	};

	match &args.command {
		Command::Train { data, model, epochs } => with_model(*model, &config(Config::default())?, |m, c| {
			train(ModelUtils::start_new_training(m, c)?, c, data, *epochs)
		}),
		Command::TrainFrom {
			data,
			model,
			epochs,
			checkpoint,
		} => with_model(*model, &config(Config::default())?, |m, c| {
			train(ModelUtils::load_checkpoint(m, c, checkpoint)?, c, data, *epochs)
		}),
		Command::Retrain { data, model, epochs } => with_model(*model, &config(Config::default())?, |m, c| {
			train(ModelUtils::load_last_checkpoint(m, c)?, c, data, *epochs)
		}),
		Command::Inference { data, model, output } => {
			with_model(*model, &config(Config::default())?, |m, c| inference(m, c, data, output))
		}
		Command::TrainNfnet {
			data,
			epochs,
			pretrained,
		} => {
			let mut base = Config::nfnet();
			base.learning_rate = 0.001;
			base.batch_size.train = 16;
			base.batch_size.eval = 16;
			base.num_workers = 4;
			base.num_class = 10;
			let config = config(base)?;
			config.display();
			let utils = match pretrained {
				Some(path) => ModelUtils::start_new_training_from_pretrained(&config, path)?,
				None => ModelUtils::load_last_checkpoint(Box::new(NfNet::new(&config)?), &config)?,
			};
			train(utils, &config, data, *epochs)
		}
		Command::TrainVae {
			mnist,
			csv,
			images,
			epochs,
			train_len,
			test_len,
			save,
		} => {
			let config = config(Config::default())?;
			let (train_images, test_images) = match (csv, images) {
				(Some(csv), Some(root)) => {
					let shape = config.vae.input_shape;
					let data_config = Config {
						image_size: shape.side(),
						..config.clone()
					};
					let records = load_test_csv(csv, root)?;
					let dataset = Dataset::new(
						records,
						&data_config,
						Mode::Inference,
						Some(Transform::eval(shape.side())),
					)?;
					let all = vae::images_from_dataset(&dataset, shape.channels())?;
					let n = all.shape()[0];
					let split = n - n / 10;
					let train = all.slice_axis(ndarray::Axis(0), (0..split).into()).to_owned();
					let test = all.slice_axis(ndarray::Axis(0), (split..n).into()).to_owned();
					(train, test)
				}
				_ => {
					if config.vae.input_shape != InputShape::Mnist {
						return Err(imgclf::Error::Config(
							"CIFAR-shaped VAE training needs --csv and --images".to_string(),
						));
					}
					vae::load_mnist(mnist, *train_len, *test_len)?
				}
			};
			let mut trainer = VaeTrainer::new(&config)?;
			trainer.fit(*epochs, &train_images, &test_images)?;
			trainer.save(save)?;
			info!("saved weights to {}", save.display());
			let samples = trainer.generate(8, config.seed)?;
			println!("{}", vae::preview(&samples, 8));
			Ok(())
		}
	}
}

fn with_model<F>(choice: ModelChoice, config: &Config, f: F) -> Result<()>
where
	F: FnOnce(Box<dyn Classifier>, &Config) -> Result<()>,
{
	let model: Box<dyn Classifier> = match choice {
		ModelChoice::Lenet => Box::new(FatLeNet5::new(config)?),
		ModelChoice::Vgg => Box::new(FakeVgg16::new(config)?),
	};
	f(model, config)
}

fn splits(config: &Config, data: &DataArgs) -> Result<(Dataset, Dataset, Dataset)> {
	let (records, categories) = load_csv(data.train_csv(), data.train_images())?;
	info!(rows = records.len(), categories = categories.len(), "loaded {}", data.train_csv().display());
	check_categories(&categories, config.num_class)?;
	let size = config.image_size;
	Dataset::split(
		records,
		SPLIT_RATIO,
		config,
		Some((Transform::train(size), Transform::eval(size))),
	)
}

fn train(mut utils: ModelUtils, config: &Config, data: &DataArgs, epochs: usize) -> Result<()> {
	let (train, valid, test) = splits(config, data)?;
	utils.train(epochs, &train, &valid, &test)?;
	info!("history written to {}", utils.root().join("history.csv").display());
	Ok(())
}

fn inference(model: Box<dyn Classifier>, config: &Config, data: &DataArgs, output: &Path) -> Result<()> {
	let (_, categories) = load_csv(data.train_csv(), data.train_images())?;
	let records = load_test_csv(data.test_csv(), data.test_images())?;
	let size = config.image_size;
	let dataset = Dataset::new(records, config, Mode::Inference, Some(Transform::eval(size)))?;
	let utils = ModelUtils::load_last_checkpoint(model, config)?;
	let predictions = utils.inference(&dataset, Some(&categories), true)?;
	predictions.write_csv(output, dataset.records())?;
	info!(rows = predictions.len(), "predictions written to {}", output.display());
	Ok(())
}
