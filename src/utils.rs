use indicatif::{ProgressBar, ProgressStyle};
use make_it_braille::BrailleImg;
use ndarray::{Array2, IxDyn};
use rand::{rngs::StdRng, Rng};
use rand_distr::StandardNormal;

use crate::tensor::Array;

#[derive(Clone, Copy)]
pub struct WeightInitializer {
	_f: fn(rng: &mut StdRng, fan_in: usize, len: usize) -> Vec<f32>,
}
impl WeightInitializer {
	/// Sample each weight uniformly from `[-1/sqrt(fan_in), 1/sqrt(fan_in)]`,
	/// the default for linear and convolutional layers.  Biases use the
	/// same bound.
	pub const UNIFORM: WeightInitializer = WeightInitializer {
		_f: |rng, fan_in, len| {
			let bound = 1.0 / (fan_in.max(1) as f32).sqrt();
			(0..len).map(|_| rng.random_range(-bound..=bound)).collect()
		},
	};

	/// Initialize each weight using a Gaussian distribution with mean 0
	/// and standard deviation 1 over the square root of the number of
	/// weights connecting to the same neuron.
	pub const STANDARD_NORMAL_SQRT: WeightInitializer = WeightInitializer {
		_f: |rng, fan_in, len| {
			let std = 1.0 / (fan_in.max(1) as f32).sqrt();
			(0..len).map(|_| rng.sample::<f32, _>(StandardNormal) * std).collect()
		},
	};

	/// He initialization: standard deviation `sqrt(2 / fan_in)`, for layers
	/// followed by a ReLU.
	pub const KAIMING_NORMAL: WeightInitializer = WeightInitializer {
		_f: |rng, fan_in, len| {
			let std = (2.0 / fan_in.max(1) as f32).sqrt();
			(0..len).map(|_| rng.sample::<f32, _>(StandardNormal) * std).collect()
		},
	};

	#[inline]
	pub fn f(&self, rng: &mut StdRng, fan_in: usize, len: usize) -> Vec<f32> {
		(self._f)(rng, fan_in, len)
	}

	pub fn array(&self, rng: &mut StdRng, fan_in: usize, shape: &[usize]) -> Array {
		let len = shape.iter().product();
		Array::from_shape_vec(IxDyn(shape), self.f(rng, fan_in, len))
			.expect("initializer yields one value per element")
	}
}
impl Default for WeightInitializer {
	fn default() -> Self {
		Self::UNIFORM
	}
}

/// Renders grayscale images (values in `[0, 1]`) side by side as braille,
/// with one caption line underneath.
pub fn braille_preview(images: &[Array2<f32>], captions: &[String]) -> String {
	let (height, width) = match images.first() {
		Some(img) => img.dim(),
		None => return String::new(),
	};
	let mut img = BrailleImg::new((width * images.len()) as u32, height as u32);
	let mut caption_line = String::new();
	images.iter().enumerate().for_each(|(i, pixels)| {
		draw_image(&mut img, pixels, (i * width) as u32, 0);
	});
	captions.iter().for_each(|caption| {
		// braille cells are two dots wide
		let cell = (width + 1) / 2;
		caption_line.push_str(&format!("{:<cell$}", caption, cell = cell));
	});
	format!("{}\n{}", img.as_str(false, true), caption_line)
}

fn draw_image(img: &mut BrailleImg, pixels: &Array2<f32>, x: u32, y: u32) {
	pixels.rows().into_iter().enumerate().for_each(|(y1, row)| {
		row.iter().enumerate().for_each(|(x1, val)| {
			img.set_dot(x + x1 as u32, y + y1 as u32, *val > 0.5)
				.expect("Error setting dot");
		});
	});
}

/// Batch progress for one pass over a dataset.
pub fn progress_bar(batches: usize, label: &str) -> ProgressBar {
	let bar = ProgressBar::new(batches as u64);
	let style = ProgressStyle::default_bar()
		.template("{msg:>12} [{elapsed_precise}] [{bar:30.cyan/blue}] {pos}/{len} ({eta})")
		.map(|style| style.progress_chars("=>-"))
		.unwrap_or_else(|_| ProgressStyle::default_bar());
	bar.set_style(style);
	bar.set_message(label.to_string());
	bar
}
