use image::imageops::{self, FilterType};
use image::{DynamicImage, RgbImage};
use ndarray::Array3;
use rand::{rngs::StdRng, Rng};

/// Image preprocessing: bicubic resize to a square, optional random
/// horizontal flip, then scaling to `[0, 1]` in CHW order.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Transform {
	pub size: u32,
	pub random_hflip: bool,
}
impl Transform {
	pub fn train(size: usize) -> Self {
		Self {
			size: size as u32,
			random_hflip: true,
		}
	}

	pub fn eval(size: usize) -> Self {
		Self {
			size: size as u32,
			random_hflip: false,
		}
	}

	pub fn apply(&self, image: &DynamicImage, rng: &mut StdRng) -> Array3<f32> {
		let rgb = image.to_rgb8();
		let mut resized = if rgb.dimensions() == (self.size, self.size) {
			rgb
		} else {
			imageops::resize(&rgb, self.size, self.size, FilterType::CatmullRom)
		};
		if self.random_hflip && rng.random_bool(0.5) {
			resized = imageops::flip_horizontal(&resized);
		}
		to_chw(&resized)
	}
}

pub fn to_chw(image: &RgbImage) -> Array3<f32> {
	let (w, h) = image.dimensions();
	Array3::from_shape_fn((3, h as usize, w as usize), |(c, y, x)| {
		image.get_pixel(x as u32, y as u32)[c] as f32 / 255.0
	})
}

#[cfg(test)]
mod tests {
	use super::*;
	use image::Rgb;
	use rand::SeedableRng;

	fn gradient(w: u32, h: u32) -> DynamicImage {
		DynamicImage::ImageRgb8(RgbImage::from_fn(w, h, |x, _| Rgb([(x * 255 / (w - 1)) as u8, 0, 255])))
	}

	#[test]
	fn eval_transform_resizes_without_flipping() {
		let t = Transform::eval(8);
		let out = t.apply(&gradient(20, 10), &mut StdRng::seed_from_u64(0));
		assert_eq!(out.dim(), (3, 8, 8));
		assert!(out[[0, 0, 0]] < out[[0, 0, 7]]);
		assert!(out.iter().all(|v| (0.0..=1.0).contains(v)));
		assert_eq!(out[[2, 4, 4]], 1.0);
	}

	#[test]
	fn train_transform_flips_some_images() {
		let t = Transform::train(8);
		let img = gradient(8, 8);
		let mut rng = StdRng::seed_from_u64(1);
		let flipped = (0..32)
			.map(|_| t.apply(&img, &mut rng))
			.filter(|out| out[[0, 0, 0]] > out[[0, 0, 7]])
			.count();
		assert!(flipped > 0 && flipped < 32);
	}
}
