//! Dynamic loss scaling.
//!
//! The loss is multiplied by `scale` before backpropagation and gradients are
//! divided by it before the optimizer step. Steps whose gradients contain
//! inf or NaN are skipped and the scale backs off; after `growth_interval`
//! clean steps in a row it grows again.

use serde::{Deserialize, Serialize};

use super::Optimizer;
use crate::tensor::Tensor;

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct GradScalerState {
	pub scale: f32,
	pub growth_tracker: usize,
}

#[derive(Debug, Clone)]
pub struct GradScaler {
	scale: f32,
	growth_factor: f32,
	backoff_factor: f32,
	growth_interval: usize,
	growth_tracker: usize,
	found_inf: bool,
	unscaled: bool,
	enabled: bool,
}
impl Default for GradScaler {
	fn default() -> Self {
		Self::new()
	}
}
impl GradScaler {
	pub fn new() -> Self {
		Self {
			scale: 65536.0,
			growth_factor: 2.0,
			backoff_factor: 0.5,
			growth_interval: 2000,
			growth_tracker: 0,
			found_inf: false,
			unscaled: false,
			enabled: true,
		}
	}

	pub fn with_options(init_scale: f32, growth_factor: f32, backoff_factor: f32, growth_interval: usize) -> Self {
		Self {
			scale: init_scale,
			growth_factor,
			backoff_factor,
			growth_interval,
			..Self::new()
		}
	}

	pub fn enabled(mut self, enabled: bool) -> Self {
		self.enabled = enabled;
		self
	}

	pub fn is_enabled(&self) -> bool {
		self.enabled
	}

	pub fn scale(&self) -> f32 {
		if self.enabled {
			self.scale
		} else {
			1.0
		}
	}

	/// Backpropagates `loss` multiplied by the current scale.
	pub fn backward(&self, loss: &Tensor) {
		loss.backward_scaled(self.scale());
	}

	/// Divides every gradient by the scale and records whether any of them
	/// is not finite. Calling it twice before `update` is a no-op.
	pub fn unscale(&mut self, optimizer: &dyn Optimizer) -> bool {
		if !self.enabled || self.unscaled {
			return self.found_inf;
		}
		let inv = 1.0 / self.scale;
		let mut found_inf = false;
		for (_, param) in optimizer.parameters() {
			param.update_grad(|g| {
				g.mapv_inplace(|v| v * inv);
				found_inf |= g.iter().any(|v| !v.is_finite());
			});
		}
		self.found_inf = found_inf;
		self.unscaled = true;
		found_inf
	}

	/// Unscales if needed, then steps the optimizer unless an overflow was
	/// found. Returns whether the step was taken.
	pub fn step(&mut self, optimizer: &mut dyn Optimizer) -> bool {
		if !self.enabled {
			optimizer.step();
			return true;
		}
		if self.unscale(&*optimizer) {
			return false;
		}
		optimizer.step();
		true
	}

	/// Adjusts the scale for the next iteration.
	pub fn update(&mut self) {
		if !self.enabled {
			return;
		}
		if self.found_inf {
			self.scale = (self.scale * self.backoff_factor).max(1.0);
			self.growth_tracker = 0;
		} else {
			self.growth_tracker += 1;
			if self.growth_tracker >= self.growth_interval {
				self.scale *= self.growth_factor;
				self.growth_tracker = 0;
			}
		}
		self.found_inf = false;
		self.unscaled = false;
	}

	pub fn found_inf(&self) -> bool {
		self.found_inf
	}

	pub fn state(&self) -> GradScalerState {
		GradScalerState {
			scale: self.scale,
			growth_tracker: self.growth_tracker,
		}
	}

	pub fn load_state(&mut self, state: GradScalerState) {
		self.scale = state.scale;
		self.growth_tracker = state.growth_tracker;
	}
}

#[cfg(test)]
mod tests {
	use super::*;
	use crate::optim::Adam;
	use approx::assert_abs_diff_eq;
	use ndarray::arr1;

	#[test]
	fn scaled_backward_then_step_matches_unscaled_gradients() {
		let p = Tensor::parameter(arr1(&[2.0f32]).into_dyn());
		let mut adam = Adam::new(vec![("p".to_string(), p.clone())], 0.1);
		let mut scaler = GradScaler::new();
		scaler.backward(&p.square().sum());
		assert_abs_diff_eq!(p.grad().unwrap()[[0]], 4.0 * 65536.0);
		assert!(scaler.step(&mut adam));
		assert_abs_diff_eq!(p.grad().unwrap()[[0]], 4.0);
		scaler.update();
		assert_eq!(scaler.scale(), 65536.0);
	}

	#[test]
	fn overflow_skips_the_step_and_backs_off() {
		let p = Tensor::parameter(arr1(&[2.0f32]).into_dyn());
		p.set_grad(Some(arr1(&[f32::INFINITY]).into_dyn()));
		let mut adam = Adam::new(vec![("p".to_string(), p.clone())], 0.1);
		let mut scaler = GradScaler::new();
		assert!(!scaler.step(&mut adam));
		assert_eq!(p.value()[[0]], 2.0);
		assert_eq!(adam.steps(), 0);
		scaler.update();
		assert_eq!(scaler.scale(), 32768.0);
	}

	#[test]
	fn grows_after_interval() {
		let p = Tensor::parameter(arr1(&[1.0f32]).into_dyn());
		let mut adam = Adam::new(vec![("p".to_string(), p.clone())], 0.1);
		let mut scaler = GradScaler::with_options(8.0, 2.0, 0.5, 3);
		for _ in 0..3 {
			p.set_grad(Some(arr1(&[1.0f32]).into_dyn()));
			scaler.step(&mut adam);
			scaler.update();
		}
		assert_eq!(scaler.scale(), 16.0);
		assert_eq!(scaler.state().growth_tracker, 0);
	}

	#[test]
	fn disabled_scaler_is_transparent() {
		let scaler = GradScaler::new().enabled(false);
		assert_eq!(scaler.scale(), 1.0);
	}
}
