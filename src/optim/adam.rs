use ndarray::{IxDyn, Zip};

use super::Optimizer;
use crate::checkpoint::StateDict;
use crate::error::{Error, Result};
use crate::tensor::{Array, Tensor};

pub struct Adam {
	params: Vec<(String, Tensor)>,
	lr: f32,
	beta1: f32,
	beta2: f32,
	eps: f32,
	weight_decay: f32,
	/// Updates applied to each parameter, for bias correction.
	step: Vec<u64>,
	exp_avg: Vec<Option<Array>>,
	exp_avg_sq: Vec<Option<Array>>,
}
impl Adam {
	pub fn new(params: Vec<(String, Tensor)>, lr: f32) -> Self {
		let n = params.len();
		Self {
			params,
			lr,
			beta1: 0.9,
			beta2: 0.999,
			eps: 1e-8,
			weight_decay: 0.0,
			step: vec![0; n],
			exp_avg: vec![None; n],
			exp_avg_sq: vec![None; n],
		}
	}

	pub fn betas(mut self, beta1: f32, beta2: f32) -> Self {
		self.beta1 = beta1;
		self.beta2 = beta2;
		self
	}

	pub fn weight_decay(mut self, weight_decay: f32) -> Self {
		self.weight_decay = weight_decay;
		self
	}

	/// Updates applied to the most frequently updated parameter.
	pub fn steps(&self) -> u64 {
		self.step.iter().copied().max().unwrap_or(0)
	}
}
impl Optimizer for Adam {
	fn step(&mut self) {
		let (b1, b2, eps, lr, wd) = (self.beta1, self.beta2, self.eps, self.lr, self.weight_decay);

		for (i, (_, param)) in self.params.iter().enumerate() {
			let mut grad = match param.grad() {
				Some(grad) => grad,
				None => continue,
			};
			if wd != 0.0 {
				grad.scaled_add(wd, &*param.value());
			}
			self.step[i] += 1;
			let t = self.step[i] as i32;
			let bias1 = 1.0 - b1.powi(t);
			let bias2 = 1.0 - b2.powi(t);
			let m = self.exp_avg[i].get_or_insert_with(|| Array::zeros(grad.raw_dim()));
			Zip::from(&mut *m).and(&grad).for_each(|m, &g| *m = b1 * *m + (1.0 - b1) * g);
			let v = self.exp_avg_sq[i].get_or_insert_with(|| Array::zeros(grad.raw_dim()));
			Zip::from(&mut *v).and(&grad).for_each(|v, &g| *v = b2 * *v + (1.0 - b2) * g * g);

			let (m, v) = (&*m, &*v);
			param.update_value(|p| {
				Zip::from(p).and(m).and(v).for_each(|p, &m, &v| {
					*p -= lr * (m / bias1) / ((v / bias2).sqrt() + eps);
				});
			});
		}
	}

	fn learning_rate(&self) -> f32 {
		self.lr
	}

	fn set_learning_rate(&mut self, lr: f32) {
		self.lr = lr;
	}

	fn parameters(&self) -> Vec<(String, Tensor)> {
		self.params.clone()
	}

	fn state_dict(&self) -> StateDict {
		let mut state = StateDict::new();
		for (i, (name, _)) in self.params.iter().enumerate() {
			if self.step[i] > 0 {
				state.insert(format!("{}.step", name), Array::from_elem(IxDyn(&[]), self.step[i] as f32));
			}
			if let Some(m) = &self.exp_avg[i] {
				state.insert(format!("{}.exp_avg", name), m.clone());
			}
			if let Some(v) = &self.exp_avg_sq[i] {
				state.insert(format!("{}.exp_avg_sq", name), v.clone());
			}
		}
		state
	}

	fn load_state_dict(&mut self, state: &StateDict) -> Result<()> {
		for (i, (name, param)) in self.params.iter().enumerate() {
			let key = format!("{}.step", name);
			self.step[i] = match state.get(&key) {
				None => 0,
				Some(step) if step.ndim() == 0 => step.iter().next().copied().unwrap_or(0.0) as u64,
				Some(step) => {
					return Err(Error::ShapeMismatch {
						op: "load_state_dict",
						expected: Vec::new(),
						actual: step.shape().to_vec(),
					})
				}
			};
			self.exp_avg[i] = load_buffer(state, &format!("{}.exp_avg", name), param)?;
			self.exp_avg_sq[i] = load_buffer(state, &format!("{}.exp_avg_sq", name), param)?;
		}
		Ok(())
	}
}

/// A buffer may be absent (the parameter never had a gradient) but, when
/// present, must match the parameter's shape.
pub(super) fn load_buffer(state: &StateDict, key: &str, param: &Tensor) -> Result<Option<Array>> {
	match state.get(key) {
		None => Ok(None),
		Some(buffer) if buffer.shape() == param.shape().as_slice() => Ok(Some(buffer.clone())),
		Some(buffer) => Err(Error::ShapeMismatch {
			op: "load_state_dict",
			expected: param.shape(),
			actual: buffer.shape().to_vec(),
		}),
	}
}

#[cfg(test)]
mod tests {
	use super::*;
	use approx::assert_abs_diff_eq;
	use ndarray::arr1;

	#[test]
	fn first_step_moves_by_learning_rate() {
		let p = Tensor::parameter(arr1(&[1.0f32, -2.0]).into_dyn());
		p.set_grad(Some(arr1(&[0.5f32, -3.0]).into_dyn()));
		let mut adam = Adam::new(vec![("p".to_string(), p.clone())], 0.1);
		adam.step();
		// bias-corrected first step is lr * sign(g)
		assert_abs_diff_eq!(p.value()[[0]], 0.9, epsilon = 1e-5);
		assert_abs_diff_eq!(p.value()[[1]], -1.9, epsilon = 1e-5);
	}

	#[test]
	fn late_parameters_get_first_step_bias_correction() {
		let a = Tensor::parameter(arr1(&[0.0f32]).into_dyn());
		let b = Tensor::parameter(arr1(&[1.0f32]).into_dyn());
		let mut adam = Adam::new(vec![("a".to_string(), a.clone()), ("b".to_string(), b.clone())], 0.1);
		for _ in 0..3 {
			a.set_grad(Some(arr1(&[1.0f32]).into_dyn()));
			adam.step();
		}
		b.set_grad(Some(arr1(&[-4.0f32]).into_dyn()));
		adam.step();
		assert_abs_diff_eq!(b.value()[[0]], 1.1, epsilon = 1e-5);
		assert_eq!(adam.steps(), 4);
		assert_eq!(adam.state_dict()["b.step"].iter().next().copied(), Some(1.0));
	}

	#[test]
	fn minimises_a_quadratic() {
		let p = Tensor::parameter(arr1(&[3.0f32]).into_dyn());
		let mut adam = Adam::new(vec![("p".to_string(), p.clone())], 0.1);
		for _ in 0..300 {
			adam.zero_grad();
			p.square().sum().backward();
			adam.step();
		}
		assert!(p.value()[[0]].abs() < 0.05);
	}

	#[test]
	fn state_round_trips() {
		let p = Tensor::parameter(arr1(&[1.0f32, 2.0]).into_dyn());
		p.set_grad(Some(arr1(&[1.0f32, 1.0]).into_dyn()));
		let mut adam = Adam::new(vec![("w".to_string(), p.clone())], 0.01);
		adam.step();
		let state = adam.state_dict();
		assert!(state.contains_key("w.exp_avg"));

		let mut restored = Adam::new(vec![("w".to_string(), p)], 0.01);
		restored.load_state_dict(&state).unwrap();
		assert_eq!(restored.steps(), 1);
		assert_eq!(restored.state_dict(), state);
	}
}
