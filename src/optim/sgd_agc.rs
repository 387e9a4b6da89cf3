//! SGD with momentum and adaptive gradient clipping (AGC).
//!
//! AGC rescales a gradient unit whenever its norm exceeds `clipping` times
//! the norm of the matching parameter unit. A unit is the whole tensor for
//! biases and gains and one output row or filter for weights.

use ndarray::{Axis, IxDyn, Zip};

use super::adam::load_buffer;
use super::Optimizer;
use crate::checkpoint::StateDict;
use crate::error::Result;
use crate::tensor::{Array, Tensor};

const PARAM_NORM_EPS: f32 = 1e-3;
const GRAD_NORM_EPS: f32 = 1e-6;

/// Settings for one named parameter.
#[derive(Debug, Clone)]
pub struct ParamGroup {
	pub name: String,
	pub param: Tensor,
	pub weight_decay: f32,
	/// `None` disables clipping for this parameter.
	pub clipping: Option<f32>,
}

pub struct SgdAgc {
	groups: Vec<ParamGroup>,
	lr: f32,
	momentum: f32,
	dampening: f32,
	nesterov: bool,
	momentum_buffers: Vec<Option<Array>>,
}
impl SgdAgc {
	/// One group per parameter, all starting with the same decay and clipping.
	pub fn new(
		named_params: Vec<(String, Tensor)>,
		lr: f32,
		momentum: f32,
		clipping: Option<f32>,
		weight_decay: f32,
		nesterov: bool,
	) -> Self {
		let groups: Vec<ParamGroup> = named_params
			.into_iter()
			.map(|(name, param)| ParamGroup {
				name,
				param,
				weight_decay,
				clipping,
			})
			.collect();
		let n = groups.len();
		Self {
			groups,
			lr,
			momentum,
			dampening: 0.0,
			nesterov,
			momentum_buffers: vec![None; n],
		}
	}

	pub fn groups(&self) -> &[ParamGroup] {
		&self.groups
	}

	pub fn groups_mut(&mut self) -> &mut [ParamGroup] {
		&mut self.groups
	}
}

/// Euclidean norm over every axis but the first, kept as broadcastable
/// size-1 axes; tensors of rank 0 or 1 form a single unit.
pub fn unitwise_norm(x: &Array) -> Array {
	if x.ndim() <= 1 {
		let norm = x.iter().map(|v| v * v).sum::<f32>().sqrt();
		return Array::from_elem(IxDyn(&[]), norm);
	}
	let mut shape = vec![1; x.ndim()];
	shape[0] = x.shape()[0];
	let norms: Vec<f32> = x
		.axis_iter(Axis(0))
		.map(|unit| unit.iter().map(|v| v * v).sum::<f32>().sqrt())
		.collect();
	Array::from_shape_vec(IxDyn(&shape), norms).expect("one norm per unit")
}

fn clip_gradient(grad: &Array, param: &Array, clipping: f32) -> Array {
	let param_norm = unitwise_norm(param).mapv(|v| v.max(PARAM_NORM_EPS));
	let grad_norm = unitwise_norm(grad);
	let factor = Zip::from(&param_norm).and(&grad_norm).map_collect(|&p, &g| {
		let max_norm = p * clipping;
		if g > max_norm {
			max_norm / g.max(GRAD_NORM_EPS)
		} else {
			1.0
		}
	});
	grad * &factor
}

impl Optimizer for SgdAgc {
	fn step(&mut self) {
		let (lr, momentum, dampening, nesterov) = (self.lr, self.momentum, self.dampening, self.nesterov);
		for (group, buffer) in self.groups.iter().zip(self.momentum_buffers.iter_mut()) {
			let grad = match group.param.grad() {
				Some(grad) => grad,
				None => continue,
			};
			let mut d_p = {
				let p = group.param.value();
				let mut d_p = match group.clipping {
					Some(clipping) => clip_gradient(&grad, &p, clipping),
					None => grad,
				};
				if group.weight_decay != 0.0 {
					d_p.scaled_add(group.weight_decay, &*p);
				}
				d_p
			};
			if momentum != 0.0 {
				let buf = match buffer.take() {
					Some(mut buf) => {
						buf.mapv_inplace(|v| v * momentum);
						buf.scaled_add(1.0 - dampening, &d_p);
						buf
					}
					None => d_p.clone(),
				};
				if nesterov {
					d_p.scaled_add(momentum, &buf);
				} else {
					d_p.assign(&buf);
				}
				*buffer = Some(buf);
			}
			group.param.update_value(|p| p.scaled_add(-lr, &d_p));
		}
	}

	fn learning_rate(&self) -> f32 {
		self.lr
	}

	fn set_learning_rate(&mut self, lr: f32) {
		self.lr = lr;
	}

	fn parameters(&self) -> Vec<(String, Tensor)> {
		self.groups.iter().map(|g| (g.name.clone(), g.param.clone())).collect()
	}

	fn state_dict(&self) -> StateDict {
		self.groups
			.iter()
			.zip(&self.momentum_buffers)
			.filter_map(|(group, buf)| {
				buf.as_ref()
					.map(|buf| (format!("{}.momentum_buffer", group.name), buf.clone()))
			})
			.collect()
	}

	fn load_state_dict(&mut self, state: &StateDict) -> Result<()> {
		for (group, buffer) in self.groups.iter().zip(self.momentum_buffers.iter_mut()) {
			*buffer = load_buffer(state, &format!("{}.momentum_buffer", group.name), &group.param)?;
		}
		Ok(())
	}
}
