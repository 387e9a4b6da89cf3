use ndarray::{Axis, Ix2, IxDyn, Zip};

use super::{reduce_to_shape, reshaped, Array, Tensor};

const LOG_CLAMP: f32 = -100.0;
const BCE_EPS: f32 = 1e-12;

impl Tensor {
	pub fn add(&self, other: &Tensor) -> Tensor {
		let value = &*self.value() + &*other.value();
		let (sa, sb) = (self.shape(), other.shape());
		Tensor::from_op(value, vec![self.clone(), other.clone()], move |g| {
			vec![
				Some(reduce_to_shape(g.clone(), &sa)),
				Some(reduce_to_shape(g.clone(), &sb)),
			]
		})
	}

	pub fn sub(&self, other: &Tensor) -> Tensor {
		let value = &*self.value() - &*other.value();
		let (sa, sb) = (self.shape(), other.shape());
		Tensor::from_op(value, vec![self.clone(), other.clone()], move |g| {
			vec![
				Some(reduce_to_shape(g.clone(), &sa)),
				Some(reduce_to_shape(g.mapv(|v| -v), &sb)),
			]
		})
	}

	pub fn mul(&self, other: &Tensor) -> Tensor {
		let a = self.value().clone();
		let b = other.value().clone();
		let value = &a * &b;
		Tensor::from_op(value, vec![self.clone(), other.clone()], move |g| {
			vec![
				Some(reduce_to_shape(g * &b, a.shape())),
				Some(reduce_to_shape(g * &a, b.shape())),
			]
		})
	}

	pub fn div(&self, other: &Tensor) -> Tensor {
		let a = self.value().clone();
		let b = other.value().clone();
		let value = &a / &b;
		Tensor::from_op(value, vec![self.clone(), other.clone()], move |g| {
			let ga = g / &b;
			let gb = -(&(g * &a) / &b.mapv(|v| v * v));
			vec![
				Some(reduce_to_shape(ga, a.shape())),
				Some(reduce_to_shape(gb, b.shape())),
			]
		})
	}

	pub fn scale(&self, factor: f32) -> Tensor {
		let value = self.value().mapv(|v| v * factor);
		Tensor::from_op(value, vec![self.clone()], move |g| vec![Some(g.mapv(|v| v * factor))])
	}

	pub fn add_scalar(&self, c: f32) -> Tensor {
		let value = self.value().mapv(|v| v + c);
		Tensor::from_op(value, vec![self.clone()], |g| vec![Some(g.clone())])
	}

	pub fn neg(&self) -> Tensor {
		self.scale(-1.0)
	}

	/// Matrix product of two 2-D tensors.
	pub fn matmul(&self, other: &Tensor) -> Tensor {
		let a = to_2d(&self.value());
		let b = to_2d(&other.value());
		assert_eq!(a.ncols(), b.nrows(), "matmul: {:?} x {:?}", a.shape(), b.shape());
		let value = a.dot(&b).into_dyn();
		Tensor::from_op(value, vec![self.clone(), other.clone()], move |g| {
			let g = to_2d(g);
			vec![Some(g.dot(&b.t()).into_dyn()), Some(a.t().dot(&g).into_dyn())]
		})
	}

	/// `x @ weight^T + bias` for `x: [n, in]`, `weight: [out, in]`, `bias: [out]`.
	pub fn linear(&self, weight: &Tensor, bias: Option<&Tensor>) -> Tensor {
		let x = to_2d(&self.value());
		let w = to_2d(&weight.value());
		assert_eq!(
			x.ncols(),
			w.ncols(),
			"linear: input features {} do not match weight {:?}",
			x.ncols(),
			w.shape()
		);
		let mut out = x.dot(&w.t());
		let mut parents = vec![self.clone(), weight.clone()];
		if let Some(bias) = bias {
			let b = bias.value();
			assert_eq!(b.len(), w.nrows());
			out.rows_mut().into_iter().for_each(|mut row| {
				row.iter_mut().zip(b.iter()).for_each(|(o, b)| *o += b)
			});
			parents.push(bias.clone());
		}
		let has_bias = bias.is_some();
		let need_input_grad = self.requires_grad();
		Tensor::from_op(out.into_dyn(), parents, move |g| {
			let g = to_2d(g);
			let gx = if need_input_grad { Some(g.dot(&w).into_dyn()) } else { None };
			let gw = g.t().dot(&x).into_dyn();
			let mut grads = vec![gx, Some(gw)];
			if has_bias {
				grads.push(Some(g.sum_axis(Axis(0)).into_dyn()));
			}
			grads
		})
	}

	pub fn reshape(&self, shape: &[usize]) -> Tensor {
		let original = self.shape();
		let value = reshaped(&self.value(), shape);
		Tensor::from_op(value, vec![self.clone()], move |g| vec![Some(reshaped(g, &original))])
	}

	/// Collapses every axis after the first.
	pub fn flatten(&self) -> Tensor {
		let shape = self.shape();
		let batch = shape.first().copied().unwrap_or(1);
		let rest: usize = shape.iter().skip(1).product();
		self.reshape(&[batch, rest])
	}

	pub fn relu(&self) -> Tensor {
		let x = self.value().clone();
		let value = x.mapv(|v| v.max(0.0));
		Tensor::from_op(value, vec![self.clone()], move |g| {
			let mut grad = g.clone();
			Zip::from(&mut grad).and(&x).for_each(|g, &x| {
				if x <= 0.0 {
					*g = 0.0
				}
			});
			vec![Some(grad)]
		})
	}

	/// Exact (erf) GELU.
	pub fn gelu(&self) -> Tensor {
		let x = self.value().clone();
		let value = x.mapv(|v| v * normal_cdf(v));
		Tensor::from_op(value, vec![self.clone()], move |g| {
			let mut grad = g.clone();
			Zip::from(&mut grad).and(&x).for_each(|g, &x| {
				*g *= normal_cdf(x) + x * normal_pdf(x);
			});
			vec![Some(grad)]
		})
	}

	pub fn sigmoid(&self) -> Tensor {
		let value = self.value().mapv(sigmoid);
		let y = value.clone();
		Tensor::from_op(value, vec![self.clone()], move |g| {
			let mut grad = g.clone();
			Zip::from(&mut grad).and(&y).for_each(|g, &y| *g *= y * (1.0 - y));
			vec![Some(grad)]
		})
	}

	pub fn exp(&self) -> Tensor {
		let value = self.value().mapv(f32::exp);
		let y = value.clone();
		Tensor::from_op(value, vec![self.clone()], move |g| vec![Some(g * &y)])
	}

	pub fn log(&self) -> Tensor {
		let x = self.value().clone();
		let value = x.mapv(f32::ln);
		Tensor::from_op(value, vec![self.clone()], move |g| vec![Some(g / &x)])
	}

	pub fn sqrt(&self) -> Tensor {
		let value = self.value().mapv(f32::sqrt);
		let y = value.clone();
		Tensor::from_op(value, vec![self.clone()], move |g| {
			vec![Some(g / &y.mapv(|v| 2.0 * v))]
		})
	}

	pub fn square(&self) -> Tensor {
		let x = self.value().clone();
		let value = x.mapv(|v| v * v);
		Tensor::from_op(value, vec![self.clone()], move |g| vec![Some(g * &x.mapv(|v| 2.0 * v))])
	}

	/// Sum of every element as a 0-d tensor.
	pub fn sum(&self) -> Tensor {
		let shape = self.shape();
		let value = Array::from_elem(IxDyn(&[]), self.value().sum());
		Tensor::from_op(value, vec![self.clone()], move |g| {
			let g = g.iter().next().copied().unwrap_or(0.0);
			vec![Some(Array::from_elem(IxDyn(&shape), g))]
		})
	}

	pub fn mean(&self) -> Tensor {
		let n = self.len().max(1) as f32;
		self.sum().scale(1.0 / n)
	}

	/// Sums over `axes`, keeping them with size 1.
	pub fn sum_axes(&self, axes: &[usize]) -> Tensor {
		let shape = self.shape();
		let value = sum_keepdims(&self.value(), axes);
		Tensor::from_op(value, vec![self.clone()], move |g| {
			let grad = g
				.broadcast(IxDyn(&shape))
				.expect("kept axes broadcast back to the input shape")
				.to_owned();
			vec![Some(grad)]
		})
	}

	pub fn mean_axes(&self, axes: &[usize]) -> Tensor {
		let shape = self.shape();
		let count: usize = axes.iter().map(|&a| shape[a]).product();
		self.sum_axes(axes).scale(1.0 / count.max(1) as f32)
	}

	pub fn softmax(&self, axis: usize) -> Tensor {
		let y = softmax(&self.value(), axis);
		let out = y.clone();
		Tensor::from_op(out, vec![self.clone()], move |g| {
			let gy = g * &y;
			let s = sum_keepdims(&gy, &[axis]);
			vec![Some(&gy - &(&y * &s))]
		})
	}

	pub fn log_softmax(&self, axis: usize) -> Tensor {
		let x = self.value().clone();
		let y = softmax(&x, axis);
		let value = y.mapv(|v| v.max(f32::MIN_POSITIVE).ln());
		Tensor::from_op(value, vec![self.clone()], move |g| {
			let s = sum_keepdims(g, &[axis]);
			vec![Some(g - &(&y * &s))]
		})
	}

	/// Mean cross entropy of `[n, classes]` logits against class indices.
	pub fn cross_entropy(&self, targets: &[usize]) -> Tensor {
		let logits = to_2d(&self.value());
		let (n, classes) = logits.dim();
		assert_eq!(n, targets.len(), "cross_entropy: {} logits rows for {} targets", n, targets.len());
		let probs = to_2d(&softmax(&logits.clone().into_dyn(), 1));
		// logsumexp(row) - row[t]; NaN logits give a NaN loss
		let loss = targets
			.iter()
			.enumerate()
			.map(|(i, &t)| {
				assert!(t < classes, "target {} out of range for {} classes", t, classes);
				let row = logits.row(i);
				let max = row.fold(f32::NEG_INFINITY, |a, &b| a.max(b));
				max + row.mapv(|v| (v - max).exp()).sum().ln() - row[t]
			})
			.sum::<f32>()
			/ n.max(1) as f32;
		let targets = targets.to_vec();
		Tensor::from_op(Array::from_elem(IxDyn(&[]), loss), vec![self.clone()], move |g| {
			let g = g.iter().next().copied().unwrap_or(0.0) / n.max(1) as f32;
			let mut grad = probs.clone();
			targets.iter().enumerate().for_each(|(i, &t)| grad[[i, t]] -= 1.0);
			grad.mapv_inplace(|v| v * g);
			vec![Some(grad.into_dyn())]
		})
	}

	/// Summed binary cross entropy of probabilities `self` against `target`.
	/// Log terms are clamped at -100.
	pub fn binary_cross_entropy_sum(&self, target: &Array) -> Tensor {
		let p = self.value().clone();
		assert_eq!(p.shape(), target.shape(), "binary_cross_entropy: shape mismatch");
		let loss: f32 = Zip::from(&p)
			.and(target)
			.fold(0.0, |acc, &p, &t| {
				acc - (t * p.ln().max(LOG_CLAMP) + (1.0 - t) * (1.0 - p).ln().max(LOG_CLAMP))
			});
		let t = target.clone();
		Tensor::from_op(Array::from_elem(IxDyn(&[]), loss), vec![self.clone()], move |g| {
			let g = g.iter().next().copied().unwrap_or(0.0);
			let mut grad = p.clone();
			Zip::from(&mut grad).and(&t).for_each(|p, &t| {
				let x = *p;
				*p = g * (x - t) / ((1.0 - x) * x).max(BCE_EPS);
			});
			vec![Some(grad)]
		})
	}
}

pub(crate) fn to_2d(a: &Array) -> ndarray::Array2<f32> {
	a.view()
		.into_dimensionality::<Ix2>()
		.unwrap_or_else(|_| panic!("expected a 2-d array, got shape {:?}", a.shape()))
		.to_owned()
}

pub(crate) fn sum_keepdims(a: &Array, axes: &[usize]) -> Array {
	let mut out = a.clone();
	for &axis in axes {
		out = out.sum_axis(Axis(axis)).insert_axis(Axis(axis));
	}
	out
}

pub(crate) fn softmax(a: &Array, axis: usize) -> Array {
	let mut out = a.clone();
	for mut lane in out.lanes_mut(Axis(axis)) {
		let max = lane.iter().cloned().fold(f32::NEG_INFINITY, f32::max);
		lane.mapv_inplace(|v| (v - max).exp());
		let sum = lane.sum();
		lane.mapv_inplace(|v| v / sum);
	}
	out
}

pub fn sigmoid(x: f32) -> f32 {
	1.0 / (1.0 + (-x).exp())
}

fn normal_pdf(x: f32) -> f32 {
	(-0.5 * x * x).exp() / (2.0 * std::f32::consts::PI).sqrt()
}

fn normal_cdf(x: f32) -> f32 {
	0.5 * (1.0 + erf(x / std::f32::consts::SQRT_2))
}

// Abramowitz and Stegun 7.1.26
fn erf(x: f32) -> f32 {
	let sign = if x < 0.0 { -1.0 } else { 1.0 };
	let x = x.abs() as f64;
	let t = 1.0 / (1.0 + 0.327_591_1 * x);
	let y = 1.0
		- (((((1.061_405_429 * t - 1.453_152_027) * t) + 1.421_413_741) * t - 0.284_496_736) * t
			+ 0.254_829_592)
			* t * (-x * x).exp();
	sign * y as f32
}

#[cfg(test)]
mod tests {
	use super::*;
	use approx::assert_relative_eq;
	use ndarray::array;

	fn numeric_grad<F: Fn(&Tensor) -> Tensor>(f: F, x: &Array) -> Array {
		let h = 1e-3;
		let mut grad = x.clone();
		for i in 0..x.len() {
			let mut plus = x.clone();
			let mut minus = x.clone();
			plus.as_slice_mut().unwrap()[i] += h;
			minus.as_slice_mut().unwrap()[i] -= h;
			let fp = f(&Tensor::new(plus)).item();
			let fm = f(&Tensor::new(minus)).item();
			grad.as_slice_mut().unwrap()[i] = (fp - fm) / (2.0 * h);
		}
		grad
	}

	fn check<F: Fn(&Tensor) -> Tensor>(f: F, x: Array) {
		let t = Tensor::parameter(x.clone());
		f(&t).backward();
		let analytic = t.grad().unwrap();
		let numeric = numeric_grad(&f, &x);
		for (a, n) in analytic.iter().zip(numeric.iter()) {
			assert_relative_eq!(a, n, epsilon = 2e-2, max_relative = 2e-2);
		}
	}

	#[test]
	fn elementwise_gradients_match_finite_differences() {
		let x = array![[0.3f32, -0.7, 1.2], [0.5, 2.0, -1.5]].into_dyn();
		check(|t| t.gelu().sum(), x.clone());
		check(|t| t.sigmoid().square().sum(), x.clone());
		check(|t| t.exp().mean(), x.clone());
		check(|t| t.softmax(1).square().sum(), x.clone());
		check(|t| t.log_softmax(0).sum_axes(&[1]).square().sum(), x);
	}

	#[test]
	fn broadcasting_division_gradient() {
		let b = Tensor::new(array![[2.0f32], [4.0]].into_dyn());
		check(move |t| t.div(&b).sum(), array![[1.0f32, 2.0], [3.0, 4.0]].into_dyn());
	}

	#[test]
	fn matmul_gradients_match_finite_differences() {
		let b = Tensor::new(array![[1.0f32, -2.0], [0.5, 0.0], [3.0, 1.0]].into_dyn());
		check(move |t| t.matmul(&b).square().sum(), array![[0.2f32, -0.4, 1.0], [1.5, 0.3, -0.8]].into_dyn());
	}

	#[test]
	fn cross_entropy_keeps_nan_and_large_logits_apart() {
		let logits = Tensor::new(array![[1000.0f32, 0.0], [0.0, 1000.0]].into_dyn());
		assert_relative_eq!(logits.cross_entropy(&[0, 0]).item(), 500.0, epsilon = 1e-3);

		let logits = Tensor::new(array![[f32::NAN, 0.0], [0.0, 1.0]].into_dyn());
		assert!(logits.cross_entropy(&[1, 1]).item().is_nan());
	}

	#[test]
	fn linear_matches_manual_product() {
		let x = Tensor::new(array![[1.0f32, 2.0]].into_dyn());
		let w = Tensor::parameter(array![[1.0f32, 0.0], [0.5, -1.0], [2.0, 2.0]].into_dyn());
		let b = Tensor::parameter(array![0.1f32, 0.2, 0.3].into_dyn());
		let y = x.linear(&w, Some(&b));
		assert_eq!(y.shape(), vec![1, 3]);
		assert_relative_eq!(y.value()[[0, 0]], 1.1);
		assert_relative_eq!(y.value()[[0, 1]], -1.3);
		assert_relative_eq!(y.value()[[0, 2]], 6.3);
		y.sum().backward();
		assert_relative_eq!(b.grad().unwrap()[[2]], 1.0);
		assert_relative_eq!(w.grad().unwrap()[[1, 1]], 2.0);
	}

	#[test]
	fn cross_entropy_of_uniform_logits_is_log_classes() {
		let logits = Tensor::parameter(Array::zeros(IxDyn(&[2, 4])));
		let loss = logits.cross_entropy(&[0, 3]);
		assert_relative_eq!(loss.item(), 4.0f32.ln(), epsilon = 1e-6);
		loss.backward();
		let g = logits.grad().unwrap();
		assert_relative_eq!(g[[0, 0]], (0.25 - 1.0) / 2.0, epsilon = 1e-6);
		assert_relative_eq!(g[[1, 1]], 0.25 / 2.0, epsilon = 1e-6);
	}

	#[test]
	fn binary_cross_entropy_clamps_log() {
		let p = Tensor::new(array![0.0f32, 1.0].into_dyn());
		let loss = p.binary_cross_entropy_sum(&array![1.0f32, 1.0].into_dyn());
		assert_relative_eq!(loss.item(), 100.0);
	}

	#[test]
	fn erf_is_accurate() {
		assert_relative_eq!(erf(0.5), 0.520_499_9, epsilon = 1e-5);
		assert_relative_eq!(erf(-1.0), -0.842_700_8, epsilon = 1e-5);
	}
}
