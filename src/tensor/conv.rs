//! Convolution and pooling over `[batch, channels, height, width]` tensors.
//!
//! Convolutions are lowered to matrix products with `im2col`; the transposed
//! convolution is the adjoint of that lowering. Samples of a batch are
//! processed in parallel when the `rayon` feature is enabled.

use ndarray::{s, Array2, Array3, Array4, ArrayView2, ArrayView3, Axis, Ix4};
#[cfg(feature = "rayon")]
use rayon::prelude::*;

use super::{Array, Tensor};

/// Output length of a convolution along one spatial axis.
pub fn conv_output_size(input: usize, kernel: usize, stride: usize, padding: usize) -> usize {
	assert!(
		input + 2 * padding >= kernel,
		"kernel {} larger than padded input {}",
		kernel,
		input + 2 * padding
	);
	(input + 2 * padding - kernel) / stride + 1
}

/// Unfolds `x: [c, h, w]` into `[c * k * k, oh * ow]` patch columns.
pub fn im2col(x: ArrayView3<f32>, k: usize, stride: usize, padding: usize, oh: usize, ow: usize) -> Array2<f32> {
	let (c, h, w) = x.dim();
	let mut cols = Array2::zeros((c * k * k, oh * ow));
	for ci in 0..c {
		for ki in 0..k {
			for kj in 0..k {
				let row = (ci * k + ki) * k + kj;
				for oy in 0..oh {
					let iy = (oy * stride + ki) as isize - padding as isize;
					if iy < 0 || iy >= h as isize {
						continue;
					}
					for ox in 0..ow {
						let ix = (ox * stride + kj) as isize - padding as isize;
						if ix < 0 || ix >= w as isize {
							continue;
						}
						cols[[row, oy * ow + ox]] = x[[ci, iy as usize, ix as usize]];
					}
				}
			}
		}
	}
	cols
}

/// Folds patch columns back into a `[c, h, w]` image, summing overlaps.
#[allow(clippy::too_many_arguments)]
pub fn col2im(
	cols: ArrayView2<f32>,
	c: usize,
	h: usize,
	w: usize,
	k: usize,
	stride: usize,
	padding: usize,
	oh: usize,
	ow: usize,
) -> Array3<f32> {
	let mut x = Array3::zeros((c, h, w));
	for ci in 0..c {
		for ki in 0..k {
			for kj in 0..k {
				let row = (ci * k + ki) * k + kj;
				for oy in 0..oh {
					let iy = (oy * stride + ki) as isize - padding as isize;
					if iy < 0 || iy >= h as isize {
						continue;
					}
					for ox in 0..ow {
						let ix = (ox * stride + kj) as isize - padding as isize;
						if ix < 0 || ix >= w as isize {
							continue;
						}
						x[[ci, iy as usize, ix as usize]] += cols[[row, oy * ow + ox]];
					}
				}
			}
		}
	}
	x
}

fn to_4d(a: &Array) -> Array4<f32> {
	a.view()
		.into_dimensionality::<Ix4>()
		.unwrap_or_else(|_| panic!("expected a 4-d array, got shape {:?}", a.shape()))
		.to_owned()
}

fn flat_rows(a: &Array, rows: usize) -> Array2<f32> {
	let cols = a.len() / rows.max(1);
	a.to_shape((rows, cols))
		.expect("row count divides the element count")
		.into_owned()
}

// Maps each sample index through `f`, in parallel when available.
fn per_sample<T, F>(n: usize, f: F) -> Vec<T>
where
	T: Send,
	F: Fn(usize) -> T + Sync + Send,
{
	#[cfg(feature = "rayon")]
	{
		(0..n).into_par_iter().map(f).collect()
	}
	#[cfg(not(feature = "rayon"))]
	{
		(0..n).map(f).collect()
	}
}

fn stack(samples: Vec<Array3<f32>>, shape: (usize, usize, usize, usize)) -> Array4<f32> {
	let mut out = Array4::zeros(shape);
	for (i, sample) in samples.into_iter().enumerate() {
		out.index_axis_mut(Axis(0), i).assign(&sample);
	}
	out
}

fn add_channel_bias(out: &mut Array4<f32>, bias: &Array) {
	for (c, &b) in bias.iter().enumerate() {
		out.slice_mut(s![.., c, .., ..]).mapv_inplace(|v| v + b);
	}
}

fn channel_sums(g: &Array4<f32>) -> Array {
	g.sum_axis(Axis(3)).sum_axis(Axis(2)).sum_axis(Axis(0)).into_dyn()
}

impl Tensor {
	/// 2-d cross-correlation with square kernels.
	///
	/// `self: [n, c, h, w]`, `weight: [o, c / groups, k, k]`, `bias: [o]`.
	pub fn conv2d(&self, weight: &Tensor, bias: Option<&Tensor>, stride: usize, padding: usize, groups: usize) -> Tensor {
		let x = to_4d(&self.value());
		let w = to_4d(&weight.value());
		let (n, c, h, wd) = x.dim();
		let (o, cpg, k, k2) = w.dim();
		assert_eq!(k, k2, "conv2d: only square kernels are supported");
		assert!(groups > 0 && c % groups == 0 && o % groups == 0, "conv2d: bad groups {}", groups);
		assert_eq!(cpg, c / groups, "conv2d: weight expects {} input channels per group, input has {}", cpg, c / groups);
		let opg = o / groups;
		let oh = conv_output_size(h, k, stride, padding);
		let ow = conv_output_size(wd, k, stride, padding);
		let rows = cpg * k * k;
		let w2 = flat_rows(&weight.value(), o);

		let outputs = per_sample(n, |i| {
			let cols = im2col(x.index_axis(Axis(0), i), k, stride, padding, oh, ow);
			let mut out = Array2::<f32>::zeros((o, oh * ow));
			for g in 0..groups {
				let wg = w2.slice(s![g * opg..(g + 1) * opg, ..]);
				let cg = cols.slice(s![g * rows..(g + 1) * rows, ..]);
				out.slice_mut(s![g * opg..(g + 1) * opg, ..]).assign(&wg.dot(&cg));
			}
			out.into_shape_with_order((o, oh, ow)).expect("o * oh * ow elements")
		});
		let mut out = stack(outputs, (n, o, oh, ow));

		let mut parents = vec![self.clone(), weight.clone()];
		if let Some(bias) = bias {
			add_channel_bias(&mut out, &bias.value());
			parents.push(bias.clone());
		}
		let has_bias = bias.is_some();
		let need_input_grad = self.requires_grad();

		Tensor::from_op(out.into_dyn(), parents, move |g| {
			let g = to_4d(g);
			let grads = per_sample(n, |i| {
				let cols = im2col(x.index_axis(Axis(0), i), k, stride, padding, oh, ow);
				let gi = g
					.index_axis(Axis(0), i)
					.to_shape((o, oh * ow))
					.expect("o * oh * ow elements")
					.into_owned();
				let mut dw = Array2::<f32>::zeros((o, rows));
				let mut dcols = Array2::<f32>::zeros((c * k * k, oh * ow));
				for grp in 0..groups {
					let gg = gi.slice(s![grp * opg..(grp + 1) * opg, ..]);
					let cg = cols.slice(s![grp * rows..(grp + 1) * rows, ..]);
					dw.slice_mut(s![grp * opg..(grp + 1) * opg, ..]).assign(&gg.dot(&cg.t()));
					if need_input_grad {
						let wg = w2.slice(s![grp * opg..(grp + 1) * opg, ..]);
						dcols
							.slice_mut(s![grp * rows..(grp + 1) * rows, ..])
							.assign(&wg.t().dot(&gg));
					}
				}
				let dx = if need_input_grad {
					Some(col2im(dcols.view(), c, h, wd, k, stride, padding, oh, ow))
				} else {
					None
				};
				(dx, dw)
			});

			let mut dw_total = Array2::<f32>::zeros((o, rows));
			let mut dxs = Vec::with_capacity(n);
			for (dx, dw) in grads {
				dw_total += &dw;
				if let Some(dx) = dx {
					dxs.push(dx);
				}
			}
			let gx = if need_input_grad {
				Some(stack(dxs, (n, c, h, wd)).into_dyn())
			} else {
				None
			};
			let gw = dw_total
				.into_shape_with_order((o, cpg, k, k))
				.expect("weight element count")
				.into_dyn();
			let mut out = vec![gx, Some(gw)];
			if has_bias {
				out.push(Some(channel_sums(&g)));
			}
			out
		})
	}

	/// Transposed convolution, the adjoint of `conv2d` with the same
	/// kernel, stride and padding.
	///
	/// `self: [n, cin, h, w]`, `weight: [cin, cout, k, k]`, `bias: [cout]`.
	pub fn conv_transpose2d(&self, weight: &Tensor, bias: Option<&Tensor>, stride: usize, padding: usize) -> Tensor {
		let x = to_4d(&self.value());
		let w = to_4d(&weight.value());
		let (n, cin, h, wd) = x.dim();
		let (wcin, cout, k, k2) = w.dim();
		assert_eq!(k, k2, "conv_transpose2d: only square kernels are supported");
		assert_eq!(wcin, cin, "conv_transpose2d: weight expects {} input channels, input has {}", wcin, cin);
		let oh = (h - 1) * stride + k - 2 * padding;
		let ow = (wd - 1) * stride + k - 2 * padding;
		let w2 = flat_rows(&weight.value(), cin);

		let outputs = per_sample(n, |i| {
			let xi = x
				.index_axis(Axis(0), i)
				.to_shape((cin, h * wd))
				.expect("cin * h * w elements")
				.into_owned();
			let cols = w2.t().dot(&xi);
			col2im(cols.view(), cout, oh, ow, k, stride, padding, h, wd)
		});
		let mut out = stack(outputs, (n, cout, oh, ow));

		let mut parents = vec![self.clone(), weight.clone()];
		if let Some(bias) = bias {
			add_channel_bias(&mut out, &bias.value());
			parents.push(bias.clone());
		}
		let has_bias = bias.is_some();
		let need_input_grad = self.requires_grad();

		Tensor::from_op(out.into_dyn(), parents, move |g| {
			let g = to_4d(g);
			let grads = per_sample(n, |i| {
				let cols = im2col(g.index_axis(Axis(0), i), k, stride, padding, h, wd);
				let xi = x
					.index_axis(Axis(0), i)
					.to_shape((cin, h * wd))
					.expect("cin * h * w elements")
					.into_owned();
				let dw = xi.dot(&cols.t());
				let dx = if need_input_grad {
					Some(
						w2.dot(&cols)
							.into_shape_with_order((cin, h, wd))
							.expect("cin * h * w elements"),
					)
				} else {
					None
				};
				(dx, dw)
			});

			let mut dw_total = Array2::<f32>::zeros((cin, cout * k * k));
			let mut dxs = Vec::with_capacity(n);
			for (dx, dw) in grads {
				dw_total += &dw;
				if let Some(dx) = dx {
					dxs.push(dx);
				}
			}
			let gx = if need_input_grad {
				Some(stack(dxs, (n, cin, h, wd)).into_dyn())
			} else {
				None
			};
			let gw = dw_total
				.into_shape_with_order((cin, cout, k, k))
				.expect("weight element count")
				.into_dyn();
			let mut out = vec![gx, Some(gw)];
			if has_bias {
				out.push(Some(channel_sums(&g)));
			}
			out
		})
	}

	/// Max pooling without padding.
	pub fn max_pool2d(&self, kernel: usize, stride: usize) -> Tensor {
		let x = to_4d(&self.value());
		let (n, c, h, w) = x.dim();
		let oh = conv_output_size(h, kernel, stride, 0);
		let ow = conv_output_size(w, kernel, stride, 0);
		let mut out = Array4::<f32>::zeros((n, c, oh, ow));
		// flat (y * w + x) index of each window's maximum
		let mut argmax = Array4::<usize>::zeros((n, c, oh, ow));

		for ((b, ch, oy, ox), value) in out.indexed_iter_mut() {
			let mut best = f32::NEG_INFINITY;
			let mut best_idx = 0;
			for ky in 0..kernel {
				for kx in 0..kernel {
					let (iy, ix) = (oy * stride + ky, ox * stride + kx);
					let v = x[[b, ch, iy, ix]];
					if v > best || (ky == 0 && kx == 0) {
						best = v;
						best_idx = iy * w + ix;
					}
				}
			}
			*value = best;
			argmax[[b, ch, oy, ox]] = best_idx;
		}

		Tensor::from_op(out.into_dyn(), vec![self.clone()], move |g| {
			let g = to_4d(g);
			let mut grad = Array4::<f32>::zeros((n, c, h, w));
			for ((b, ch, oy, ox), &idx) in argmax.indexed_iter() {
				grad[[b, ch, idx / w, idx % w]] += g[[b, ch, oy, ox]];
			}
			vec![Some(grad.into_dyn())]
		})
	}
}

#[cfg(test)]
mod tests {
	use super::*;
	use approx::assert_relative_eq;
	use ndarray::IxDyn;

	fn ramp(shape: &[usize], scale: f32) -> Array {
		let len: usize = shape.iter().product();
		Array::from_shape_vec(IxDyn(shape), (0..len).map(|i| ((i * 7 % 11) as f32 - 5.0) * scale).collect())
			.unwrap()
	}

	#[test]
	fn conv2d_identity_kernel_copies_input() {
		let x = Tensor::new(ramp(&[1, 1, 4, 4], 1.0));
		let mut k = Array::zeros(IxDyn(&[1, 1, 3, 3]));
		k[[0, 0, 1, 1]] = 1.0;
		let y = x.conv2d(&Tensor::new(k), None, 1, 1, 1);
		assert_eq!(y.shape(), vec![1, 1, 4, 4]);
		assert_eq!(*y.value(), *x.value());
	}

	#[test]
	fn conv2d_output_shape_with_stride() {
		let x = Tensor::new(ramp(&[2, 3, 28, 28], 0.1));
		let w = Tensor::new(ramp(&[8, 3, 4, 4], 0.1));
		let y = x.conv2d(&w, None, 2, 1, 1);
		assert_eq!(y.shape(), vec![2, 8, 14, 14]);
	}

	#[test]
	fn conv_transpose_inverts_downsampling_shape() {
		let x = Tensor::new(ramp(&[2, 8, 7, 7], 0.1));
		let w = Tensor::new(ramp(&[8, 3, 4, 4], 0.1));
		let y = x.conv_transpose2d(&w, None, 2, 1);
		assert_eq!(y.shape(), vec![2, 3, 14, 14]);
	}

	#[test]
	fn conv_transpose_is_adjoint_of_conv() {
		// <conv(x), y> == <x, conv_t(y)>
		let x = ramp(&[1, 2, 5, 5], 0.1);
		let w = ramp(&[3, 2, 3, 3], 0.2);
		let y = ramp(&[1, 3, 3, 3], 0.3);
		let cx = Tensor::new(x.clone()).conv2d(&Tensor::new(w.clone()), None, 2, 1, 1);
		assert_eq!(cx.shape(), vec![1, 3, 3, 3]);
		let ty = Tensor::new(y.clone()).conv_transpose2d(&Tensor::new(w), None, 2, 1);
		assert_eq!(ty.shape(), vec![1, 2, 5, 5]);
		let lhs: f32 = cx.value().iter().zip(y.iter()).map(|(a, b)| a * b).sum();
		let rhs: f32 = x.iter().zip(ty.value().iter()).map(|(a, b)| a * b).sum();
		assert_relative_eq!(lhs, rhs, epsilon = 1e-4);
	}

	#[test]
	fn grouped_conv_gradients_match_finite_differences() {
		let x0 = ramp(&[2, 4, 5, 5], 0.1);
		let w0 = ramp(&[4, 2, 3, 3], 0.05);
		let x = Tensor::parameter(x0.clone());
		let w = Tensor::parameter(w0.clone());
		let b = Tensor::parameter(ramp(&[4], 0.1));
		x.conv2d(&w, Some(&b), 2, 1, 2).square().sum().backward();
		let gw = w.grad().unwrap();
		let gx = x.grad().unwrap();

		let loss = |x: &Array, w: &Array| {
			Tensor::new(x.clone())
				.conv2d(&Tensor::new(w.clone()), Some(&b.detach()), 2, 1, 2)
				.square()
				.sum()
				.item()
		};
		let h = 1e-2;
		for &i in &[0usize, 17, 40, 71] {
			let mut wp = w0.clone();
			let mut wm = w0.clone();
			wp.as_slice_mut().unwrap()[i] += h;
			wm.as_slice_mut().unwrap()[i] -= h;
			let numeric = (loss(&x0, &wp) - loss(&x0, &wm)) / (2.0 * h);
			assert_relative_eq!(gw.as_slice().unwrap()[i], numeric, epsilon = 1e-2, max_relative = 1e-2);
		}
		for &i in &[3usize, 60, 151] {
			let mut xp = x0.clone();
			let mut xm = x0.clone();
			xp.as_slice_mut().unwrap()[i] += h;
			xm.as_slice_mut().unwrap()[i] -= h;
			let numeric = (loss(&xp, &w0) - loss(&xm, &w0)) / (2.0 * h);
			assert_relative_eq!(gx.as_slice().unwrap()[i], numeric, epsilon = 1e-2, max_relative = 1e-2);
		}
	}

	#[test]
	fn max_pool_routes_gradient_to_maximum() {
		let x = Tensor::parameter(
			Array::from_shape_vec(IxDyn(&[1, 1, 2, 2]), vec![1.0, 4.0, 3.0, 2.0]).unwrap(),
		);
		let y = x.max_pool2d(2, 2);
		assert_relative_eq!(y.item(), 4.0);
		y.sum().backward();
		let g = x.grad().unwrap();
		assert_eq!(g.iter().cloned().collect::<Vec<_>>(), vec![0.0, 1.0, 0.0, 0.0]);
	}
}
