//! Reverse-mode automatic differentiation over `ndarray`.
//!
//! A `Tensor` is a node in a dynamically built graph. Operations on tensors
//! record a closure that maps the gradient of their output to gradients of
//! their inputs; `backward` walks the graph in reverse topological order and
//! accumulates gradients into every node that requires them. Trainable leaves
//! are created with `Tensor::parameter` and keep their gradient until
//! `zero_grad` is called.

mod conv;
mod ops;

use std::cell::{Cell, Ref, RefCell};
use std::collections::HashSet;
use std::fmt;
use std::rc::Rc;

use ndarray::{ArrayD, Axis, IxDyn};

pub use conv::{col2im, conv_output_size, im2col};

pub type Array = ArrayD<f32>;

type BackwardFn = Box<dyn Fn(&Array) -> Vec<Option<Array>>>;

thread_local! {
	static GRAD_ENABLED: Cell<bool> = const { Cell::new(true) };
}

pub fn is_grad_enabled() -> bool {
	GRAD_ENABLED.with(Cell::get)
}

/// Disables graph recording until dropped. Guards nest.
pub struct NoGradGuard {
	prev: bool,
}
impl NoGradGuard {
	pub fn new() -> Self {
		let prev = is_grad_enabled();
		GRAD_ENABLED.with(|g| g.set(false));
		Self { prev }
	}
}
impl Default for NoGradGuard {
	fn default() -> Self {
		Self::new()
	}
}
impl Drop for NoGradGuard {
	fn drop(&mut self) {
		GRAD_ENABLED.with(|g| g.set(self.prev));
	}
}

/// Runs `f` with graph recording disabled.
pub fn no_grad<F: FnOnce() -> R, R>(f: F) -> R {
	let _guard = NoGradGuard::new();
	f()
}

struct Node {
	value: RefCell<Array>,
	grad: RefCell<Option<Array>>,
	parents: Vec<Tensor>,
	backward: Option<BackwardFn>,
	requires_grad: bool,
}

#[derive(Clone)]
pub struct Tensor(Rc<Node>);

impl Tensor {
	/// A constant: never receives a gradient.
	pub fn new(value: Array) -> Self {
		Self::leaf(value, false)
	}

	/// A trainable leaf.
	pub fn parameter(value: Array) -> Self {
		Self::leaf(value, true)
	}

	pub fn zeros(shape: &[usize]) -> Self {
		Self::new(Array::zeros(IxDyn(shape)))
	}

	pub fn scalar(value: f32) -> Self {
		Self::new(Array::from_elem(IxDyn(&[]), value))
	}

	fn leaf(value: Array, requires_grad: bool) -> Self {
		Tensor(Rc::new(Node {
			value: RefCell::new(value),
			grad: RefCell::new(None),
			parents: Vec::new(),
			backward: None,
			requires_grad,
		}))
	}

	/// Records an operation. When recording is disabled or no input needs a
	/// gradient the result is a plain constant and `backward` is dropped.
	pub(crate) fn from_op<F>(value: Array, parents: Vec<Tensor>, backward: F) -> Self
	where
		F: Fn(&Array) -> Vec<Option<Array>> + 'static,
	{
		let requires_grad = is_grad_enabled() && parents.iter().any(Tensor::requires_grad);
		if !requires_grad {
			return Self::new(value);
		}
		Tensor(Rc::new(Node {
			value: RefCell::new(value),
			grad: RefCell::new(None),
			parents,
			backward: Some(Box::new(backward)),
			requires_grad: true,
		}))
	}

	pub fn value(&self) -> Ref<'_, Array> {
		self.0.value.borrow()
	}

	pub fn set_value(&self, value: Array) {
		*self.0.value.borrow_mut() = value;
	}

	/// In-place update of the stored value, used by optimizers.
	pub fn update_value<F: FnOnce(&mut Array)>(&self, f: F) {
		f(&mut self.0.value.borrow_mut());
	}

	pub fn shape(&self) -> Vec<usize> {
		self.0.value.borrow().shape().to_vec()
	}

	pub fn ndim(&self) -> usize {
		self.0.value.borrow().ndim()
	}

	pub fn len(&self) -> usize {
		self.0.value.borrow().len()
	}

	pub fn is_empty(&self) -> bool {
		self.len() == 0
	}

	pub fn requires_grad(&self) -> bool {
		self.0.requires_grad
	}

	pub fn is_leaf(&self) -> bool {
		self.0.backward.is_none()
	}

	pub fn grad(&self) -> Option<Array> {
		self.0.grad.borrow().clone()
	}

	pub fn set_grad(&self, grad: Option<Array>) {
		*self.0.grad.borrow_mut() = grad;
	}

	pub fn update_grad<F: FnOnce(&mut Array)>(&self, f: F) {
		if let Some(grad) = self.0.grad.borrow_mut().as_mut() {
			f(grad);
		}
	}

	pub fn zero_grad(&self) {
		*self.0.grad.borrow_mut() = None;
	}

	/// First element of the value; meant for scalar losses.
	pub fn item(&self) -> f32 {
		self.0.value.borrow().iter().next().copied().unwrap_or(f32::NAN)
	}

	/// A constant sharing no graph with `self`.
	pub fn detach(&self) -> Tensor {
		Tensor::new(self.value().clone())
	}

	pub fn ptr_eq(&self, other: &Tensor) -> bool {
		Rc::ptr_eq(&self.0, &other.0)
	}

	fn accumulate_grad(&self, grad: Array) {
		let mut slot = self.0.grad.borrow_mut();
		match slot.as_mut() {
			Some(existing) => *existing += &grad,
			None => *slot = Some(grad),
		}
	}

	pub fn backward(&self) {
		self.backward_scaled(1.0);
	}

	/// Backpropagates with the output gradient filled with `seed`.
	///
	/// Gradients of intermediate nodes are released once they have been
	/// propagated; leaves keep theirs.
	pub fn backward_scaled(&self, seed: f32) {
		if !self.requires_grad() {
			return;
		}
		let order = self.topological_order();
		self.accumulate_grad(Array::from_elem(IxDyn(&self.shape()), seed));

		for node in order.iter().rev() {
			let backward = match &node.0.backward {
				Some(backward) => backward,
				None => continue,
			};
			let grad = match node.0.grad.borrow_mut().take() {
				Some(grad) => grad,
				None => continue,
			};
			let parent_grads = backward(&grad);
			debug_assert_eq!(parent_grads.len(), node.0.parents.len());
			for (parent, g) in node.0.parents.iter().zip(parent_grads) {
				if let Some(g) = g {
					if parent.requires_grad() {
						parent.accumulate_grad(g);
					}
				}
			}
		}
	}

	// post-order over nodes that require a gradient: inputs precede outputs
	fn topological_order(&self) -> Vec<Tensor> {
		let mut order = Vec::new();
		let mut visited: HashSet<*const Node> = HashSet::new();
		let mut stack: Vec<(Tensor, bool)> = vec![(self.clone(), false)];

		while let Some((node, expanded)) = stack.pop() {
			if expanded {
				order.push(node);
				continue;
			}
			if !visited.insert(Rc::as_ptr(&node.0)) {
				continue;
			}
			stack.push((node.clone(), true));
			for parent in &node.0.parents {
				if parent.requires_grad() && !visited.contains(&Rc::as_ptr(&parent.0)) {
					stack.push((parent.clone(), false));
				}
			}
		}
		order
	}
}

impl fmt::Debug for Tensor {
	fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
		f.debug_struct("Tensor")
			.field("shape", &self.shape())
			.field("requires_grad", &self.requires_grad())
			.finish()
	}
}

impl From<Array> for Tensor {
	fn from(value: Array) -> Self {
		Tensor::new(value)
	}
}

/// Sums a broadcast gradient back down to `shape`.
pub(crate) fn reduce_to_shape(grad: Array, shape: &[usize]) -> Array {
	let mut g = grad;
	while g.ndim() > shape.len() {
		g = g.sum_axis(Axis(0));
	}
	for (axis, &dim) in shape.iter().enumerate() {
		if dim == 1 && g.shape()[axis] != 1 {
			g = g.sum_axis(Axis(axis)).insert_axis(Axis(axis));
		}
	}
	g
}

/// Reshapes a copy of `a`, panicking if the element counts differ.
pub(crate) fn reshaped(a: &Array, shape: &[usize]) -> Array {
	assert_eq!(
		a.len(),
		shape.iter().product::<usize>(),
		"cannot reshape {:?} into {:?}",
		a.shape(),
		shape
	);
	a.to_shape(IxDyn(shape))
		.expect("element count checked above")
		.into_owned()
}
