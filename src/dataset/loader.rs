#[cfg(feature = "rayon")]
use std::sync::Arc;

use ndarray::{Array3, Array4, Axis};
use rand::seq::SliceRandom;
use rand::{rngs::StdRng, SeedableRng};
#[cfg(feature = "rayon")]
use rayon::prelude::*;

use super::Dataset;
use crate::error::{Error, Result};
use crate::tensor::{Array, Tensor};

#[derive(Debug, Clone)]
pub struct Batch {
	/// `[batch, 3, size, size]`
	pub images: Array,
	pub targets: Vec<usize>,
}
impl Batch {
	pub fn len(&self) -> usize {
		self.targets.len()
	}

	pub fn is_empty(&self) -> bool {
		self.targets.is_empty()
	}

	pub fn input(&self) -> Tensor {
		Tensor::new(self.images.clone())
	}
}

#[cfg(feature = "rayon")]
pub(super) fn worker_pool(num_workers: usize) -> Result<Option<rayon::ThreadPool>> {
	if num_workers <= 1 {
		return Ok(None);
	}
	rayon::ThreadPoolBuilder::new()
		.num_threads(num_workers)
		.build()
		.map(Some)
		.map_err(|e| Error::Dataset(format!("cannot start {} loader workers: {}", num_workers, e)))
}

/// Iterates a dataset in batches, decoding the images of each batch on the
/// worker pool. Sample randomness (flips) is seeded per epoch and index, so
/// a pass is reproducible regardless of thread scheduling.
pub struct DataLoader<'a> {
	dataset: &'a Dataset,
	order: Vec<usize>,
	batch_size: usize,
	position: usize,
	seed: u64,
	#[cfg(feature = "rayon")]
	pool: Option<Arc<rayon::ThreadPool>>,
}
impl<'a> DataLoader<'a> {
	pub(super) fn new(dataset: &'a Dataset, batch_size: usize, shuffle: bool, epoch: u64) -> Result<Self> {
		if batch_size == 0 {
			return Err(Error::Config("batch size must be positive".to_string()));
		}
		let seed = dataset.config.seed ^ epoch.wrapping_mul(0x9E37_79B9_7F4A_7C15);
		let mut order: Vec<usize> = (0..dataset.len()).collect();
		if shuffle {
			order.shuffle(&mut StdRng::seed_from_u64(seed));
		}
		#[cfg(feature = "rayon")]
		let pool = match &dataset.pool {
			Some(pool) => Some(pool.clone()),
			None => worker_pool(dataset.config.num_workers)?.map(Arc::new),
		};
		Ok(Self {
			dataset,
			order,
			batch_size,
			position: 0,
			seed,
			#[cfg(feature = "rayon")]
			pool,
		})
	}

	pub fn num_batches(&self) -> usize {
		(self.order.len() + self.batch_size - 1) / self.batch_size
	}

	pub fn batch_size(&self) -> usize {
		self.batch_size
	}

	fn load_one(&self, index: usize) -> Result<(Array3<f32>, usize)> {
		let mut rng = StdRng::seed_from_u64(self.seed.wrapping_add(index as u64));
		self.dataset.get(index, &mut rng)
	}

	#[cfg(feature = "rayon")]
	fn decode(&self, indices: &[usize]) -> Vec<Result<(Array3<f32>, usize)>> {
		match &self.pool {
			Some(pool) => pool.install(|| indices.par_iter().map(|&i| self.load_one(i)).collect()),
			None => indices.iter().map(|&i| self.load_one(i)).collect(),
		}
	}

	#[cfg(not(feature = "rayon"))]
	fn decode(&self, indices: &[usize]) -> Vec<Result<(Array3<f32>, usize)>> {
		indices.iter().map(|&i| self.load_one(i)).collect()
	}

	fn load(&self, indices: &[usize]) -> Result<Batch> {
		let samples = self.decode(indices).into_iter().collect::<Result<Vec<_>>>()?;
		let (c, h, w) = samples[0].0.dim();
		let mut images = Array4::<f32>::zeros((samples.len(), c, h, w));
		let mut targets = Vec::with_capacity(samples.len());
		for (i, (pixels, target)) in samples.into_iter().enumerate() {
			images.index_axis_mut(Axis(0), i).assign(&pixels);
			targets.push(target);
		}
		Ok(Batch {
			images: images.into_dyn(),
			targets,
		})
	}
}
impl Iterator for DataLoader<'_> {
	type Item = Result<Batch>;

	fn next(&mut self) -> Option<Self::Item> {
		if self.position >= self.order.len() {
			return None;
		}
		let end = (self.position + self.batch_size).min(self.order.len());
		let indices = self.order[self.position..end].to_vec();
		self.position = end;
		Some(self.load(&indices))
	}
}
