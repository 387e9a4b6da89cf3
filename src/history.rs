use std::path::Path;

use serde::{Deserialize, Serialize};
use tracing::info;

use crate::error::Result;

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct EpochRecord {
	pub epoch: usize,
	pub train_loss: f32,
	pub train_acc: f32,
	pub valid_loss: f32,
	pub valid_acc: f32,
	pub seconds: f64,
}

/// Per-epoch metrics of one run, persisted as `history.csv`.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct History {
	records: Vec<EpochRecord>,
}
impl History {
	pub fn new() -> Self {
		Self::default()
	}

	pub fn push(&mut self, record: EpochRecord) {
		info!(
			epoch = record.epoch,
			"train loss {:.4} acc {:.2}% | valid loss {:.4} acc {:.2}% | {:.1}s",
			record.train_loss,
			record.train_acc * 100.0,
			record.valid_loss,
			record.valid_acc * 100.0,
			record.seconds
		);
		self.records.push(record);
	}

	pub fn records(&self) -> &[EpochRecord] {
		&self.records
	}

	pub fn len(&self) -> usize {
		self.records.len()
	}

	pub fn is_empty(&self) -> bool {
		self.records.is_empty()
	}

	/// Lowest validation loss so far, ignoring NaN epochs.
	pub fn best_valid_loss(&self) -> Option<f32> {
		self.records
			.iter()
			.map(|r| r.valid_loss)
			.filter(|l| !l.is_nan())
			.fold(None, |best, l| Some(best.map_or(l, |b: f32| b.min(l))))
	}

	/// Drops records after `epoch`, used when resuming from an older checkpoint.
	pub fn truncate(&mut self, epoch: usize) {
		self.records.retain(|r| r.epoch <= epoch);
	}

	/// Summary table, one row per epoch.
	pub fn table(&self) -> String {
		let mut out = String::new();
		out.push_str(" Epoch |  Train   | Train  |  Valid   | Valid  | Elapsed \n");
		out.push_str("       | Accuracy |  Loss  | Accuracy |  Loss  |   Time  \n");
		out.push_str("-------|----------|--------|----------|--------|---------\n");
		for r in &self.records {
			out.push_str(&format!(
				" {:>5} | {:>7.2}% | {:>6.3} | {:>7.2}% | {:>6.3} | {:>6.1}s\n",
				r.epoch,
				r.train_acc * 100.0,
				r.train_loss,
				r.valid_acc * 100.0,
				r.valid_loss,
				r.seconds
			));
		}
		out
	}

	pub fn save<P: AsRef<Path>>(&self, path: P) -> Result<()> {
		let mut w = csv::Writer::from_path(path)?;
		for record in &self.records {
			w.serialize(record)?;
		}
		w.flush()?;
		Ok(())
	}

	pub fn load<P: AsRef<Path>>(path: P) -> Result<Self> {
		let mut r = csv::Reader::from_path(path)?;
		let records = r.deserialize().collect::<std::result::Result<Vec<EpochRecord>, _>>()?;
		Ok(Self { records })
	}
}
