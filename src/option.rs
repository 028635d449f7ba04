use std::path::PathBuf;

use crate::error::{Error, Result};

/// Name of the cache file created inside [`Options::dir`].
pub const DEFAULT_FILE_NAME: &str = "cache.bin";

/// Controls what `flush()` does at the end of every mutating operation.
#[derive(Copy, Clone, PartialEq, Eq, Debug, Default)]
pub enum Durability {
	/// Writes are handed to the OS and the file data is synced.
	#[default]
	Immediate,
	/// Writes are handed to the OS only. Survives a process crash but not a power loss.
	Eventual,
}

#[derive(Clone, PartialEq, Eq, Debug)]
pub struct Options {
	// Required options.
	pub dir: PathBuf, // Directory holding the cache file.

	// Usually modified options.
	pub file_name: String, // Name of the cache file inside `dir`.
	pub durability: Durability,

	// Fine tuning options.
	pub max_fanout: u16, // Maximum entries per index block before it splits.
	pub max_free_list_entries: u32, // Free regions tracked per free-list block.
	pub block_cache_capacity: u64, // Bytes of decoded index/free-list blocks kept in memory.
	pub create_dir_if_missing: bool, // Create `dir` if it doesn't exist.
}

impl Default for Options {
	/// Creates a new set of options with default values.
	fn default() -> Self {
		Self {
			dir: PathBuf::from(""),
			file_name: DEFAULT_FILE_NAME.to_string(),
			durability: Durability::Immediate,
			max_fanout: 512,
			max_free_list_entries: 512,
			block_cache_capacity: 16 * 1024 * 1024, // 16 MiB
			create_dir_if_missing: true,
		}
	}
}

impl Options {
	/// Creates a new set of options with default values.
	pub fn new() -> Self {
		Self::default()
	}

	pub fn with_dir(mut self, dir: impl Into<PathBuf>) -> Self {
		self.dir = dir.into();
		self
	}

	pub fn with_file_name(mut self, name: impl Into<String>) -> Self {
		self.file_name = name.into();
		self
	}

	pub fn with_max_fanout(mut self, max_fanout: u16) -> Self {
		self.max_fanout = max_fanout;
		self
	}

	pub fn with_max_free_list_entries(mut self, entries: u32) -> Self {
		self.max_free_list_entries = entries;
		self
	}

	pub fn with_block_cache_capacity(mut self, bytes: u64) -> Self {
		self.block_cache_capacity = bytes;
		self
	}

	pub fn with_durability(mut self, durability: Durability) -> Self {
		self.durability = durability;
		self
	}

	/// Full path of the cache file.
	pub fn file_path(&self) -> PathBuf {
		self.dir.join(&self.file_name)
	}

	pub fn validate(&self) -> Result<()> {
		if self.file_name.is_empty() {
			return Err(Error::InvalidArgument("file name must not be empty".into()));
		}
		if self.max_fanout < 2 {
			return Err(Error::InvalidArgument(format!(
				"max fan-out must be at least 2, got {}",
				self.max_fanout
			)));
		}
		if self.max_free_list_entries == 0 {
			return Err(Error::InvalidArgument(
				"max free list entries must be at least 1".into(),
			));
		}
		Ok(())
	}
}

#[cfg(test)]
mod tests {
	use super::*;

	#[test]
	fn default_options() {
		let options = Options::new().with_dir("/tmp/cache");
		assert_eq!(options.max_fanout, 512);
		assert_eq!(options.max_free_list_entries, 512);
		assert_eq!(options.file_path(), PathBuf::from("/tmp/cache/cache.bin"));
		assert!(options.validate().is_ok());
	}

	#[test]
	fn rejects_degenerate_fanout() {
		let options = Options::new().with_max_fanout(1);
		assert!(matches!(options.validate(), Err(Error::InvalidArgument(_))));

		let options = Options::new().with_max_free_list_entries(0);
		assert!(matches!(options.validate(), Err(Error::InvalidArgument(_))));
	}

	#[test]
	fn rejects_empty_file_name() {
		let options = Options::new().with_dir("/tmp/cache").with_file_name("");
		assert!(matches!(options.validate(), Err(Error::InvalidArgument(_))));
	}
}
