//! Layered block stores.
//!
//! The cache file is accessed through a stack of stores that all implement [`BlockStore`]:
//!
//! ```text
//! StateCheckBlockStore      open/closed guard, I/O failures while reading -> corruption
//!   FreeListBlockStore      reuses freed regions before growing the file
//!     CachingBlockStore     keeps decoded index and free-list blocks in memory
//!       FileBlockStore      positional reads/writes on the cache file
//! ```

pub mod cache;
pub mod file;
pub mod free_list;
pub mod state;

pub use cache::CachingBlockStore;
pub use file::FileBlockStore;
pub use free_list::{FreeListBlockStore, FreeSpace};
pub use state::StateCheckBlockStore;

use crate::block::{Block, BlockPointer, BlockType};
use crate::error::Result;

pub trait BlockStore {
	/// Opens the store. Returns `true` when the backing file was empty, in which case the
	/// caller is responsible for writing its initial blocks.
	fn open(&mut self) -> Result<bool>;

	/// Flushes and releases the backing file. The file is released even if the flush fails.
	fn close(&mut self) -> Result<()>;

	fn is_open(&self) -> bool;

	/// Discards every block, leaving an empty store.
	fn clear(&mut self) -> Result<()>;

	fn read(&mut self, pos: BlockPointer, block_type: BlockType) -> Result<Block>;

	/// Reads the first block visible at this layer.
	fn read_first(&mut self, block_type: BlockType) -> Result<Block>;

	/// Writes `block`, allocating space for it first if it has no position yet.
	fn write(&mut self, block: &mut Block) -> Result<()>;

	/// Releases the space held by `block`.
	fn remove(&mut self, block: &Block) -> Result<()>;

	fn flush(&mut self) -> Result<()>;
}

#[cfg(test)]
pub(crate) mod testing {
	use std::collections::HashMap;

	use super::BlockStore;
	use crate::block::{Block, BlockPointer, BlockType};
	use crate::error::{Error, Result};

	/// In-memory store that counts the calls reaching it.
	#[derive(Default)]
	pub(crate) struct MemoryBlockStore {
		pub blocks: HashMap<BlockPointer, Block>,
		pub end: u64,
		pub open: bool,
		pub reads: usize,
		pub writes: usize,
		pub removes: usize,
		pub flushes: usize,
	}

	impl BlockStore for MemoryBlockStore {
		fn open(&mut self) -> Result<bool> {
			self.open = true;
			Ok(self.blocks.is_empty())
		}

		fn close(&mut self) -> Result<()> {
			self.open = false;
			Ok(())
		}

		fn is_open(&self) -> bool {
			self.open
		}

		fn clear(&mut self) -> Result<()> {
			self.blocks.clear();
			self.end = 0;
			Ok(())
		}

		fn read(&mut self, pos: BlockPointer, block_type: BlockType) -> Result<Block> {
			self.reads += 1;
			match self.blocks.get(&pos) {
				Some(block) if block.block_type() == block_type => Ok(block.clone()),
				Some(block) => Err(Error::Corruption(format!(
					"expected {:?} at {} but found {:?}",
					block_type,
					pos,
					block.block_type()
				))),
				None => Err(Error::Corruption(format!("no block at {pos}"))),
			}
		}

		fn read_first(&mut self, block_type: BlockType) -> Result<Block> {
			self.read(BlockPointer::new(0), block_type)
		}

		fn write(&mut self, block: &mut Block) -> Result<()> {
			self.writes += 1;
			if block.pos().is_null() {
				let capacity = block.capacity().max(block.payload().encoded_len() as u32);
				block.assign(BlockPointer::new(self.end), capacity);
				self.end += block.total_size();
			}
			block.encode(false)?;
			self.blocks.insert(block.pos(), block.clone());
			Ok(())
		}

		fn remove(&mut self, block: &Block) -> Result<()> {
			self.removes += 1;
			self.blocks.remove(&block.pos());
			Ok(())
		}

		fn flush(&mut self) -> Result<()> {
			self.flushes += 1;
			Ok(())
		}
	}
}
