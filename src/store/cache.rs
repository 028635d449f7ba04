use quick_cache::{sync::Cache, Weighter};

use super::BlockStore;
use crate::block::{Block, BlockPointer, BlockType};
use crate::error::{Error, Result};

#[derive(Clone)]
struct BlockWeighter;

impl Weighter<BlockPointer, Block> for BlockWeighter {
	fn weight(&self, _key: &BlockPointer, block: &Block) -> u64 {
		block.total_size()
	}
}

/// Write-through cache of decoded blocks, keyed by position.
///
/// Only the configured block types are cached. Every write replaces the cached copy and every
/// remove evicts it, so a cached block never disagrees with the last write at its position.
pub struct CachingBlockStore<S> {
	inner: S,
	cache: Cache<BlockPointer, Block, BlockWeighter>,
	cacheable: Vec<BlockType>,
}

impl<S: BlockStore> CachingBlockStore<S> {
	pub fn new(inner: S, capacity_bytes: u64, cacheable: &[BlockType]) -> Self {
		let estimated_items = (capacity_bytes / 4096).max(16) as usize;
		Self {
			inner,
			cache: Cache::with_weighter(estimated_items, capacity_bytes, BlockWeighter),
			cacheable: cacheable.to_vec(),
		}
	}

	/// Number of blocks currently held in memory.
	pub fn cached_blocks(&self) -> usize {
		self.cache.len()
	}

	pub fn inner(&self) -> &S {
		&self.inner
	}

	fn is_cacheable(&self, block_type: BlockType) -> bool {
		self.cacheable.contains(&block_type)
	}
}

impl<S: BlockStore> BlockStore for CachingBlockStore<S> {
	fn open(&mut self) -> Result<bool> {
		self.cache.clear();
		self.inner.open()
	}

	fn close(&mut self) -> Result<()> {
		self.cache.clear();
		self.inner.close()
	}

	fn is_open(&self) -> bool {
		self.inner.is_open()
	}

	fn clear(&mut self) -> Result<()> {
		self.cache.clear();
		self.inner.clear()
	}

	fn read(&mut self, pos: BlockPointer, block_type: BlockType) -> Result<Block> {
		if !self.is_cacheable(block_type) {
			return self.inner.read(pos, block_type);
		}
		if let Some(block) = self.cache.get(&pos) {
			if block.block_type() != block_type {
				return Err(Error::corruption(format!(
					"expected {:?} block at {} but found {:?}",
					block_type,
					pos,
					block.block_type()
				)));
			}
			return Ok(block);
		}
		let block = self.inner.read(pos, block_type)?;
		self.cache.insert(pos, block.clone());
		Ok(block)
	}

	fn read_first(&mut self, block_type: BlockType) -> Result<Block> {
		let block = self.inner.read_first(block_type)?;
		if self.is_cacheable(block_type) {
			self.cache.insert(block.pos(), block.clone());
		}
		Ok(block)
	}

	fn write(&mut self, block: &mut Block) -> Result<()> {
		if let Err(e) = self.inner.write(block) {
			if !block.pos().is_null() {
				self.cache.remove(&block.pos());
			}
			return Err(e);
		}
		if self.is_cacheable(block.block_type()) {
			self.cache.insert(block.pos(), block.clone());
		} else {
			// a data block may have been written over a cached block that was freed
			self.cache.remove(&block.pos());
		}
		Ok(())
	}

	fn remove(&mut self, block: &Block) -> Result<()> {
		self.cache.remove(&block.pos());
		self.inner.remove(block)
	}

	fn flush(&mut self) -> Result<()> {
		self.inner.flush()
	}
}

#[cfg(test)]
mod tests {
	use super::*;
	use crate::block::{DataBlock, IndexBlock, IndexEntry, Payload};
	use crate::store::testing::MemoryBlockStore;

	fn store() -> CachingBlockStore<MemoryBlockStore> {
		let mut store = CachingBlockStore::new(
			MemoryBlockStore::default(),
			1024 * 1024,
			&[BlockType::Index, BlockType::FreeList],
		);
		store.open().unwrap();
		store
	}

	#[test]
	fn cacheable_blocks_are_served_from_memory() {
		let mut store = store();
		let mut block = Block::new(Payload::Index(IndexBlock::default()));
		store.write(&mut block).unwrap();

		for _ in 0..3 {
			store.read(block.pos(), BlockType::Index).unwrap();
		}
		assert_eq!(store.inner().reads, 0);
		assert_eq!(store.cached_blocks(), 1);
	}

	#[test]
	fn data_blocks_are_not_cached() {
		let mut store = store();
		let mut block = Block::new(Payload::Data(DataBlock::new(b"v".to_vec())));
		store.write(&mut block).unwrap();

		store.read(block.pos(), BlockType::Data).unwrap();
		store.read(block.pos(), BlockType::Data).unwrap();
		assert_eq!(store.inner().reads, 2);
		assert_eq!(store.cached_blocks(), 0);
	}

	#[test]
	fn writes_replace_cached_copy() {
		let mut store = store();
		let mut block = Block::with_capacity(Payload::Index(IndexBlock::default()), 256);
		store.write(&mut block).unwrap();

		if let Payload::Index(index) = block.payload_mut() {
			index.entries.push(IndexEntry::new(7, BlockPointer::new(99)));
		}
		store.write(&mut block).unwrap();

		let read = store.read(block.pos(), BlockType::Index).unwrap();
		assert_eq!(read.payload(), block.payload());
	}

	#[test]
	fn remove_evicts() {
		let mut store = store();
		let mut block = Block::new(Payload::Index(IndexBlock::default()));
		store.write(&mut block).unwrap();
		store.remove(&block).unwrap();
		assert_eq!(store.cached_blocks(), 0);
		assert!(store.read(block.pos(), BlockType::Index).unwrap_err().is_corruption());
	}

	#[test]
	fn type_mismatch_on_cached_block_is_corruption() {
		let mut store = store();
		let mut block = Block::new(Payload::Index(IndexBlock::default()));
		store.write(&mut block).unwrap();
		assert!(store.read(block.pos(), BlockType::FreeList).unwrap_err().is_corruption());
	}

	#[test]
	fn clear_and_close_drop_everything() {
		let mut store = store();
		let mut block = Block::new(Payload::Index(IndexBlock::default()));
		store.write(&mut block).unwrap();
		store.clear().unwrap();
		assert_eq!(store.cached_blocks(), 0);

		store.write(&mut Block::new(Payload::Index(IndexBlock::default()))).unwrap();
		store.close().unwrap();
		assert_eq!(store.cached_blocks(), 0);
		assert!(!store.is_open());
	}
}
