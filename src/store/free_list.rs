use super::BlockStore;
use crate::block::{Block, BlockPointer, BlockType, FreeEntry, FreeListBlock, Payload};
use crate::error::{Error, Result};

/// Everything the free list currently owns: its own blocks and the regions waiting for reuse.
#[derive(Debug, Default)]
pub struct FreeSpace {
	pub blocks: Vec<Block>,
	pub entries: Vec<FreeEntry>,
}

/// Tracks freed regions and hands them out again before the file is grown.
///
/// The free list is persisted as a chain of free-list blocks. The head of the chain is the
/// first block in the file; the block right after it is exposed as this layer's first block.
/// Reuse is first-fit: the first region with enough capacity is taken whole, and adjacent
/// regions are never coalesced.
///
/// `max_entries` bounds each free-list block, not the list as a whole. Once every block in
/// the chain is full, another block is linked in, so the number of tracked regions is not
/// capped. A block written under a smaller limit keeps the room it was created with.
pub struct FreeListBlockStore<S> {
	inner: S,
	max_entries: u32,
	head: Option<Block>,
}

fn entries_of(block: &Block) -> Result<&FreeListBlock> {
	match block.payload() {
		Payload::FreeList(list) => Ok(list),
		_ => Err(Error::corruption(format!("{block} is not part of the free list"))),
	}
}

fn entries_of_mut(block: &mut Block) -> Result<&mut FreeListBlock> {
	match block.payload_mut() {
		Payload::FreeList(list) => Ok(list),
		_ => Err(Error::corruption("block is not part of the free list")),
	}
}

impl<S: BlockStore> FreeListBlockStore<S> {
	pub fn new(inner: S, max_entries: u32) -> Self {
		Self {
			inner,
			max_entries,
			head: None,
		}
	}

	fn new_list_block(&self, list: FreeListBlock) -> Block {
		Block::with_capacity(Payload::FreeList(list), FreeListBlock::capacity_for(self.max_entries))
	}

	fn head(&self) -> Result<&Block> {
		self.head.as_ref().ok_or_else(|| Error::IllegalState("free list is not loaded".into()))
	}

	/// Entries `block` may hold: the configured limit, or less if its region is smaller.
	fn room(&self, block: &Block) -> usize {
		FreeListBlock::entries_for(block.capacity()).min(self.max_entries as usize)
	}

	/// Follows the chain to `next`, failing if the chain loops back on itself.
	fn follow(&mut self, visited: &mut Vec<BlockPointer>, next: BlockPointer) -> Result<Block> {
		if visited.contains(&next) {
			return Err(Error::corruption(format!("free list chain loops back to {next}")));
		}
		visited.push(next);
		self.inner.read(next, BlockType::FreeList)
	}

	fn save(&mut self, mut block: Block) -> Result<()> {
		self.inner.write(&mut block)?;
		if self.head()?.pos() == block.pos() {
			self.head = Some(block);
		}
		Ok(())
	}

	/// Takes the first free region that can hold `required` payload bytes.
	fn claim(&mut self, required: u32) -> Result<Option<FreeEntry>> {
		let mut current = self.head()?.clone();
		let mut visited = vec![current.pos()];
		loop {
			let list = entries_of(&current)?;
			let next = list.next;
			if let Some(i) = list.entries.iter().position(|entry| entry.capacity >= required) {
				let entry = entries_of_mut(&mut current)?.entries.remove(i);
				self.save(current)?;
				return Ok(Some(entry));
			}
			if next.is_null() {
				return Ok(None);
			}
			current = self.follow(&mut visited, next)?;
		}
	}

	/// Records `entry` in the first free-list block with room, growing the chain when all of
	/// them are full.
	fn release(&mut self, entry: FreeEntry) -> Result<()> {
		let list_capacity = FreeListBlock::capacity_for(self.max_entries);
		let mut current = self.head()?.clone();
		let mut visited = vec![current.pos()];
		loop {
			let room = self.room(&current);
			let list = entries_of_mut(&mut current)?;
			if list.entries.len() < room {
				list.entries.push(entry);
				return self.save(current);
			}
			let next = list.next;
			if next.is_null() {
				let mut extra = if entry.capacity >= list_capacity {
					// the freed region is big enough to hold the new list block itself
					let mut block = self.new_list_block(FreeListBlock::default());
					block.assign(entry.pos, entry.capacity);
					block
				} else {
					self.new_list_block(FreeListBlock {
						next: BlockPointer::NULL,
						entries: vec![entry],
					})
				};
				self.inner.write(&mut extra)?;
				log::trace!("Free list grew by {}", extra);
				entries_of_mut(&mut current)?.next = extra.pos();
				return self.save(current);
			}
			current = self.follow(&mut visited, next)?;
		}
	}

	/// Walks the free-list chain.
	pub fn free_space(&mut self) -> Result<FreeSpace> {
		let mut space = FreeSpace::default();
		let mut current = self.head()?.clone();
		loop {
			let list = entries_of(&current)?;
			let next = list.next;
			space.entries.extend_from_slice(&list.entries);
			space.blocks.push(current);
			if next.is_null() {
				return Ok(space);
			}
			if space.blocks.iter().any(|block| block.pos() == next) {
				return Err(Error::corruption(format!("free list chain loops back to {next}")));
			}
			current = self.inner.read(next, BlockType::FreeList)?;
		}
	}

	pub fn inner(&self) -> &S {
		&self.inner
	}
}

impl<S: BlockStore> BlockStore for FreeListBlockStore<S> {
	fn open(&mut self) -> Result<bool> {
		self.head = None;
		let created = self.inner.open()?;
		if created {
			let mut head = self.new_list_block(FreeListBlock::default());
			self.inner.write(&mut head)?;
			self.inner.flush()?;
			self.head = Some(head);
		} else {
			self.head = Some(self.inner.read_first(BlockType::FreeList)?);
		}
		Ok(created)
	}

	fn close(&mut self) -> Result<()> {
		self.head = None;
		self.inner.close()
	}

	fn is_open(&self) -> bool {
		self.inner.is_open()
	}

	fn clear(&mut self) -> Result<()> {
		self.head = None;
		self.inner.clear()
	}

	fn read(&mut self, pos: BlockPointer, block_type: BlockType) -> Result<Block> {
		self.inner.read(pos, block_type)
	}

	fn read_first(&mut self, block_type: BlockType) -> Result<Block> {
		let head = self.head()?;
		let first = BlockPointer::new(head.pos().pos() + head.total_size());
		self.inner.read(first, block_type)
	}

	fn write(&mut self, block: &mut Block) -> Result<()> {
		if block.pos().is_null() {
			let required = block.capacity().max(block.payload().encoded_len() as u32);
			if let Some(entry) = self.claim(required)? {
				block.assign(entry.pos, entry.capacity);
			}
		}
		self.inner.write(block)
	}

	fn remove(&mut self, block: &Block) -> Result<()> {
		if block.pos().is_null() {
			return Ok(());
		}
		self.inner.remove(block)?;
		self.release(FreeEntry {
			pos: block.pos(),
			capacity: block.capacity(),
		})
	}

	fn flush(&mut self) -> Result<()> {
		self.inner.flush()
	}
}

#[cfg(test)]
mod tests {
	use test_log::test;

	use super::*;
	use crate::block::{DataBlock, HeaderBlock};
	use crate::store::testing::MemoryBlockStore;

	fn data(len: usize) -> Block {
		Block::new(Payload::Data(DataBlock::new(vec![7; len])))
	}

	fn store(max_entries: u32) -> FreeListBlockStore<MemoryBlockStore> {
		let mut store = FreeListBlockStore::new(MemoryBlockStore::default(), max_entries);
		assert!(store.open().unwrap());
		store
	}

	#[test]
	fn head_is_created_and_first_block_follows_it() {
		let mut store = store(4);
		let mut header = Block::new(Payload::Header(HeaderBlock::new(4)));
		store.write(&mut header).unwrap();

		let head_size = store.head().unwrap().total_size();
		assert_eq!(header.pos().pos(), head_size);
		assert_eq!(store.read_first(BlockType::Header).unwrap(), header);
	}

	#[test]
	fn reopen_loads_existing_head() {
		let mut store = store(4);
		store.close().unwrap();
		assert!(!store.open().unwrap());
		assert!(store.free_space().unwrap().entries.is_empty());
	}

	#[test]
	fn freed_region_is_reused() {
		let mut store = store(4);
		let mut first = data(32);
		store.write(&mut first).unwrap();
		let end = store.inner().end;

		store.remove(&first).unwrap();
		assert_eq!(store.free_space().unwrap().entries.len(), 1);

		let mut second = data(16);
		store.write(&mut second).unwrap();
		assert_eq!(second.pos(), first.pos());
		// the whole region is handed out, not just what the payload needs
		assert_eq!(second.capacity(), first.capacity());
		assert_eq!(store.inner().end, end);
		assert!(store.free_space().unwrap().entries.is_empty());
	}

	#[test]
	fn too_small_regions_are_skipped() {
		let mut store = store(4);
		let mut small = data(4);
		let mut large = data(64);
		store.write(&mut small).unwrap();
		store.write(&mut large).unwrap();
		store.remove(&small).unwrap();
		store.remove(&large).unwrap();

		let mut block = data(40);
		store.write(&mut block).unwrap();
		assert_eq!(block.pos(), large.pos());

		let remaining = store.free_space().unwrap().entries;
		assert_eq!(remaining.len(), 1);
		assert_eq!(remaining[0].pos, small.pos());
	}

	#[test]
	fn grows_file_when_nothing_fits() {
		let mut store = store(4);
		let mut small = data(4);
		store.write(&mut small).unwrap();
		store.remove(&small).unwrap();

		let end = store.inner().end;
		let mut block = data(100);
		store.write(&mut block).unwrap();
		assert_eq!(block.pos().pos(), end);
	}

	#[test]
	fn full_list_chains_another_block() {
		let mut store = store(2);
		let mut blocks: Vec<Block> = (0..5).map(|_| data(8)).collect();
		for block in blocks.iter_mut() {
			store.write(block).unwrap();
		}
		for block in &blocks {
			store.remove(block).unwrap();
		}

		let space = store.free_space().unwrap();
		assert_eq!(space.entries.len(), 5);
		assert_eq!(space.blocks.len(), 3);

		// every freed region is handed out again before the file grows
		let end = store.inner().end;
		for _ in 0..5 {
			store.write(&mut data(8)).unwrap();
		}
		assert_eq!(store.inner().end, end);
		assert!(store.free_space().unwrap().entries.is_empty());
	}

	#[test]
	fn large_freed_region_becomes_list_block() {
		let mut store = store(1);
		let mut first = data(8);
		let mut big = data(256);
		store.write(&mut first).unwrap();
		store.write(&mut big).unwrap();
		store.remove(&first).unwrap();

		let end = store.inner().end;
		store.remove(&big).unwrap();
		assert_eq!(store.inner().end, end);

		let space = store.free_space().unwrap();
		assert_eq!(space.blocks.len(), 2);
		assert_eq!(space.blocks[1].pos(), big.pos());
		assert_eq!(space.entries.len(), 1);
	}

	#[test]
	fn reopen_with_larger_limit_keeps_existing_blocks_within_capacity() {
		let mut store = store(2);
		let mut blocks: Vec<Block> = (0..6).map(|_| data(8)).collect();
		for block in blocks.iter_mut() {
			store.write(block).unwrap();
		}
		for block in &blocks[..2] {
			store.remove(block).unwrap();
		}
		store.close().unwrap();

		let mut store = FreeListBlockStore::new(store.inner, 8);
		assert!(!store.open().unwrap());
		for block in &blocks[2..] {
			store.remove(block).unwrap();
		}

		let space = store.free_space().unwrap();
		assert_eq!(space.entries.len(), 6);
		// the head was sized for two entries, so the rest went to a new list block
		assert_eq!(space.blocks.len(), 2);
		for block in &space.blocks {
			let list = entries_of(block).unwrap();
			assert!(list.entries.len() <= FreeListBlock::entries_for(block.capacity()));
		}
		assert_eq!(FreeListBlock::entries_for(space.blocks[1].capacity()), 8);
	}

	#[test]
	fn looping_chain_is_corruption() {
		let mut store = store(1);
		let mut blocks: Vec<Block> = (0..4).map(|_| data(8)).collect();
		for block in blocks.iter_mut() {
			store.write(block).unwrap();
		}
		for block in &blocks[..3] {
			store.remove(block).unwrap();
		}

		let space = store.free_space().unwrap();
		assert_eq!(space.blocks.len(), 3);
		let mut last = space.blocks[2].clone();
		entries_of_mut(&mut last).unwrap().next = space.blocks[0].pos();
		store.inner.write(&mut last).unwrap();

		assert!(store.free_space().unwrap_err().is_corruption());
		assert!(store.write(&mut data(100)).unwrap_err().is_corruption());
		assert!(store.remove(&blocks[3]).unwrap_err().is_corruption());
	}

	#[test]
	fn clear_forgets_head() {
		let mut store = store(4);
		store.clear().unwrap();
		assert!(matches!(store.free_space(), Err(Error::IllegalState(_))));
	}
}
