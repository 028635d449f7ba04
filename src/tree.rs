//! Disk-resident B-tree mapping 64-bit key hashes to data block pointers.
//!
//! Nodes never point back at their parents. Every walk from the root records the nodes it
//! passed through, together with the child slot it descended into, and the split and
//! rebalance steps consume that path bottom-up.

use std::fmt;

use crate::block::{
	Block, BlockPointer, BlockType, FreeEntry, HeaderBlock, IndexBlock, IndexEntry, Payload,
	BLOCK_HEADER_SIZE,
};
use crate::error::{Error, Result};
use crate::store::BlockStore;

// Deeper than any valid tree can get; only reached when child pointers form a cycle.
const MAX_DEPTH: usize = 64;

#[derive(Clone, Debug)]
struct Node {
	pos: BlockPointer,
	capacity: u32,
	index: IndexBlock,
}

impl Node {
	fn from_block(block: Block) -> Result<Self> {
		let pos = block.pos();
		let capacity = block.capacity();
		match block.into_payload() {
			Payload::Index(index) => Ok(Node {
				pos,
				capacity,
				index,
			}),
			other => Err(Error::corruption(format!(
				"expected index block at {} but found {:?}",
				pos,
				other.block_type()
			))),
		}
	}

	fn to_block(&self) -> Block {
		let payload = Payload::Index(self.index.clone());
		if self.pos.is_null() {
			Block::with_capacity(payload, self.capacity)
		} else {
			Block::placed(payload, self.pos, self.capacity)
		}
	}

	fn len(&self) -> usize {
		self.index.entries.len()
	}
}

impl fmt::Display for Node {
	fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
		write!(f, "index block at {} ({} entries)", self.pos, self.len())
	}
}

/// A node on the way down from the root and the child slot that was taken from it.
#[derive(Debug)]
struct Frame {
	node: Node,
	child: usize,
}

/// Result of [`BTree::find`]: the node that holds the hash, or the leaf it would be inserted
/// into, plus the path from the root to that node.
#[derive(Debug)]
pub(crate) struct Lookup {
	path: Vec<Frame>,
	node: Node,
	slot: std::result::Result<usize, usize>,
}

impl Lookup {
	pub fn entry(&self) -> Option<&IndexEntry> {
		match self.slot {
			Ok(i) => self.node.index.entries.get(i),
			Err(_) => None,
		}
	}
}

/// Bytes occupied by a live block, or by a free region when `block_type` is `None`.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Extent {
	pub pos: BlockPointer,
	pub size: u64,
	pub block_type: Option<BlockType>,
}

impl Extent {
	pub(crate) fn of(block: &Block) -> Self {
		Extent {
			pos: block.pos(),
			size: block.total_size(),
			block_type: Some(block.block_type()),
		}
	}

	pub(crate) fn free(entry: &FreeEntry) -> Self {
		Extent {
			pos: entry.pos,
			size: BLOCK_HEADER_SIZE as u64 + entry.capacity as u64,
			block_type: None,
		}
	}
}

impl fmt::Display for Extent {
	fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
		match self.block_type {
			Some(block_type) => write!(f, "{:?} block", block_type)?,
			None => write!(f, "free region")?,
		}
		write!(f, " (pos: {}, size: {})", self.pos, self.size)
	}
}

/// Sorts `extents` by position and fails on the first pair that shares bytes.
pub(crate) fn check_overlaps(mut extents: Vec<Extent>) -> Result<()> {
	extents.sort_by_key(|extent| extent.pos);
	for pair in extents.windows(2) {
		if pair[0].pos.pos() + pair[0].size > pair[1].pos.pos() {
			return Err(Error::IntegrityViolation(format!("{} overlaps with {}", pair[0], pair[1])));
		}
	}
	Ok(())
}

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct TreeStats {
	pub depth: usize,
	pub index_blocks: usize,
	pub leaf_blocks: usize,
	pub entries: usize,
	pub root_entries: usize,
}

pub(crate) struct BTree {
	header: HeaderBlock,
	header_pos: BlockPointer,
	header_capacity: u32,
	max_fanout: usize,
	min_entries: usize,
	index_capacity: u32,
}

impl BTree {
	fn with_header(header: Block, max_fanout: u16) -> Result<Self> {
		let header_pos = header.pos();
		let header_capacity = header.capacity();
		let header = match header.into_payload() {
			Payload::Header(header) => header,
			other => {
				return Err(Error::corruption(format!(
					"expected header block but found {:?}",
					other.block_type()
				)))
			}
		};
		Ok(BTree {
			header,
			header_pos,
			header_capacity,
			max_fanout: max_fanout as usize,
			min_entries: max_fanout as usize / 2,
			index_capacity: IndexBlock::capacity_for(max_fanout),
		})
	}

	/// Writes the header and an empty root into a store that has just been created.
	pub fn create<S: BlockStore>(store: &mut S, max_fanout: u16) -> Result<Self> {
		let mut header = Block::new(Payload::Header(HeaderBlock::new(max_fanout)));
		store.write(&mut header)?;
		let mut tree = Self::with_header(header, max_fanout)?;

		let mut root = tree.new_node(IndexBlock::default());
		tree.write_node(store, &mut root)?;
		tree.set_root(store, root.pos)?;
		log::debug!("Created index with root {} and max fan-out {}", root.pos, max_fanout);
		Ok(tree)
	}

	/// Loads the header of an existing store. A file written with a different fan-out is
	/// reported as corrupt.
	pub fn load<S: BlockStore>(store: &mut S, max_fanout: u16) -> Result<Self> {
		let header = store.read_first(BlockType::Header)?;
		let tree = Self::with_header(header, max_fanout)?;
		if tree.header.max_fanout != max_fanout {
			return Err(Error::corruption(format!(
				"file was written with max fan-out {} but {} is configured",
				tree.header.max_fanout, max_fanout
			)));
		}
		if tree.header.root.is_null() {
			return Err(Error::corruption("header has no index root"));
		}
		Ok(tree)
	}

	pub fn root(&self) -> BlockPointer {
		self.header.root
	}

	fn new_node(&self, index: IndexBlock) -> Node {
		Node {
			pos: BlockPointer::NULL,
			capacity: self.index_capacity,
			index,
		}
	}

	fn load_node<S: BlockStore>(&self, store: &mut S, pos: BlockPointer) -> Result<Node> {
		Node::from_block(store.read(pos, BlockType::Index)?)
	}

	fn write_node<S: BlockStore>(&self, store: &mut S, node: &mut Node) -> Result<()> {
		let mut block = node.to_block();
		store.write(&mut block)?;
		node.pos = block.pos();
		node.capacity = block.capacity();
		Ok(())
	}

	fn set_root<S: BlockStore>(&mut self, store: &mut S, root: BlockPointer) -> Result<()> {
		self.header.root = root;
		let mut block =
			Block::placed(Payload::Header(self.header.clone()), self.header_pos, self.header_capacity);
		store.write(&mut block)
	}

	/// Walks from the root towards `hash`, stopping at an exact match or at the node where
	/// the walk runs out of children.
	pub fn find<S: BlockStore>(&self, store: &mut S, hash: u64) -> Result<Lookup> {
		let mut path = Vec::new();
		let mut node = self.load_node(store, self.header.root)?;
		loop {
			match node.index.search(hash) {
				Ok(i) => {
					return Ok(Lookup {
						path,
						node,
						slot: Ok(i),
					})
				}
				Err(i) => {
					let child = node.index.child_at(i);
					if child.is_null() {
						return Ok(Lookup {
							path,
							node,
							slot: Err(i),
						});
					}
					if path.len() >= MAX_DEPTH {
						return Err(Error::corruption(format!(
							"index deeper than {MAX_DEPTH} levels below {}",
							self.header.root
						)));
					}
					let next = self.load_node(store, child)?;
					path.push(Frame {
						node,
						child: i,
					});
					node = next;
				}
			}
		}
	}

	/// Points `hash` at `data`, updating the entry found by `lookup` or inserting a new one.
	pub fn put<S: BlockStore>(
		&mut self,
		store: &mut S,
		lookup: Lookup,
		hash: u64,
		data: BlockPointer,
	) -> Result<()> {
		let Lookup {
			path,
			mut node,
			slot,
		} = lookup;
		match slot {
			Ok(i) => {
				node.index.entries[i].data = data;
				self.write_node(store, &mut node)
			}
			Err(i) => {
				if !node.index.is_leaf() {
					return Err(Error::corruption(format!(
						"lookup for {hash:#x} ended at non-leaf {node}"
					)));
				}
				node.index.entries.insert(i, IndexEntry::new(hash, data));
				self.write_node(store, &mut node)?;
				self.split_overflowing(store, node, path)
			}
		}
	}

	fn split_overflowing<S: BlockStore>(
		&mut self,
		store: &mut S,
		mut node: Node,
		mut path: Vec<Frame>,
	) -> Result<()> {
		while node.len() > self.max_fanout {
			let split = node.len() / 2;
			let mut upper = node.index.entries.split_off(split);
			let mut median = upper.remove(0);

			let mut sibling = self.new_node(IndexBlock {
				entries: upper,
				tail: node.index.tail,
			});
			self.write_node(store, &mut sibling)?;
			node.index.tail = median.child;
			self.write_node(store, &mut node)?;

			let Frame {
				node: mut parent,
				child,
			} = match path.pop() {
				Some(frame) => frame,
				None => {
					let mut root = self.new_node(IndexBlock::default());
					self.write_node(store, &mut root)?;
					self.set_root(store, root.pos)?;
					Frame {
						node: root,
						child: 0,
					}
				}
			};
			log::trace!("Split {} into {} around {:#x}", node, sibling, median.hash);

			parent.index.set_child_at(child, sibling.pos);
			median.child = node.pos;
			parent.index.entries.insert(child, median);
			self.write_node(store, &mut parent)?;
			node = parent;
		}
		Ok(())
	}

	/// Removes the entry found by `lookup`. Does nothing if the lookup found no entry.
	pub fn remove<S: BlockStore>(&mut self, store: &mut S, lookup: Lookup) -> Result<()> {
		let Lookup {
			mut path,
			mut node,
			slot,
		} = lookup;
		let Ok(i) = slot else {
			return Ok(());
		};
		let entry = node.index.entries.remove(i);
		self.write_node(store, &mut node)?;

		if entry.child.is_null() {
			return self.rebalance(store, node, path);
		}

		// Internal entry: move the highest entry of its left subtree into the gap.
		path.push(Frame {
			node,
			child: i,
		});
		let holder = path.len() - 1;
		let mut leaf = self.load_node(store, entry.child)?;
		while !leaf.index.tail.is_null() {
			if path.len() >= MAX_DEPTH {
				return Err(Error::corruption(format!(
					"index deeper than {MAX_DEPTH} levels below {}",
					self.header.root
				)));
			}
			let next = self.load_node(store, leaf.index.tail)?;
			let child = leaf.len();
			path.push(Frame {
				node: leaf,
				child,
			});
			leaf = next;
		}
		let mut highest = leaf.index.entries.pop().ok_or_else(|| {
			Error::corruption(format!("empty leaf {} below entry {:#x}", leaf.pos, entry.hash))
		})?;
		highest.child = entry.child;
		path[holder].node.index.entries.insert(i, highest);
		self.write_node(store, &mut path[holder].node)?;
		self.write_node(store, &mut leaf)?;

		self.rebalance(store, leaf, path)
	}

	/// Fixes underflowing nodes from `node` up to the root.
	fn rebalance<S: BlockStore>(
		&mut self,
		store: &mut S,
		mut node: Node,
		mut path: Vec<Frame>,
	) -> Result<()> {
		loop {
			let Some(Frame {
				node: mut parent,
				child,
			}) = path.pop()
			else {
				if node.len() == 0 && !node.index.tail.is_null() {
					// empty root with a single child: the child takes over
					log::trace!("Collapsing root {} into {}", node, node.index.tail);
					self.set_root(store, node.index.tail)?;
					store.remove(&node.to_block())?;
				}
				return Ok(());
			};
			if node.len() >= self.min_entries {
				return Ok(());
			}

			let mut left = match child {
				0 => None,
				_ => Some(self.load_node(store, parent.index.entries[child - 1].child)?),
			};
			if let Some(left) = left.as_mut().filter(|left| left.len() > self.min_entries) {
				return self.redistribute(store, &mut parent, child - 1, left, &mut node);
			}

			let mut right = if child < parent.len() {
				Some(self.load_node(store, parent.index.child_at(child + 1))?)
			} else {
				None
			};
			if let Some(right) = right.as_mut().filter(|right| right.len() > self.min_entries) {
				return self.redistribute(store, &mut parent, child, &mut node, right);
			}

			if let Some(mut left) = left.filter(|left| left.len() + node.len() < self.max_fanout) {
				self.merge(store, &mut parent, child - 1, &mut left, node)?;
			} else if let Some(right) =
				right.filter(|right| right.len() + node.len() < self.max_fanout)
			{
				self.merge(store, &mut parent, child, &mut node, right)?;
			} else {
				return Err(Error::UnbalancedTree(format!(
					"{} is below the minimum of {} entries and has no sibling to borrow from or merge with",
					node, self.min_entries
				)));
			}
			node = parent;
		}
	}

	/// Spreads the entries of two adjacent siblings, and the parent entry between them,
	/// evenly across both.
	fn redistribute<S: BlockStore>(
		&mut self,
		store: &mut S,
		parent: &mut Node,
		separator: usize,
		left: &mut Node,
		right: &mut Node,
	) -> Result<()> {
		let mut combined = std::mem::take(&mut left.index.entries);
		combined.push(IndexEntry {
			child: left.index.tail,
			..parent.index.entries[separator]
		});
		combined.append(&mut right.index.entries);

		let mid = combined.len() / 2;
		let mut upper = combined.split_off(mid);
		let mut median = upper.remove(0);
		left.index.entries = combined;
		left.index.tail = median.child;
		right.index.entries = upper;
		median.child = left.pos;
		parent.index.entries[separator] = median;
		log::trace!("Redistributed entries between {} and {}", left, right);

		self.write_node(store, left)?;
		self.write_node(store, right)?;
		self.write_node(store, parent)
	}

	/// Moves the parent entry between two adjacent siblings and all of `right` into `left`,
	/// then frees `right`.
	fn merge<S: BlockStore>(
		&mut self,
		store: &mut S,
		parent: &mut Node,
		separator: usize,
		left: &mut Node,
		mut right: Node,
	) -> Result<()> {
		let mut entry = parent.index.entries.remove(separator);
		entry.child = left.index.tail;
		left.index.entries.push(entry);
		left.index.entries.append(&mut right.index.entries);
		left.index.tail = right.index.tail;
		parent.index.set_child_at(separator, left.pos);
		log::trace!("Merged {} into {}", right.pos, left);

		self.write_node(store, parent)?;
		self.write_node(store, left)?;
		store.remove(&right.to_block())
	}

	/// Checks the shape of the whole tree and returns the extent of every block reachable
	/// from the header, data blocks included.
	pub fn verify<S: BlockStore>(&self, store: &mut S) -> Result<Vec<Extent>> {
		let header = store.read_first(BlockType::Header)?;
		if header.pos() != self.header_pos {
			return Err(Error::IntegrityViolation(format!(
				"header found at {} but expected at {}",
				header.pos(),
				self.header_pos
			)));
		}
		match header.payload() {
			Payload::Header(on_disk) if on_disk == &self.header => {}
			Payload::Header(on_disk) => {
				return Err(Error::IntegrityViolation(format!(
					"header on disk {:?} does not match {:?}",
					on_disk, self.header
				)))
			}
			_ => return Err(Error::IntegrityViolation("first block is not a header".into())),
		}

		let mut extents = vec![Extent::of(&header)];
		self.verify_node(store, self.header.root, 0, None, None, &mut extents)?;
		Ok(extents)
	}

	fn verify_node<S: BlockStore>(
		&self,
		store: &mut S,
		pos: BlockPointer,
		depth: usize,
		lower: Option<u64>,
		upper: Option<u64>,
		extents: &mut Vec<Extent>,
	) -> Result<()> {
		if depth > MAX_DEPTH {
			return Err(Error::IntegrityViolation(format!(
				"index deeper than {MAX_DEPTH} levels at {pos}"
			)));
		}
		let node = self.load_node(store, pos)?;
		extents.push(Extent::of(&node.to_block()));

		if depth > 0 && node.len() < self.min_entries {
			return Err(Error::IntegrityViolation(format!("Too few entries found in {node}")));
		}
		if node.len() > self.max_fanout {
			return Err(Error::IntegrityViolation(format!("Too many entries found in {node}")));
		}

		let is_leaf = node.index.entries.first().map_or(true, |entry| entry.child.is_null());
		if is_leaf != node.index.tail.is_null() {
			return Err(Error::IntegrityViolation(format!("Mismatched leaf/tail-node in {node}")));
		}

		let mut min = lower;
		for entry in &node.index.entries {
			if is_leaf != entry.child.is_null() {
				return Err(Error::IntegrityViolation(format!(
					"Mismatched leaf/non-leaf entry in {node}"
				)));
			}
			let above_min = min.map_or(true, |min| entry.hash > min);
			let below_max = upper.map_or(true, |max| entry.hash < max);
			if !above_min || !below_max {
				return Err(Error::IntegrityViolation(format!(
					"Out-of-order key {:#x} in {node}",
					entry.hash
				)));
			}
			if !entry.child.is_null() {
				self.verify_node(store, entry.child, depth + 1, min, Some(entry.hash), extents)?;
			}
			let data = store.read(entry.data, BlockType::Data)?;
			extents.push(Extent::of(&data));
			min = Some(entry.hash);
		}
		if !node.index.tail.is_null() {
			self.verify_node(store, node.index.tail, depth + 1, min, upper, extents)?;
		}
		Ok(())
	}

	pub fn stats<S: BlockStore>(&self, store: &mut S) -> Result<TreeStats> {
		let mut stats = TreeStats::default();
		self.collect_stats(store, self.header.root, 1, &mut stats)?;
		Ok(stats)
	}

	fn collect_stats<S: BlockStore>(
		&self,
		store: &mut S,
		pos: BlockPointer,
		depth: usize,
		stats: &mut TreeStats,
	) -> Result<()> {
		if depth > MAX_DEPTH {
			return Err(Error::corruption(format!("index deeper than {MAX_DEPTH} levels at {pos}")));
		}
		let node = self.load_node(store, pos)?;
		if depth == 1 {
			stats.root_entries = node.len();
		}
		stats.depth = stats.depth.max(depth);
		stats.index_blocks += 1;
		stats.entries += node.len();
		if node.index.is_leaf() {
			stats.leaf_blocks += 1;
			return Ok(());
		}
		for entry in &node.index.entries {
			self.collect_stats(store, entry.child, depth + 1, stats)?;
		}
		self.collect_stats(store, node.index.tail, depth + 1, stats)
	}
}
