use std::fmt::{self, Display};
use std::fs;
use std::marker::PhantomData;
use std::path::{Path, PathBuf};

use crc::{Crc, CRC_64_ECMA_182};
use once_cell::unsync::OnceCell;

use crate::block::{Block, BlockPointer, BlockType, DataBlock, Payload};
use crate::error::{Error, Result};
use crate::option::Options;
use crate::serializer::Serializer;
use crate::store::{
	BlockStore, CachingBlockStore, FileBlockStore, FreeListBlockStore, StateCheckBlockStore,
};
use crate::tree::{check_overlaps, BTree, Extent, TreeStats};

const KEY_HASHER: Crc<u64> = Crc::<u64>::new(&CRC_64_ECMA_182);

type Stack = StateCheckBlockStore<FreeListBlockStore<CachingBlockStore<FileBlockStore>>>;

/// Hash under which a key is indexed. Keys are identified by their `Display` form only.
pub fn hash_key<K: Display + ?Sized>(key: &K) -> u64 {
	KEY_HASHER.checksum(key.to_string().as_bytes())
}

/// A data block loaded from disk. The value is decoded on first access only.
struct DataRecord<V> {
	block: Block,
	value: OnceCell<V>,
}

impl<V> DataRecord<V> {
	fn read<St: BlockStore>(store: &mut St, pos: BlockPointer) -> Result<Self> {
		Ok(DataRecord {
			block: store.read(pos, BlockType::Data)?,
			value: OnceCell::new(),
		})
	}

	fn bytes(&self) -> Result<&[u8]> {
		match self.block.payload() {
			Payload::Data(data) => Ok(&data.value),
			_ => Err(Error::corruption(format!("{} is not a data block", self.block))),
		}
	}

	fn value<S: Serializer<V>>(&self, serializer: &S) -> Result<&V> {
		self.value.get_or_try_init(|| serializer.decode(self.bytes()?))
	}

	fn into_value<S: Serializer<V>>(self, serializer: &S) -> Result<V> {
		self.value(serializer)?;
		let DataRecord {
			block,
			value,
		} = self;
		value.into_inner().ok_or_else(|| Error::corruption(format!("{block} has no value")))
	}

	/// Swaps in new value bytes if they fit the region the block already owns.
	fn replace(&mut self, bytes: &[u8]) -> bool {
		if DataBlock::capacity_for(bytes.len()) > self.block.capacity() {
			return false;
		}
		*self.block.payload_mut() = Payload::Data(DataBlock::new(bytes.to_vec()));
		self.value = OnceCell::new();
		true
	}
}

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct CacheStats {
	pub tree: TreeStats,
	pub free_regions: usize,
	pub free_bytes: u64,
	pub free_list_blocks: usize,
	pub cached_blocks: usize,
	pub file_size: u64,
}

/// A persistent map from keys to values, stored as a B-tree in a single file.
///
/// A cache file that turns out to be damaged is never an error for `get`, `put` or `remove`:
/// the file is discarded and rebuilt empty, `get` reports a miss, and `put`/`remove` are
/// retried once against the fresh file.
///
/// Keys are reduced to a 64-bit hash of their `Display` output and only the hash is stored.
/// Two keys with the same hash share one entry.
pub struct IndexedCache<K, V, S> {
	options: Options,
	path: PathBuf,
	serializer: S,
	store: Stack,
	tree: Option<BTree>,
	_marker: PhantomData<fn(&K) -> V>,
}

impl<K: Display, V, S: Serializer<V>> IndexedCache<K, V, S> {
	/// Opens `<dir>/cache.bin` with default options, creating it if needed.
	pub fn open<P: AsRef<Path>>(dir: P, serializer: S) -> Result<Self> {
		Self::open_with_options(Options::new().with_dir(dir.as_ref()), serializer)
	}

	pub fn open_with_options(options: Options, serializer: S) -> Result<Self> {
		options.validate()?;
		if options.create_dir_if_missing {
			fs::create_dir_all(&options.dir)?;
		}
		let path = options.file_path();

		let file = FileBlockStore::new(&path, options.durability);
		let cache = CachingBlockStore::new(
			file,
			options.block_cache_capacity,
			&[BlockType::Index, BlockType::FreeList],
		);
		let store =
			StateCheckBlockStore::new(FreeListBlockStore::new(cache, options.max_free_list_entries));

		let mut cache = IndexedCache {
			options,
			path,
			serializer,
			store,
			tree: None,
			_marker: PhantomData,
		};
		cache.open_store()?;
		Ok(cache)
	}

	pub fn get(&mut self, key: &K) -> Result<Option<V>> {
		let hash = hash_key(key);
		match self.lookup(hash) {
			Ok(value) => Ok(value),
			Err(e) if e.is_corruption() => {
				self.rebuild(&e).map_err(|e| e.context(format!("Could not read entry '{key}' from {self}")))?;
				Ok(None)
			}
			Err(e) => Err(e.context(format!("Could not read entry '{key}' from {self}"))),
		}
	}

	pub fn put(&mut self, key: &K, value: &V) -> Result<()> {
		let hash = hash_key(key);
		let result = self.serializer.encode(value).and_then(|bytes| {
			match self.store_value(hash, &bytes) {
				Err(e) if e.is_corruption() => {
					self.rebuild(&e)?;
					self.store_value(hash, &bytes)
				}
				other => other,
			}
		});
		result.map_err(|e| e.context(format!("Could not add entry '{key}' to {self}")))
	}

	pub fn remove(&mut self, key: &K) -> Result<()> {
		let hash = hash_key(key);
		let result = match self.remove_entry(hash) {
			Err(e) if e.is_corruption() => {
				self.rebuild(&e).and_then(|_| self.remove_entry(hash))
			}
			other => other,
		};
		result.map_err(|e| e.context(format!("Could not remove entry '{key}' from {self}")))
	}

	/// Closes and reopens the file, dropping everything held in memory.
	pub fn reset(&mut self) -> Result<()> {
		self.close()?;
		self.open_store()
	}

	/// Checks the structure of the whole file, failing with [`Error::IntegrityViolation`].
	pub fn verify(&mut self) -> Result<()> {
		self.check_integrity().map_err(|e| {
			let e = if e.is_corruption() {
				Error::IntegrityViolation(e.root_cause().to_string())
			} else {
				e
			};
			e.context(format!("Some problems were found when checking the integrity of {self}"))
		})
	}

	pub fn stats(&mut self) -> Result<CacheStats> {
		self.collect_stats().map_err(|e| e.context(format!("Could not collect statistics of {self}")))
	}

	fn tree_and_store(&mut self) -> Result<(&mut BTree, &mut Stack)> {
		match self.tree.as_mut() {
			Some(tree) => Ok((tree, &mut self.store)),
			None => Err(Error::IllegalState(format!("cache '{}' is not open", self.path.display()))),
		}
	}

	fn open_store(&mut self) -> Result<()> {
		match self.load() {
			Ok(()) => Ok(()),
			Err(e) if e.is_corruption() => {
				self.rebuild(&e).map_err(|e| e.context(format!("Could not open {self}")))
			}
			Err(e) => {
				if let Err(close) = self.store.close() {
					log::debug!("Ignoring failure to close {}: {}", self, close);
				}
				Err(e.context(format!("Could not open {self}")))
			}
		}
	}

	fn load(&mut self) -> Result<()> {
		self.tree = None;
		let max_fanout = self.options.max_fanout;
		let tree = if self.store.open()? {
			let tree = BTree::create(&mut self.store, max_fanout)?;
			self.store.flush()?;
			tree
		} else {
			BTree::load(&mut self.store, max_fanout)?
		};
		log::debug!("Opened {} with root {}", self, tree.root());
		self.tree = Some(tree);
		Ok(())
	}

	/// Throws away the whole file and starts over with an empty index.
	fn rebuild(&mut self, cause: &Error) -> Result<()> {
		log::warn!("{} is corrupt. Discarding. ({})", self, cause.root_cause());
		self.tree = None;
		if self.store.is_open() {
			self.store.clear()?;
		}
		self.store.close()?;

		if !self.store.open()? {
			return Err(Error::IllegalState(format!("{self} was not empty after being discarded")));
		}
		let tree = BTree::create(&mut self.store, self.options.max_fanout)?;
		self.store.flush()?;
		self.tree = Some(tree);
		Ok(())
	}

	fn lookup(&mut self, hash: u64) -> Result<Option<V>> {
		let (tree, store) = self.tree_and_store()?;
		let lookup = tree.find(store, hash)?;
		let Some(entry) = lookup.entry() else {
			return Ok(None);
		};
		let record = DataRecord::read(store, entry.data)?;
		record.into_value(&self.serializer).map(Some)
	}

	fn store_value(&mut self, hash: u64, bytes: &[u8]) -> Result<()> {
		let (tree, store) = self.tree_and_store()?;
		let lookup = tree.find(store, hash)?;

		if let Some(entry) = lookup.entry() {
			let mut existing = DataRecord::<V>::read(store, entry.data)?;
			if existing.replace(bytes) {
				store.write(&mut existing.block)?;
				return store.flush();
			}
			store.remove(&existing.block)?;
		}

		let mut block = Block::new(Payload::Data(DataBlock::new(bytes.to_vec())));
		store.write(&mut block)?;
		tree.put(store, lookup, hash, block.pos())?;
		store.flush()
	}

	fn remove_entry(&mut self, hash: u64) -> Result<()> {
		let (tree, store) = self.tree_and_store()?;
		let lookup = tree.find(store, hash)?;
		let Some(entry) = lookup.entry().copied() else {
			return Ok(());
		};
		let data = store.read(entry.data, BlockType::Data)?;
		tree.remove(store, lookup)?;
		store.remove(&data)?;
		store.flush()
	}

	fn check_integrity(&mut self) -> Result<()> {
		let (tree, store) = self.tree_and_store()?;
		let mut extents = tree.verify(store)?;
		let free = store.inner_mut()?.free_space()?;
		extents.extend(free.blocks.iter().map(Extent::of));
		extents.extend(free.entries.iter().map(Extent::free));
		check_overlaps(extents)
	}

	fn collect_stats(&mut self) -> Result<CacheStats> {
		let (tree, store) = self.tree_and_store()?;
		let tree = tree.stats(store)?;
		let free_list = store.inner_mut()?;
		let free = free_list.free_space()?;
		let cache = free_list.inner();
		Ok(CacheStats {
			tree,
			free_regions: free.entries.len(),
			free_bytes: free.entries.iter().map(|entry| entry.capacity as u64).sum(),
			free_list_blocks: free.blocks.len(),
			cached_blocks: cache.cached_blocks(),
			file_size: cache.inner().len(),
		})
	}
}

impl<K, V, S> IndexedCache<K, V, S> {
	pub fn path(&self) -> &Path {
		&self.path
	}

	pub fn is_open(&self) -> bool {
		self.store.is_open()
	}

	/// Flushes and closes the file. The file handle is released even if the flush fails.
	pub fn close(&mut self) -> Result<()> {
		self.tree = None;
		self.store.close().map_err(|e| e.context(format!("Could not close {self}")))
	}
}

impl<K, V, S> Display for IndexedCache<K, V, S> {
	fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
		write!(f, "cache '{}'", self.path.display())
	}
}

impl<K, V, S> Drop for IndexedCache<K, V, S> {
	fn drop(&mut self) {
		if self.is_open() {
			if let Err(e) = self.close() {
				log::error!("Error while dropping {}: {}", self, e);
			}
		}
	}
}
