use std::fs::{File as SysFile, OpenOptions};
use std::path::{Path, PathBuf};

use super::BlockStore;
use crate::block::{Block, BlockPointer, BlockType, Envelope, BLOCK_HEADER_SIZE};
use crate::error::{Error, Result};
use crate::option::Durability;
use crate::vfs::{File, InMemoryFile};

type Opener<F> = Box<dyn FnMut() -> Result<F> + Send + Sync>;

/// Reads and writes whole blocks at their offsets in a single file. New blocks are
/// appended; nothing is ever reclaimed at this layer.
pub struct FileBlockStore<F: File = SysFile> {
	name: String,
	opener: Opener<F>,
	file: Option<F>,
	durability: Durability,
	// Offset the next appended block is written at.
	end: u64,
}

impl FileBlockStore<SysFile> {
	pub fn new<P: AsRef<Path>>(path: P, durability: Durability) -> Self {
		let path: PathBuf = path.as_ref().to_path_buf();
		let name = path.display().to_string();
		let opener = move || -> Result<SysFile> {
			let file = OpenOptions::new()
				.read(true)
				.write(true)
				.create(true)
				.truncate(false)
				.open(&path)?;
			Ok(file)
		};
		Self::with_opener(name, durability, Box::new(opener))
	}
}

impl FileBlockStore<InMemoryFile> {
	/// A store backed by a vector. Content does not survive `close()`.
	pub fn in_memory() -> Self {
		Self::with_opener(
			"<memory>".to_string(),
			Durability::Eventual,
			Box::new(|| -> Result<InMemoryFile> { Ok(InMemoryFile::new()) }),
		)
	}
}

impl<F: File> FileBlockStore<F> {
	fn with_opener(name: String, durability: Durability, opener: Opener<F>) -> Self {
		Self {
			name,
			opener,
			file: None,
			durability,
			end: 0,
		}
	}

	fn file(&self) -> Result<&F> {
		self.file.as_ref().ok_or_else(|| Error::IllegalState(format!("{} is not open", self.name)))
	}

	fn file_mut(&mut self) -> Result<&mut F> {
		let name = &self.name;
		self.file.as_mut().ok_or_else(|| Error::IllegalState(format!("{name} is not open")))
	}

	/// Size of the file as far as this store is concerned.
	pub fn len(&self) -> u64 {
		self.end
	}

	pub fn is_empty(&self) -> bool {
		self.end == 0
	}

	fn check_range(&self, pos: BlockPointer, len: u64, what: &str) -> Result<()> {
		if pos.is_null() {
			return Err(Error::corruption(format!("null pointer while reading {what}")));
		}
		if pos.pos().checked_add(len).map_or(true, |end| end > self.end) {
			return Err(Error::corruption(format!(
				"{what} at {pos} ({len} bytes) extends past end of file ({} bytes)",
				self.end
			)));
		}
		Ok(())
	}
}

impl<F: File> BlockStore for FileBlockStore<F> {
	fn open(&mut self) -> Result<bool> {
		if self.file.is_some() {
			return Err(Error::IllegalState(format!("{} is already open", self.name)));
		}
		let file = (self.opener)()?;
		self.end = file.size()?;
		self.file = Some(file);
		log::debug!("Opened {} ({} bytes)", self.name, self.end);
		Ok(self.end == 0)
	}

	fn close(&mut self) -> Result<()> {
		match self.file.take() {
			Some(file) => {
				log::debug!("Closing {}", self.name);
				file.sync_data()
			}
			None => Ok(()),
		}
	}

	fn is_open(&self) -> bool {
		self.file.is_some()
	}

	fn clear(&mut self) -> Result<()> {
		self.file_mut()?.truncate(0)?;
		self.end = 0;
		Ok(())
	}

	fn read(&mut self, pos: BlockPointer, block_type: BlockType) -> Result<Block> {
		self.check_range(pos, BLOCK_HEADER_SIZE as u64, "block header")?;

		let file = self.file()?;
		let mut header = [0u8; BLOCK_HEADER_SIZE];
		file.read_exact_at(pos.pos(), &mut header)?;
		let envelope = Envelope::decode(pos, &header)?;

		self.check_range(pos, BLOCK_HEADER_SIZE as u64 + envelope.capacity as u64, "block")?;

		let mut payload = vec![0u8; envelope.length as usize];
		self.file()?.read_exact_at(pos.pos() + BLOCK_HEADER_SIZE as u64, &mut payload)?;
		Block::decode(pos, envelope, block_type, &payload)
	}

	fn read_first(&mut self, block_type: BlockType) -> Result<Block> {
		self.read(BlockPointer::new(0), block_type)
	}

	fn write(&mut self, block: &mut Block) -> Result<()> {
		if block.pos().is_null() {
			let pos = BlockPointer::new(self.end);
			let capacity = block.capacity().max(block.payload().encoded_len() as u32);
			block.assign(pos, capacity);
			let buf = block.encode(true)?;
			self.file_mut()?.write_all_at(pos.pos(), &buf)?;
			self.end += buf.len() as u64;
		} else {
			let pos = block.pos();
			if pos.pos() + block.total_size() > self.end {
				return Err(Error::InvalidArgument(format!(
					"{} extends past end of file ({} bytes)",
					block, self.end
				)));
			}
			let buf = block.encode(false)?;
			self.file_mut()?.write_all_at(pos.pos(), &buf)?;
		}
		Ok(())
	}

	fn remove(&mut self, _block: &Block) -> Result<()> {
		Ok(())
	}

	fn flush(&mut self) -> Result<()> {
		let durability = self.durability;
		let file = self.file()?;
		match durability {
			Durability::Immediate => file.sync_data(),
			Durability::Eventual => Ok(()),
		}
	}
}

#[cfg(test)]
mod tests {
	use tempdir::TempDir;
	use test_log::test;

	use super::*;
	use crate::block::{DataBlock, HeaderBlock, IndexBlock, Payload};

	fn data(value: &[u8]) -> Block {
		Block::new(Payload::Data(DataBlock::new(value.to_vec())))
	}

	#[test]
	fn appends_blocks_back_to_back() {
		let mut store = FileBlockStore::in_memory();
		assert!(store.open().unwrap());

		let mut first = data(b"one");
		let mut second = Block::with_capacity(Payload::Index(IndexBlock::default()), 100);
		store.write(&mut first).unwrap();
		store.write(&mut second).unwrap();

		assert_eq!(first.pos(), BlockPointer::new(0));
		assert_eq!(second.pos().pos(), first.total_size());
		assert_eq!(store.len(), first.total_size() + second.total_size());

		let read = store.read(second.pos(), BlockType::Index).unwrap();
		assert_eq!(read.capacity(), 100);
		assert_eq!(read.payload(), second.payload());
	}

	#[test]
	fn overwrites_in_place() {
		let mut store = FileBlockStore::in_memory();
		store.open().unwrap();

		let mut block = Block::with_capacity(Payload::Data(DataBlock::new(b"a".to_vec())), 64);
		store.write(&mut block).unwrap();
		let end = store.len();

		*block.payload_mut() = Payload::Data(DataBlock::new(b"longer value".to_vec()));
		store.write(&mut block).unwrap();
		assert_eq!(store.len(), end);

		match store.read(block.pos(), BlockType::Data).unwrap().payload() {
			Payload::Data(data) => assert_eq!(data.value, b"longer value"),
			other => panic!("unexpected payload {other:?}"),
		}
	}

	#[test]
	fn read_past_end_is_corruption() {
		let mut store = FileBlockStore::in_memory();
		store.open().unwrap();
		let err = store.read(BlockPointer::new(1000), BlockType::Header).unwrap_err();
		assert!(err.is_corruption());
		let err = store.read(BlockPointer::NULL, BlockType::Header).unwrap_err();
		assert!(err.is_corruption());
	}

	#[test]
	fn read_with_wrong_type_is_corruption() {
		let mut store = FileBlockStore::in_memory();
		store.open().unwrap();
		let mut block = Block::new(Payload::Header(HeaderBlock::new(4)));
		store.write(&mut block).unwrap();
		assert!(store.read(block.pos(), BlockType::Index).unwrap_err().is_corruption());
	}

	#[test]
	fn operations_require_open_file() {
		let mut store = FileBlockStore::in_memory();
		let mut block = data(b"x");
		assert!(matches!(store.write(&mut block), Err(Error::IllegalState(_))));
		assert!(matches!(store.flush(), Err(Error::IllegalState(_))));
	}

	#[test]
	fn content_survives_reopen_on_disk() {
		let dir = TempDir::new("file_store").unwrap();
		let path = dir.path().join("blocks.bin");

		let pos = {
			let mut store = FileBlockStore::new(&path, Durability::Immediate);
			assert!(store.open().unwrap());
			let mut block = data(b"persisted");
			store.write(&mut block).unwrap();
			store.close().unwrap();
			assert!(!store.is_open());
			block.pos()
		};

		let mut store = FileBlockStore::new(&path, Durability::Immediate);
		assert!(!store.open().unwrap());
		match store.read(pos, BlockType::Data).unwrap().payload() {
			Payload::Data(data) => assert_eq!(data.value, b"persisted"),
			other => panic!("unexpected payload {other:?}"),
		}
	}

	#[test]
	fn clear_truncates_file() {
		let dir = TempDir::new("file_store").unwrap();
		let path = dir.path().join("blocks.bin");
		let mut store = FileBlockStore::new(&path, Durability::Eventual);
		store.open().unwrap();
		store.write(&mut data(b"gone")).unwrap();
		store.clear().unwrap();
		assert!(store.is_empty());
		assert_eq!(std::fs::metadata(&path).unwrap().len(), 0);
		store.close().unwrap();
		assert!(store.open().unwrap());
	}
}
