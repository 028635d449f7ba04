use std::io;

use super::BlockStore;
use crate::block::{Block, BlockPointer, BlockType};
use crate::error::{Error, Result};

/// Outermost layer: rejects every operation while the store is closed, and reports read
/// failures caused by a short or malformed file as corruption rather than plain I/O errors.
pub struct StateCheckBlockStore<S> {
	inner: S,
	open: bool,
}

fn corrupted(err: Error) -> Error {
	match err {
		Error::Io(e)
			if matches!(e.kind(), io::ErrorKind::UnexpectedEof | io::ErrorKind::InvalidData) =>
		{
			Error::Corruption(format!("unreadable block: {e}"))
		}
		other => other,
	}
}

impl<S: BlockStore> StateCheckBlockStore<S> {
	pub fn new(inner: S) -> Self {
		Self {
			inner,
			open: false,
		}
	}

	fn check_open(&self) -> Result<()> {
		if self.open {
			Ok(())
		} else {
			Err(Error::IllegalState("block store is not open".into()))
		}
	}

	pub fn inner(&self) -> &S {
		&self.inner
	}

	/// Access to the wrapped layers, only while open.
	pub fn inner_mut(&mut self) -> Result<&mut S> {
		self.check_open()?;
		Ok(&mut self.inner)
	}
}

impl<S: BlockStore> BlockStore for StateCheckBlockStore<S> {
	fn open(&mut self) -> Result<bool> {
		if self.open {
			return Err(Error::IllegalState("block store is already open".into()));
		}
		let result = self.inner.open();
		// a store whose first blocks turned out to be corrupt stays open so it can be cleared
		self.open = self.inner.is_open();
		result.map_err(corrupted)
	}

	fn close(&mut self) -> Result<()> {
		self.open = false;
		self.inner.close()
	}

	fn is_open(&self) -> bool {
		self.open
	}

	fn clear(&mut self) -> Result<()> {
		self.check_open()?;
		self.inner.clear()
	}

	fn read(&mut self, pos: BlockPointer, block_type: BlockType) -> Result<Block> {
		self.check_open()?;
		self.inner.read(pos, block_type).map_err(corrupted)
	}

	fn read_first(&mut self, block_type: BlockType) -> Result<Block> {
		self.check_open()?;
		self.inner.read_first(block_type).map_err(corrupted)
	}

	fn write(&mut self, block: &mut Block) -> Result<()> {
		self.check_open()?;
		self.inner.write(block)
	}

	fn remove(&mut self, block: &Block) -> Result<()> {
		self.check_open()?;
		self.inner.remove(block).map_err(corrupted)
	}

	fn flush(&mut self) -> Result<()> {
		self.check_open()?;
		self.inner.flush()
	}
}
