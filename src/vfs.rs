use std::fs::File as SysFile;
use std::io;

use crate::error::Result;

/// Positional file access used by the raw block store.
pub trait File: Send + Sync {
	/// Fills `buf` from `offset`, failing with `UnexpectedEof` if the file ends first.
	fn read_exact_at(&self, offset: u64, buf: &mut [u8]) -> Result<()>;
	fn write_all_at(&mut self, offset: u64, buf: &[u8]) -> Result<()>;
	fn sync_data(&self) -> Result<()>;
	fn size(&self) -> Result<u64>;
	fn truncate(&mut self, len: u64) -> Result<()>;
}

pub type InMemoryFile = Vec<u8>;

impl File for InMemoryFile {
	fn read_exact_at(&self, offset: u64, buf: &mut [u8]) -> Result<()> {
		let start = offset as usize;
		let end = start + buf.len();
		if end > self.len() {
			return Err(io::Error::from(io::ErrorKind::UnexpectedEof).into());
		}
		buf.copy_from_slice(&self[start..end]);
		Ok(())
	}

	fn write_all_at(&mut self, offset: u64, buf: &[u8]) -> Result<()> {
		let start = offset as usize;
		let end = start + buf.len();

		// Ensure the vector is large enough
		if end > self.len() {
			self.resize(end, 0);
		}

		self[start..end].copy_from_slice(buf);
		Ok(())
	}

	fn sync_data(&self) -> Result<()> {
		Ok(()) // In-memory file doesn't need syncing
	}

	fn size(&self) -> Result<u64> {
		Ok(self.len() as u64)
	}

	fn truncate(&mut self, len: u64) -> Result<()> {
		self.resize(len as usize, 0);
		Ok(())
	}
}

impl File for SysFile {
	fn read_exact_at(&self, offset: u64, buf: &mut [u8]) -> Result<()> {
		#[cfg(unix)]
		{
			std::os::unix::prelude::FileExt::read_exact_at(self, buf, offset)?;
			Ok(())
		}

		#[cfg(windows)]
		{
			let mut done = 0;
			while done < buf.len() {
				let n = std::os::windows::prelude::FileExt::seek_read(
					self,
					&mut buf[done..],
					offset + done as u64,
				)?;
				if n == 0 {
					return Err(io::Error::from(io::ErrorKind::UnexpectedEof).into());
				}
				done += n;
			}
			Ok(())
		}
	}

	fn write_all_at(&mut self, offset: u64, buf: &[u8]) -> Result<()> {
		#[cfg(unix)]
		{
			std::os::unix::prelude::FileExt::write_all_at(self, buf, offset)?;
			Ok(())
		}

		#[cfg(windows)]
		{
			let mut done = 0;
			while done < buf.len() {
				let n = std::os::windows::prelude::FileExt::seek_write(
					self,
					&buf[done..],
					offset + done as u64,
				)?;
				if n == 0 {
					return Err(io::Error::from(io::ErrorKind::WriteZero).into());
				}
				done += n;
			}
			Ok(())
		}
	}

	fn sync_data(&self) -> Result<()> {
		Ok(SysFile::sync_data(self)?)
	}

	fn size(&self) -> Result<u64> {
		Ok(SysFile::metadata(self)?.len())
	}

	fn truncate(&mut self, len: u64) -> Result<()> {
		Ok(SysFile::set_len(self, len)?)
	}
}
