//! On-disk block format.
//!
//! Every block starts with a fixed envelope followed by a payload region of `capacity` bytes:
//!
//! ```text
//! +--------+--------------+------------+-----------+------------------------------+
//! | tag u8 | capacity u32 | length u32 | crc32 u32 | payload (capacity bytes)     |
//! +--------+--------------+------------+-----------+------------------------------+
//! ```
//!
//! `length` is the number of payload bytes actually in use and the checksum covers exactly
//! those bytes. All integers are little-endian. Pointers are stored as `i64` with `-1` as
//! the null sentinel.

use std::fmt;
use std::io;

use byteorder::{LittleEndian, ReadBytesExt};
use bytes::BufMut;

use crate::error::{Error, Result};

pub(crate) const BLOCK_HEADER_SIZE: usize = 1 + 4 + 4 + 4;

const NULL_POS: i64 = -1;

const HEADER_PAYLOAD_SIZE: usize = 8 + 2;
const INDEX_ENTRY_SIZE: usize = 8 + 8 + 8;
const INDEX_FIXED_SIZE: usize = 4 + 8;
pub(crate) const DATA_HEADER_SIZE: usize = 4 + 4;
const FREE_ENTRY_SIZE: usize = 8 + 4;
const FREE_LIST_FIXED_SIZE: usize = 8 + 4;

/// Offset of a block in the cache file.
#[derive(Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct BlockPointer(i64);

impl BlockPointer {
	pub const NULL: BlockPointer = BlockPointer(NULL_POS);

	pub fn new(pos: u64) -> Self {
		BlockPointer(pos as i64)
	}

	pub(crate) fn from_raw(raw: i64) -> Self {
		BlockPointer(raw)
	}

	pub fn is_null(&self) -> bool {
		self.0 < 0
	}

	pub fn pos(&self) -> u64 {
		self.0 as u64
	}

	pub(crate) fn raw(&self) -> i64 {
		self.0
	}
}

impl Default for BlockPointer {
	fn default() -> Self {
		BlockPointer::NULL
	}
}

impl fmt::Debug for BlockPointer {
	fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
		if self.is_null() {
			write!(f, "null")
		} else {
			write!(f, "{}", self.0)
		}
	}
}

impl fmt::Display for BlockPointer {
	fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
		fmt::Debug::fmt(self, f)
	}
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum BlockType {
	Header,
	Index,
	Data,
	FreeList,
}

impl BlockType {
	pub(crate) fn tag(&self) -> u8 {
		match self {
			BlockType::Header => 0x55,
			BlockType::Index => 0x77,
			BlockType::Data => 0x33,
			BlockType::FreeList => 0x44,
		}
	}

	pub(crate) fn from_tag(tag: u8) -> Option<Self> {
		match tag {
			0x55 => Some(BlockType::Header),
			0x77 => Some(BlockType::Index),
			0x33 => Some(BlockType::Data),
			0x44 => Some(BlockType::FreeList),
			_ => None,
		}
	}
}

/// Singleton block holding the index root and the fan-out the file was created with.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct HeaderBlock {
	pub root: BlockPointer,
	pub max_fanout: u16,
}

impl HeaderBlock {
	pub fn new(max_fanout: u16) -> Self {
		HeaderBlock {
			root: BlockPointer::NULL,
			max_fanout,
		}
	}

	fn encode(&self, buf: &mut Vec<u8>) {
		buf.put_i64_le(self.root.raw());
		buf.put_u16_le(self.max_fanout);
	}

	fn decode(buf: &mut &[u8]) -> io::Result<Self> {
		let root = BlockPointer::from_raw(buf.read_i64::<LittleEndian>()?);
		let max_fanout = buf.read_u16::<LittleEndian>()?;
		Ok(HeaderBlock {
			root,
			max_fanout,
		})
	}
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct IndexEntry {
	pub hash: u64,
	pub data: BlockPointer,
	pub child: BlockPointer,
}

impl IndexEntry {
	pub fn new(hash: u64, data: BlockPointer) -> Self {
		IndexEntry {
			hash,
			data,
			child: BlockPointer::NULL,
		}
	}
}

/// A B-tree node: entries sorted by hash plus the child holding keys above every entry.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct IndexBlock {
	pub entries: Vec<IndexEntry>,
	pub tail: BlockPointer,
}

impl IndexBlock {
	/// Payload bytes needed to hold `max_fanout + 1` entries, so an overflowing node can be
	/// written before it is split.
	pub fn capacity_for(max_fanout: u16) -> u32 {
		(INDEX_FIXED_SIZE + INDEX_ENTRY_SIZE * (max_fanout as usize + 1)) as u32
	}

	pub fn is_leaf(&self) -> bool {
		self.tail.is_null()
	}

	/// Binary search by hash, `Ok` on an exact match, `Err` with the insertion point otherwise.
	pub fn search(&self, hash: u64) -> std::result::Result<usize, usize> {
		self.entries.binary_search_by(|entry| entry.hash.cmp(&hash))
	}

	/// Child to descend into for a key that would be inserted at `index`.
	pub fn child_at(&self, index: usize) -> BlockPointer {
		if index == self.entries.len() {
			self.tail
		} else {
			self.entries[index].child
		}
	}

	/// Redirects the child pointer at `index` (tail when `index == len`).
	pub fn set_child_at(&mut self, index: usize, child: BlockPointer) {
		if index == self.entries.len() {
			self.tail = child;
		} else {
			self.entries[index].child = child;
		}
	}

	fn encoded_len(&self) -> usize {
		INDEX_FIXED_SIZE + INDEX_ENTRY_SIZE * self.entries.len()
	}

	fn encode(&self, buf: &mut Vec<u8>) {
		buf.put_u32_le(self.entries.len() as u32);
		for entry in &self.entries {
			buf.put_u64_le(entry.hash);
			buf.put_i64_le(entry.data.raw());
			buf.put_i64_le(entry.child.raw());
		}
		buf.put_i64_le(self.tail.raw());
	}

	fn decode(buf: &mut &[u8]) -> io::Result<Self> {
		let count = buf.read_u32::<LittleEndian>()? as usize;
		if count.saturating_mul(INDEX_ENTRY_SIZE) > buf.len() {
			return Err(io::Error::new(
				io::ErrorKind::InvalidData,
				format!("index entry count {count} exceeds block length"),
			));
		}
		let mut entries = Vec::with_capacity(count);
		for _ in 0..count {
			entries.push(IndexEntry {
				hash: buf.read_u64::<LittleEndian>()?,
				data: BlockPointer::from_raw(buf.read_i64::<LittleEndian>()?),
				child: BlockPointer::from_raw(buf.read_i64::<LittleEndian>()?),
			});
		}
		let tail = BlockPointer::from_raw(buf.read_i64::<LittleEndian>()?);
		Ok(IndexBlock {
			entries,
			tail,
		})
	}
}

/// Serialized value bytes for one key.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct DataBlock {
	pub value: Vec<u8>,
}

impl DataBlock {
	pub fn new(value: Vec<u8>) -> Self {
		DataBlock {
			value,
		}
	}

	/// Payload bytes a data block needs to hold a value of `len` bytes.
	pub fn capacity_for(len: usize) -> u32 {
		(DATA_HEADER_SIZE + len) as u32
	}

	fn encode(&self, capacity: u32, buf: &mut Vec<u8>) {
		buf.put_u32_le(capacity - DATA_HEADER_SIZE as u32);
		buf.put_u32_le(self.value.len() as u32);
		buf.put_slice(&self.value);
	}

	fn decode(buf: &mut &[u8], capacity: u32) -> io::Result<Self> {
		let allocated = buf.read_u32::<LittleEndian>()? as usize;
		let len = buf.read_u32::<LittleEndian>()? as usize;
		if allocated + DATA_HEADER_SIZE != capacity as usize {
			return Err(io::Error::new(
				io::ErrorKind::InvalidData,
				format!("data capacity {allocated} does not match block capacity {capacity}"),
			));
		}
		if len > allocated || len > buf.len() {
			return Err(io::Error::new(
				io::ErrorKind::InvalidData,
				format!("data length {len} exceeds capacity {allocated}"),
			));
		}
		let value = buf[..len].to_vec();
		*buf = &buf[len..];
		Ok(DataBlock {
			value,
		})
	}
}

/// A previously freed region available for reuse.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct FreeEntry {
	pub pos: BlockPointer,
	pub capacity: u32,
}

#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct FreeListBlock {
	pub next: BlockPointer,
	pub entries: Vec<FreeEntry>,
}

impl FreeListBlock {
	pub fn capacity_for(max_entries: u32) -> u32 {
		(FREE_LIST_FIXED_SIZE + FREE_ENTRY_SIZE * max_entries as usize) as u32
	}

	/// Number of entries that fit a free-list block with `capacity` payload bytes.
	pub fn entries_for(capacity: u32) -> usize {
		(capacity as usize).saturating_sub(FREE_LIST_FIXED_SIZE) / FREE_ENTRY_SIZE
	}

	fn encoded_len(&self) -> usize {
		FREE_LIST_FIXED_SIZE + FREE_ENTRY_SIZE * self.entries.len()
	}

	fn encode(&self, buf: &mut Vec<u8>) {
		buf.put_i64_le(self.next.raw());
		buf.put_u32_le(self.entries.len() as u32);
		for entry in &self.entries {
			buf.put_i64_le(entry.pos.raw());
			buf.put_u32_le(entry.capacity);
		}
	}

	fn decode(buf: &mut &[u8]) -> io::Result<Self> {
		let next = BlockPointer::from_raw(buf.read_i64::<LittleEndian>()?);
		let count = buf.read_u32::<LittleEndian>()? as usize;
		if count.saturating_mul(FREE_ENTRY_SIZE) > buf.len() {
			return Err(io::Error::new(
				io::ErrorKind::InvalidData,
				format!("free entry count {count} exceeds block length"),
			));
		}
		let mut entries = Vec::with_capacity(count);
		for _ in 0..count {
			entries.push(FreeEntry {
				pos: BlockPointer::from_raw(buf.read_i64::<LittleEndian>()?),
				capacity: buf.read_u32::<LittleEndian>()?,
			});
		}
		Ok(FreeListBlock {
			next,
			entries,
		})
	}
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub enum Payload {
	Header(HeaderBlock),
	Index(IndexBlock),
	Data(DataBlock),
	FreeList(FreeListBlock),
}

impl Payload {
	pub fn block_type(&self) -> BlockType {
		match self {
			Payload::Header(_) => BlockType::Header,
			Payload::Index(_) => BlockType::Index,
			Payload::Data(_) => BlockType::Data,
			Payload::FreeList(_) => BlockType::FreeList,
		}
	}

	pub fn encoded_len(&self) -> usize {
		match self {
			Payload::Header(_) => HEADER_PAYLOAD_SIZE,
			Payload::Index(index) => index.encoded_len(),
			Payload::Data(data) => DATA_HEADER_SIZE + data.value.len(),
			Payload::FreeList(list) => list.encoded_len(),
		}
	}

	fn encode(&self, capacity: u32, buf: &mut Vec<u8>) {
		match self {
			Payload::Header(header) => header.encode(buf),
			Payload::Index(index) => index.encode(buf),
			Payload::Data(data) => data.encode(capacity, buf),
			Payload::FreeList(list) => list.encode(buf),
		}
	}

	fn decode(block_type: BlockType, mut buf: &[u8], capacity: u32) -> io::Result<Self> {
		let payload = match block_type {
			BlockType::Header => Payload::Header(HeaderBlock::decode(&mut buf)?),
			BlockType::Index => Payload::Index(IndexBlock::decode(&mut buf)?),
			BlockType::Data => Payload::Data(DataBlock::decode(&mut buf, capacity)?),
			BlockType::FreeList => Payload::FreeList(FreeListBlock::decode(&mut buf)?),
		};
		if !buf.is_empty() {
			return Err(io::Error::new(
				io::ErrorKind::InvalidData,
				format!("{} trailing bytes after {:?} payload", buf.len(), block_type),
			));
		}
		Ok(payload)
	}
}

/// Fixed part of a block as it is stored in the file.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub(crate) struct Envelope {
	pub block_type: BlockType,
	pub capacity: u32,
	pub length: u32,
	pub checksum: u32,
}

impl Envelope {
	pub fn decode(pos: BlockPointer, buf: &[u8; BLOCK_HEADER_SIZE]) -> Result<Self> {
		let tag = buf[0];
		let block_type = BlockType::from_tag(tag).ok_or_else(|| {
			Error::corruption(format!("unknown block type tag 0x{tag:02x} at {pos}"))
		})?;
		let mut rest = &buf[1..];
		let field = |e: io::Error| Error::corruption(format!("block envelope at {pos}: {e}"));
		let capacity = rest.read_u32::<LittleEndian>().map_err(field)?;
		let length = rest.read_u32::<LittleEndian>().map_err(field)?;
		let checksum = rest.read_u32::<LittleEndian>().map_err(field)?;
		if length > capacity {
			return Err(Error::corruption(format!(
				"block at {pos} claims {length} bytes in a {capacity} byte region"
			)));
		}
		Ok(Envelope {
			block_type,
			capacity,
			length,
			checksum,
		})
	}
}

/// A payload bound to its place in the file.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Block {
	pos: BlockPointer,
	capacity: u32,
	checksum: u32,
	payload: Payload,
}

impl Block {
	/// A block that has not been written yet, sized to its current payload.
	pub fn new(payload: Payload) -> Self {
		let capacity = payload.encoded_len() as u32;
		Block {
			pos: BlockPointer::NULL,
			capacity,
			checksum: 0,
			payload,
		}
	}

	/// A block that has not been written yet, reserving at least `capacity` payload bytes.
	pub fn with_capacity(payload: Payload, capacity: u32) -> Self {
		let mut block = Block::new(payload);
		block.capacity = block.capacity.max(capacity);
		block
	}

	/// A block that already owns the region at `pos`.
	pub(crate) fn placed(payload: Payload, pos: BlockPointer, capacity: u32) -> Self {
		let mut block = Block::new(payload);
		block.assign(pos, capacity);
		block
	}

	pub fn pos(&self) -> BlockPointer {
		self.pos
	}

	pub fn into_payload(self) -> Payload {
		self.payload
	}

	pub fn capacity(&self) -> u32 {
		self.capacity
	}

	pub fn checksum(&self) -> u32 {
		self.checksum
	}

	pub fn block_type(&self) -> BlockType {
		self.payload.block_type()
	}

	/// Bytes this block occupies in the file, envelope included.
	pub fn total_size(&self) -> u64 {
		(BLOCK_HEADER_SIZE as u64) + self.capacity as u64
	}

	pub fn payload(&self) -> &Payload {
		&self.payload
	}

	pub fn payload_mut(&mut self) -> &mut Payload {
		&mut self.payload
	}

	/// True if the current payload still fits in the allocated region.
	pub fn fits(&self) -> bool {
		self.payload.encoded_len() <= self.capacity as usize
	}

	pub(crate) fn assign(&mut self, pos: BlockPointer, capacity: u32) {
		self.pos = pos;
		self.capacity = capacity;
	}

	/// Encodes envelope and payload. With `pad` the buffer is extended with zeros to the full
	/// region, which is needed when the block is appended to the end of the file.
	pub(crate) fn encode(&mut self, pad: bool) -> Result<Vec<u8>> {
		let length = self.payload.encoded_len();
		if length > self.capacity as usize {
			return Err(Error::InvalidArgument(format!(
				"{:?} payload of {} bytes does not fit block at {} with capacity {}",
				self.block_type(),
				length,
				self.pos,
				self.capacity
			)));
		}

		let mut payload = Vec::with_capacity(length);
		self.payload.encode(self.capacity, &mut payload);
		self.checksum = crc32fast::hash(&payload);

		let total = if pad {
			BLOCK_HEADER_SIZE + self.capacity as usize
		} else {
			BLOCK_HEADER_SIZE + length
		};
		let mut buf = Vec::with_capacity(total);
		buf.put_u8(self.block_type().tag());
		buf.put_u32_le(self.capacity);
		buf.put_u32_le(length as u32);
		buf.put_u32_le(self.checksum);
		buf.put_slice(&payload);
		buf.resize(total, 0);
		Ok(buf)
	}

	/// Rebuilds a block from its envelope and the `envelope.length` payload bytes.
	pub(crate) fn decode(
		pos: BlockPointer,
		envelope: Envelope,
		expected: BlockType,
		payload: &[u8],
	) -> Result<Self> {
		if envelope.block_type != expected {
			return Err(Error::corruption(format!(
				"expected {:?} block at {} but found {:?}",
				expected, pos, envelope.block_type
			)));
		}
		let actual = crc32fast::hash(payload);
		if actual != envelope.checksum {
			return Err(Error::corruption(format!(
				"checksum mismatch for {:?} block at {}: stored {:08x}, computed {:08x}",
				expected, pos, envelope.checksum, actual
			)));
		}
		let payload = Payload::decode(expected, payload, envelope.capacity).map_err(|e| {
			Error::corruption(format!("malformed {:?} block at {}: {}", expected, pos, e))
		})?;
		Ok(Block {
			pos,
			capacity: envelope.capacity,
			checksum: envelope.checksum,
			payload,
		})
	}
}

impl fmt::Display for Block {
	fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
		write!(f, "{:?} block (pos: {}, size: {})", self.block_type(), self.pos, self.total_size())
	}
}
