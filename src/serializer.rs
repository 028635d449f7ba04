use std::marker::PhantomData;

use serde::{de::DeserializeOwned, Serialize};

use crate::error::{Error, Result};

/// Converts cached values to and from the bytes stored in data blocks.
pub trait Serializer<V> {
	fn encode(&self, value: &V) -> Result<Vec<u8>>;

	fn decode(&self, bytes: &[u8]) -> Result<V>;
}

/// Stores any serde type using bincode.
pub struct BincodeSerializer<T> {
	_marker: PhantomData<fn() -> T>,
}

impl<T> BincodeSerializer<T> {
	pub fn new() -> Self {
		Self {
			_marker: PhantomData,
		}
	}
}

impl<T> Default for BincodeSerializer<T> {
	fn default() -> Self {
		Self::new()
	}
}

impl<T: Serialize + DeserializeOwned> Serializer<T> for BincodeSerializer<T> {
	fn encode(&self, value: &T) -> Result<Vec<u8>> {
		Ok(bincode::serialize(value)?)
	}

	fn decode(&self, bytes: &[u8]) -> Result<T> {
		Ok(bincode::deserialize(bytes)?)
	}
}

/// Stores raw bytes as they are.
#[derive(Clone, Copy, Debug, Default)]
pub struct BytesSerializer;

impl Serializer<Vec<u8>> for BytesSerializer {
	fn encode(&self, value: &Vec<u8>) -> Result<Vec<u8>> {
		Ok(value.clone())
	}

	fn decode(&self, bytes: &[u8]) -> Result<Vec<u8>> {
		Ok(bytes.to_vec())
	}
}

/// Stores strings as UTF-8.
#[derive(Clone, Copy, Debug, Default)]
pub struct StringSerializer;

impl Serializer<String> for StringSerializer {
	fn encode(&self, value: &String) -> Result<Vec<u8>> {
		Ok(value.as_bytes().to_vec())
	}

	fn decode(&self, bytes: &[u8]) -> Result<String> {
		String::from_utf8(bytes.to_vec())
			.map_err(|e| Error::Serialization(format!("value is not valid UTF-8: {e}")))
	}
}

#[cfg(test)]
mod tests {
	use serde::Deserialize;

	use super::*;

	#[derive(Debug, PartialEq, Serialize, Deserialize)]
	struct Artifact {
		name: String,
		size: u64,
		hashes: Vec<[u8; 4]>,
	}

	#[test]
	fn bincode_structs() {
		let serializer = BincodeSerializer::<Artifact>::new();
		let artifact = Artifact {
			name: "lib.jar".to_string(),
			size: 4096,
			hashes: vec![[1, 2, 3, 4], [5, 6, 7, 8]],
		};
		let bytes = serializer.encode(&artifact).unwrap();
		assert_eq!(serializer.decode(&bytes).unwrap(), artifact);
	}

	#[test]
	fn bincode_rejects_truncated_input() {
		let serializer = BincodeSerializer::<Artifact>::new();
		let err = serializer.decode(&[3, 0]).unwrap_err();
		assert!(matches!(err, Error::Serialization(_)));
	}

	#[test]
	fn bytes_pass_through() {
		let bytes = BytesSerializer.encode(&vec![0, 255, 7]).unwrap();
		assert_eq!(bytes, vec![0, 255, 7]);
		assert_eq!(BytesSerializer.decode(&[]).unwrap(), Vec::<u8>::new());
	}

	#[test]
	fn strings_must_be_utf8() {
		assert_eq!(StringSerializer.decode(b"value").unwrap(), "value");
		assert!(matches!(StringSerializer.decode(&[0xff, 0xfe]), Err(Error::Serialization(_))));
	}
}
