//! A persistent, disk-backed key/value cache indexed by a B-tree.
//!
//! ```no_run
//! use indexcache::{IndexedCache, StringSerializer};
//!
//! let mut cache: IndexedCache<&str, String, _> =
//! 	IndexedCache::open("/tmp/task-history", StringSerializer).unwrap();
//! cache.put(&":app:compile", &"up-to-date".to_string()).unwrap();
//! assert!(cache.get(&":app:compile").unwrap().is_some());
//! ```

pub mod block;
pub mod error;
pub mod indexed;
pub mod option;
pub mod serializer;
pub mod store;
pub mod tree;
pub mod vfs;

pub use error::{Error, Result};
pub use indexed::{hash_key, CacheStats, IndexedCache};
pub use option::{Durability, Options};
pub use serializer::{BincodeSerializer, BytesSerializer, Serializer, StringSerializer};
pub use tree::{Extent, TreeStats};
