//! jotdb: an LSM key/value store for JSON documents with a secondary
//! attribute index.
//!
//! Records are JSON payloads. The primary key is derived from one
//! configured attribute; a second configured attribute is indexed so
//! records can be looked up by secondary point value (`sget`) or range
//! (`srange`), newest first, truncated to a top-K bound.
//!
//! Two layouts back the secondary index, selected at open:
//!
//! - **Interval tree mode**: a process-wide augmented red-black tree maps
//!   every data block of every live SSTable to its secondary-value range
//!   and maximum sequence number, and drives queries in globally
//!   descending sequence order. The tree is checkpointed to a file and
//!   rebuilt from table scans when the file is lost.
//! - **Interval-block mode**: each SSTable carries a per-block min/max
//!   range block parallel to its index block, and queries prune per table.

pub mod config;
pub mod error;
pub mod extract;
pub mod ikey;
pub mod itree;
pub mod memtable;
pub mod query;
pub mod sstable;
pub mod store;

pub use config::Config;
pub use error::{Error, Result};
pub use query::{QueryOptions, SecondaryHit};
pub use store::Store;
