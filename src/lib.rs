//! An ordered in-memory index backed by a skip list.
//!
//! Lookups are lock-free and may run concurrently with writers; removed
//! entries are handed to an epoch manager and freed only once no reader can
//! still reach them.
#![warn(rust_2018_idioms, unreachable_pub)]
pub mod epoch;
mod level;
mod node;
pub mod skiplist;

pub use epoch::{EpochManager, Guard, Retired};
pub use level::{GeometricLevels, LevelGenerator};
pub use node::HEIGHT;
pub use skiplist::{Builder, Comparator, EntryRef, NaturalOrder, SkipList};
