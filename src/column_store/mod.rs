//! Composite columnar tables.

pub mod arena;
mod cg_array;
mod co_sstable;
mod meta;
mod row_iter;
pub mod scanner;
mod wrapper;

pub use cg_array::CgSsTableArray;
pub use co_sstable::{CoBaseType, CoSsTable};
pub use meta::CoSsTableMeta;
pub use row_iter::CoRowIterator;
pub use wrapper::CgTableWrapper;
