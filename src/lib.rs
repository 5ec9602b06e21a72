// lib.rs
//
// Filter-state and parallel block-application engine over genotype array stores.

pub mod apply;
pub mod bed;
pub mod combine;
pub mod error;
pub mod filter;
pub mod handle;
pub mod parallel;
pub mod split;
pub mod store;
pub mod vcf;

pub use apply::{blocks, ApplyOptions, Block, DEFAULT_BLOCK_SIZE};
pub use bed::BedStore;
pub use combine::{Combine, CombineMode, Combined, Concat};
pub use error::{EngineError, Result, ThreadSafeStdError};
pub use filter::{AxisFilter, FilterState, FilterStore, Selection};
pub use handle::{FileHandle, FilterScope, OpenOptions};
pub use parallel::{DispatchStrategy, Workers};
pub use split::{split_plan, split_range, SplitMode};
pub use store::{
    dosage_from_genotypes, Axis, ColumnData, GenotypeStore, MemoryStore, StoreMeta, StoreSource,
    Variable, MISSING_I8,
};
