// split.rs
//
// Partitioning of a filtered axis across workers.

use std::fmt;
use std::ops::Range;
use std::str::FromStr;

use crate::error::{EngineError, Result};
use crate::store::Axis;

/// How the filtered domain is divided among parallel workers.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Default)]
pub enum SplitMode {
    #[default]
    ByVariant,
    BySample,
    /// A single worker owns the whole selection.
    None,
}

impl SplitMode {
    /// The axis this mode partitions, if any.
    pub fn axis(self) -> Option<Axis> {
        match self {
            SplitMode::ByVariant => Some(Axis::Variant),
            SplitMode::BySample => Some(Axis::Sample),
            SplitMode::None => None,
        }
    }

    /// Worker `worker`'s range of filtered positions on an axis with `len` selected entries.
    pub fn range(self, len: usize, worker: usize, workers: usize) -> Result<Range<usize>> {
        match self {
            SplitMode::None => {
                check_worker(worker, workers)?;
                Ok(if worker == 0 { 0..len } else { len..len })
            }
            _ => split_range(len, worker, workers),
        }
    }
}

impl FromStr for SplitMode {
    type Err = EngineError;

    fn from_str(s: &str) -> Result<Self> {
        match s {
            "by.variant" => Ok(SplitMode::ByVariant),
            "by.sample" => Ok(SplitMode::BySample),
            "none" => Ok(SplitMode::None),
            other => Err(EngineError::config(format!(
                "unrecognized split mode '{}' (expected by.variant, by.sample or none)",
                other
            ))),
        }
    }
}

impl fmt::Display for SplitMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            SplitMode::ByVariant => "by.variant",
            SplitMode::BySample => "by.sample",
            SplitMode::None => "none",
        })
    }
}

fn check_worker(worker: usize, workers: usize) -> Result<()> {
    if workers == 0 {
        return Err(EngineError::config("worker count must be at least 1"));
    }
    if worker >= workers {
        return Err(EngineError::config(format!(
            "worker index {} out of range for {} workers",
            worker, workers
        )));
    }
    Ok(())
}

/// Contiguous share of `len` filtered positions owned by `worker` out of `workers`.
///
/// The first `len % workers` workers take one extra position, so sizes differ by at most one
/// and the ranges tile `[0, len)` in worker order.
pub fn split_range(len: usize, worker: usize, workers: usize) -> Result<Range<usize>> {
    check_worker(worker, workers)?;
    let base = len / workers;
    let rem = len % workers;
    let start = worker * base + worker.min(rem);
    let size = base + usize::from(worker < rem);
    Ok(start..start + size)
}

/// All workers' ranges, in worker order.
pub fn split_plan(len: usize, workers: usize) -> Result<Vec<Range<usize>>> {
    (0..workers.max(1))
        .map(|worker| split_range(len, worker, workers))
        .collect()
}
