// combine.rs
//
// How per-block or per-worker outputs are folded into one result.

use std::fmt;
use std::str::FromStr;
use std::sync::Arc;

use ndarray::{concatenate, Array1, Array2, ArrayView1, ArrayView2, Axis as NdAxis};

use crate::error::{EngineError, Result};

/// Outputs that can be joined end to end into one homogeneous sequence.
pub trait Concat: Sized {
    fn concat(parts: Vec<Self>) -> Result<Self>;
}

impl<T> Concat for Vec<T> {
    fn concat(parts: Vec<Self>) -> Result<Self> {
        Ok(parts.into_iter().flatten().collect())
    }
}

impl<A: Clone> Concat for Array1<A> {
    fn concat(parts: Vec<Self>) -> Result<Self> {
        if parts.is_empty() {
            return Ok(Array1::from_vec(Vec::new()));
        }
        let views: Vec<ArrayView1<A>> = parts.iter().map(|p| p.view()).collect();
        concatenate(NdAxis(0), &views).map_err(|e| EngineError::NotConcatenable(e.to_string()))
    }
}

/// Matrices are joined column-wise; every part must have the same number of rows.
impl<A: Clone> Concat for Array2<A> {
    fn concat(parts: Vec<Self>) -> Result<Self> {
        if parts.is_empty() {
            return Array2::from_shape_vec((0, 0), Vec::new())
                .map_err(|e| EngineError::NotConcatenable(e.to_string()));
        }
        let views: Vec<ArrayView2<A>> = parts.iter().map(|p| p.view()).collect();
        concatenate(NdAxis(1), &views).map_err(|e| {
            EngineError::NotConcatenable(format!(
                "matrices with row counts {:?}: {}",
                parts.iter().map(|p| p.nrows()).collect::<Vec<_>>(),
                e
            ))
        })
    }
}

/// Combination policy named by a string, as used by configuration surfaces.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Default)]
pub enum CombineMode {
    Discard,
    Collect,
    #[default]
    Flatten,
}

impl FromStr for CombineMode {
    type Err = EngineError;

    fn from_str(s: &str) -> Result<Self> {
        match s {
            "none" => Ok(CombineMode::Discard),
            "list" => Ok(CombineMode::Collect),
            "unlist" => Ok(CombineMode::Flatten),
            other => Err(EngineError::config(format!(
                "unrecognized combination policy '{}' (expected none, list or unlist)",
                other
            ))),
        }
    }
}

impl fmt::Display for CombineMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            CombineMode::Discard => "none",
            CombineMode::Collect => "list",
            CombineMode::Flatten => "unlist",
        })
    }
}

type Reducer<T> = Arc<dyn Fn(T, T) -> T + Send + Sync>;

/// Rule for folding a sequence of outputs.
pub enum Combine<T> {
    /// Keep nothing.
    Discard,
    /// Keep every output, in invocation order.
    Collect,
    /// Concatenate every output into one value.
    Flatten(fn(Vec<T>) -> Result<T>),
    /// Left fold with a binary function.
    Reduce(Reducer<T>),
}

impl<T> Combine<T> {
    pub fn flatten() -> Self
    where
        T: Concat,
    {
        Combine::Flatten(T::concat)
    }

    pub fn reduce<F>(f: F) -> Self
    where
        F: Fn(T, T) -> T + Send + Sync + 'static,
    {
        Combine::Reduce(Arc::new(f))
    }

    pub fn from_mode(mode: CombineMode) -> Self
    where
        T: Concat,
    {
        match mode {
            CombineMode::Discard => Combine::Discard,
            CombineMode::Collect => Combine::Collect,
            CombineMode::Flatten => Combine::flatten(),
        }
    }

    pub(crate) fn accumulator(&self) -> Accumulator<'_, T> {
        Accumulator {
            policy: self,
            collected: Vec::new(),
            folded: None,
        }
    }

    /// Folds a complete sequence of outputs.
    pub fn finish(&self, outputs: Vec<T>) -> Result<Combined<T>> {
        let mut acc = self.accumulator();
        for output in outputs {
            acc.push(output);
        }
        acc.finish()
    }
}

impl<T> Clone for Combine<T> {
    fn clone(&self) -> Self {
        match self {
            Combine::Discard => Combine::Discard,
            Combine::Collect => Combine::Collect,
            Combine::Flatten(f) => Combine::Flatten(*f),
            Combine::Reduce(f) => Combine::Reduce(Arc::clone(f)),
        }
    }
}

impl<T> fmt::Debug for Combine<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Combine::Discard => "Discard",
            Combine::Collect => "Collect",
            Combine::Flatten(_) => "Flatten",
            Combine::Reduce(_) => "Reduce",
        })
    }
}

/// Result of folding outputs under a [`Combine`] policy.
#[derive(Clone, Debug, PartialEq)]
pub enum Combined<T> {
    /// `Discard`, or `Reduce` over zero outputs.
    Nothing,
    Collected(Vec<T>),
    Value(T),
}

impl<T> Combined<T> {
    pub fn is_nothing(&self) -> bool {
        matches!(self, Combined::Nothing)
    }

    pub fn into_value(self) -> Option<T> {
        match self {
            Combined::Value(v) => Some(v),
            _ => None,
        }
    }

    pub fn into_collected(self) -> Option<Vec<T>> {
        match self {
            Combined::Collected(v) => Some(v),
            _ => None,
        }
    }
}

/// Streaming fold: outputs are pushed one at a time as they are produced.
pub(crate) struct Accumulator<'a, T> {
    policy: &'a Combine<T>,
    collected: Vec<T>,
    folded: Option<T>,
}

impl<T> Accumulator<'_, T> {
    pub(crate) fn push(&mut self, output: T) {
        match self.policy {
            Combine::Discard => {}
            Combine::Collect | Combine::Flatten(_) => self.collected.push(output),
            Combine::Reduce(f) => {
                self.folded = Some(match self.folded.take() {
                    Some(acc) => f(acc, output),
                    None => output,
                });
            }
        }
    }

    pub(crate) fn finish(self) -> Result<Combined<T>> {
        match self.policy {
            Combine::Discard => Ok(Combined::Nothing),
            Combine::Collect => Ok(Combined::Collected(self.collected)),
            Combine::Flatten(concat) => concat(self.collected).map(Combined::Value),
            Combine::Reduce(_) => Ok(self.folded.map_or(Combined::Nothing, Combined::Value)),
        }
    }
}
