// apply.rs
//
// Block-wise streaming of the current selection through a user callback.

use std::ops::Range;

use indicatif::{ProgressBar, ProgressStyle};
use log::debug;

use crate::combine::{Combine, Combined};
use crate::error::EngineError;
use crate::handle::FileHandle;
use crate::store::{Axis, ColumnData, Variable};

pub const DEFAULT_BLOCK_SIZE: usize = 1024;

/// Configuration of one `apply` pass.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct ApplyOptions {
    /// Maximum number of filtered positions per block.
    pub block_size: usize,
    /// The axis walked block by block.
    pub margin: Axis,
    /// Show a progress bar over blocks.
    pub verbose: bool,
}

impl Default for ApplyOptions {
    fn default() -> Self {
        Self {
            block_size: DEFAULT_BLOCK_SIZE,
            margin: Axis::Variant,
            verbose: false,
        }
    }
}

impl ApplyOptions {
    pub fn with_block_size(mut self, block_size: usize) -> Self {
        self.block_size = block_size;
        self
    }

    pub fn with_margin(mut self, margin: Axis) -> Self {
        self.margin = margin;
        self
    }

    pub fn with_verbose(mut self, verbose: bool) -> Self {
        self.verbose = verbose;
        self
    }
}

/// Consecutive windows of at most `block_size` positions covering `[0, len)` in order.
pub fn blocks(len: usize, block_size: usize) -> impl Iterator<Item = Range<usize>> {
    let step = block_size.max(1);
    (0..len).step_by(step).map(move |start| start..(start + step).min(len))
}

/// The data handed to one callback invocation.
#[derive(Clone, Debug)]
pub struct Block {
    /// 0-based invocation number.
    pub index: usize,
    /// Filtered positions on the margin axis covered by this block.
    pub range: Range<usize>,
    /// Absolute store positions of the block's entries on the margin axis.
    pub positions: Vec<usize>,
    pub columns: Vec<(Variable, ColumnData)>,
}

impl Block {
    pub fn len(&self) -> usize {
        self.range.len()
    }

    pub fn is_empty(&self) -> bool {
        self.range.is_empty()
    }

    pub fn get(&self, name: &str) -> Option<&ColumnData> {
        self.columns
            .iter()
            .find(|(variable, _)| variable.name() == name)
            .map(|(_, data)| data)
    }

    /// Like `get`, keyed by the parsed variable.
    pub fn variable(&self, variable: Variable) -> Option<&ColumnData> {
        self.columns
            .iter()
            .find(|(v, _)| *v == variable)
            .map(|(_, data)| data)
    }
}

fn block_progress(num_blocks: usize, verbose: bool) -> Result<ProgressBar, EngineError> {
    if !verbose {
        return Ok(ProgressBar::hidden());
    }
    let style = ProgressStyle::default_bar()
        .template("{spinner:.green} [{elapsed_precise}] [{bar:40.cyan/blue}] {pos}/{len} blocks ({percent}%) ETA: {eta}")
        .map_err(|e| EngineError::config(format!("failed to create progress bar style: {}", e)))?
        .progress_chars("=> ");
    Ok(ProgressBar::new(num_blocks as u64).with_style(style))
}

impl FileHandle {
    /// Streams the current selection through `f`, one block of the margin axis at a time.
    ///
    /// Blocks are visited in ascending filtered-position order and every selected position is
    /// in exactly one block. The first error from `f` ends the pass and is returned as is.
    pub fn apply<T, E, P, F>(
        &mut self,
        variables: &[&str],
        mut f: F,
        param: &P,
        combine: &Combine<T>,
        options: &ApplyOptions,
    ) -> Result<Combined<T>, E>
    where
        P: ?Sized,
        F: FnMut(&Block, &P) -> Result<T, E>,
        E: From<EngineError>,
    {
        if options.block_size == 0 {
            return Err(EngineError::config("block size must be a positive integer").into());
        }
        let variables = variables
            .iter()
            .map(|name| name.parse::<Variable>())
            .collect::<Result<Vec<_>, _>>()?;

        let margin = options.margin;
        let margin_positions = self.get_filter(margin).selected_indices();
        let other_positions = self.get_filter(margin.other()).selected_indices();
        let num_blocks = margin_positions.len().div_ceil(options.block_size);
        debug!(
            "Applying over {} selected {} in {} blocks of up to {}.",
            margin_positions.len(),
            margin.plural(),
            num_blocks,
            options.block_size
        );

        let progress = block_progress(num_blocks, options.verbose)?;
        let mut acc = combine.accumulator();
        for (index, range) in blocks(margin_positions.len(), options.block_size).enumerate() {
            let positions = margin_positions[range.clone()].to_vec();
            let (samples, variants) = match margin {
                Axis::Sample => (positions.as_slice(), other_positions.as_slice()),
                Axis::Variant => (other_positions.as_slice(), positions.as_slice()),
            };
            let mut columns = Vec::with_capacity(variables.len());
            for &variable in &variables {
                columns.push((variable, self.read_indices(variable, samples, variants)?));
            }
            let block = Block {
                index,
                range,
                positions,
                columns,
            };
            acc.push(f(&block, param)?);
            progress.inc(1);
        }
        progress.finish_and_clear();
        Ok(acc.finish()?)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::filter::Selection;
    use crate::store::tests::toy_store;
    use ndarray::Array1;

    fn dosage_sums(block: &Block) -> Vec<i32> {
        block
            .get("$dosage")
            .and_then(ColumnData::as_dosage)
            .map(|d| {
                d.rows()
                    .into_iter()
                    .map(|row| row.iter().filter(|&&x| x >= 0).map(|&x| x as i32).sum())
                    .collect()
            })
            .unwrap_or_default()
    }

    #[test]
    fn block_boundaries_cover_the_selection_once() {
        assert_eq!(blocks(5, 2).collect::<Vec<_>>(), vec![0..2, 2..4, 4..5]);
        assert_eq!(blocks(3, 10).collect::<Vec<_>>(), vec![0..3]);
        assert_eq!(blocks(0, 4).count(), 0);
    }

    #[test]
    fn apply_walks_blocks_in_order() {
        let mut handle = FileHandle::from_memory(toy_store());
        let sizes: Combine<Vec<(usize, usize)>> = Combine::flatten();
        let out = handle
            .apply::<_, EngineError, _, _>(
                &["variant.id"],
                |block, _: &()| Ok(vec![(block.index, block.len())]),
                &(),
                &sizes,
                &ApplyOptions::default().with_block_size(2),
            )
            .unwrap();
        assert_eq!(out.into_value().unwrap(), vec![(0, 2), (1, 2), (2, 1)]);
    }

    #[test]
    fn flattened_output_is_independent_of_block_size() {
        let mut handle = FileHandle::from_memory(toy_store());
        handle
            .set_filter_by_selection(Some(&Selection::Indices(vec![0, 1, 3])), Some(&Selection::Indices(vec![0, 2, 3, 4])), false, false)
            .unwrap();
        let flat: Combine<Vec<i32>> = Combine::flatten();
        let mut run = |block_size: usize| {
            handle
                .apply::<_, EngineError, _, _>(
                    &["$dosage"],
                    |block, _: &()| Ok(dosage_sums(block)),
                    &(),
                    &flat,
                    &ApplyOptions::default().with_block_size(block_size),
                )
                .unwrap()
                .into_value()
                .unwrap()
        };
        let whole = run(4);
        assert_eq!(whole.len(), 4);
        for block_size in 1..=4 {
            assert_eq!(run(block_size), whole, "block size {}", block_size);
        }
    }

    #[test]
    fn sample_margin_blocks_carry_sample_columns() {
        let mut handle = FileHandle::from_memory(toy_store());
        let ids: Combine<Array1<String>> = Combine::flatten();
        let out = handle
            .apply::<_, EngineError, _, _>(
                &["sample.id", "genotype"],
                |block, _: &()| {
                    let geno = block.get("genotype").and_then(ColumnData::as_genotype).unwrap();
                    assert_eq!(geno.dim(), (5, block.len(), 2));
                    assert!(block.variable(Variable::Genotype).is_some());
                    assert!(block.variable(Variable::Dosage).is_none());
                    Ok(block.get("sample.id").and_then(ColumnData::as_text).unwrap().clone())
                },
                &(),
                &ids,
                &ApplyOptions::default().with_block_size(3).with_margin(Axis::Sample),
            )
            .unwrap();
        assert_eq!(out.into_value().unwrap().to_vec(), vec!["S0", "S1", "S2", "S3"]);
    }

    #[derive(Debug)]
    enum CallbackError {
        Engine(EngineError),
        Domain(usize),
    }

    impl From<EngineError> for CallbackError {
        fn from(e: EngineError) -> Self {
            CallbackError::Engine(e)
        }
    }

    #[test]
    fn callback_errors_propagate_unchanged() {
        let mut handle = FileHandle::from_memory(toy_store());
        let mut calls = 0;
        let err = handle
            .apply(
                &["position"],
                |block, limit: &usize| {
                    calls += 1;
                    if block.index >= *limit {
                        Err(CallbackError::Domain(block.index))
                    } else {
                        Ok(())
                    }
                },
                &1usize,
                &Combine::Collect,
                &ApplyOptions::default().with_block_size(1),
            )
            .unwrap_err();
        assert!(matches!(err, CallbackError::Domain(1)));
        assert_eq!(calls, 2);
    }

    #[test]
    fn invalid_arguments_are_engine_errors() {
        let mut handle = FileHandle::from_memory(toy_store());
        let noop = |_: &Block, _: &()| Ok::<(), EngineError>(());
        let err = handle
            .apply(&["position"], noop, &(), &Combine::Discard, &ApplyOptions::default().with_block_size(0))
            .unwrap_err();
        assert!(matches!(err, EngineError::InvalidConfiguration(_)));
        let err = handle
            .apply(&["annotation/id"], noop, &(), &Combine::Discard, &ApplyOptions::default())
            .unwrap_err();
        assert!(matches!(err, EngineError::UnknownVariable(_)));
    }

    #[test]
    fn empty_selection_invokes_nothing() {
        let mut handle = FileHandle::from_memory(toy_store());
        handle
            .set_filter_by_selection(None, Some(&Selection::Indices(Vec::new())), false, false)
            .unwrap();
        let out = handle
            .apply::<_, EngineError, _, _>(
                &["$dosage"],
                |_, _: &()| -> Result<Vec<i32>, EngineError> { panic!("no block expected") },
                &(),
                &Combine::flatten(),
                &ApplyOptions::default(),
            )
            .unwrap();
        assert_eq!(out, Combined::Value(Vec::new()));
    }
}
