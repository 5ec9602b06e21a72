// filter.rs
//
// Live sample/variant selections of one open store, with a push/pop save stack.

use std::collections::{HashMap, HashSet};
use std::ops::Range;

use crate::error::{EngineError, Result};
use crate::store::Axis;

// --- Axis filter ---

/// Boolean selection over one axis. The mask always spans the axis's full cardinality.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct AxisFilter {
    mask: Vec<bool>,
    selected: usize,
}

impl AxisFilter {
    /// Selects every position of an axis of length `len`.
    pub fn all(len: usize) -> Self {
        Self {
            mask: vec![true; len],
            selected: len,
        }
    }

    pub fn from_mask(mask: Vec<bool>) -> Self {
        let selected = mask.iter().filter(|&&b| b).count();
        Self { mask, selected }
    }

    /// Cardinality of the axis.
    pub fn len(&self) -> usize {
        self.mask.len()
    }

    pub fn is_empty(&self) -> bool {
        self.mask.is_empty()
    }

    pub fn selected_count(&self) -> usize {
        self.selected
    }

    pub fn is_selected(&self, position: usize) -> bool {
        self.mask.get(position).copied().unwrap_or(false)
    }

    pub fn mask(&self) -> &[bool] {
        &self.mask
    }

    /// Absolute positions of the selected entries, ascending.
    pub fn selected_indices(&self) -> Vec<usize> {
        self.mask
            .iter()
            .enumerate()
            .filter_map(|(i, &b)| if b { Some(i) } else { None })
            .collect()
    }

    /// Keeps only the selected entries whose filtered rank falls in `ranks`.
    pub(crate) fn narrow_to_ranks(&mut self, ranks: Range<usize>) {
        let mut rank = 0usize;
        for flag in self.mask.iter_mut().filter(|b| **b) {
            *flag = ranks.contains(&rank);
            rank += 1;
        }
        self.selected = ranks.end.min(rank).saturating_sub(ranks.start.min(rank));
    }

    fn intersect_with(&mut self, keep: impl Fn(usize) -> bool) {
        for (i, flag) in self.mask.iter_mut().enumerate() {
            if *flag {
                *flag = keep(i);
            }
        }
        self.recount();
    }

    fn recount(&mut self) {
        self.selected = self.mask.iter().filter(|&&b| b).count();
    }
}

/// A raw selection handed to `set_filter_by_selection`.
///
/// With `intersect = false` a selection is read against the whole axis; with
/// `intersect = true` it is read against the currently selected positions, in order.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum Selection {
    Mask(Vec<bool>),
    Indices(Vec<usize>),
    Range(Range<usize>),
}

impl From<Vec<bool>> for Selection {
    fn from(mask: Vec<bool>) -> Self {
        Selection::Mask(mask)
    }
}

impl From<Vec<usize>> for Selection {
    fn from(indices: Vec<usize>) -> Self {
        Selection::Indices(indices)
    }
}

impl From<Range<usize>> for Selection {
    fn from(range: Range<usize>) -> Self {
        Selection::Range(range)
    }
}

// --- Filter pair and stack ---

/// The (sample, variant) filter pair saved and restored by the filter stack.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct FilterState {
    pub samples: AxisFilter,
    pub variants: AxisFilter,
}

impl FilterState {
    pub fn all(num_samples: usize, num_variants: usize) -> Self {
        Self {
            samples: AxisFilter::all(num_samples),
            variants: AxisFilter::all(num_variants),
        }
    }

    pub fn axis(&self, axis: Axis) -> &AxisFilter {
        match axis {
            Axis::Sample => &self.samples,
            Axis::Variant => &self.variants,
        }
    }

    pub fn axis_mut(&mut self, axis: Axis) -> &mut AxisFilter {
        match axis {
            Axis::Sample => &mut self.samples,
            Axis::Variant => &mut self.variants,
        }
    }
}

/// Live filters of one open handle plus the LIFO stack of saved filter pairs.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct FilterStore {
    live: FilterState,
    stack: Vec<FilterState>,
}

impl FilterStore {
    pub fn new(num_samples: usize, num_variants: usize) -> Self {
        Self {
            live: FilterState::all(num_samples, num_variants),
            stack: Vec::new(),
        }
    }

    pub fn live(&self) -> &FilterState {
        &self.live
    }

    pub fn get(&self, axis: Axis) -> &AxisFilter {
        self.live.axis(axis)
    }

    pub fn depth(&self) -> usize {
        self.stack.len()
    }

    /// Selects the positions whose identifier appears in `wanted`.
    ///
    /// Every wanted id must exist on the axis; otherwise nothing changes and
    /// `UnknownIdentifier` is returned.
    pub fn set_by_ids<S: AsRef<str>>(
        &mut self,
        axis: Axis,
        axis_ids: &[String],
        wanted: &[S],
        intersect: bool,
    ) -> Result<()> {
        let filter = self.ids_filter(axis, axis_ids, wanted, intersect)?;
        self.install(axis, filter);
        Ok(())
    }

    /// Installs a mask, an index list or a range. Validation happens before any change.
    pub fn set_by_selection(&mut self, axis: Axis, selection: &Selection, intersect: bool) -> Result<()> {
        let filter = self.selection_filter(axis, selection, intersect)?;
        self.install(axis, filter);
        Ok(())
    }

    /// The filter `set_by_ids` would install, leaving the live pair untouched.
    pub(crate) fn ids_filter<S: AsRef<str>>(
        &self,
        axis: Axis,
        axis_ids: &[String],
        wanted: &[S],
        intersect: bool,
    ) -> Result<AxisFilter> {
        let wanted: Vec<&str> = wanted.iter().map(|id| id.as_ref()).collect();
        let known: HashSet<&str> = axis_ids.iter().map(String::as_str).collect();
        if let Some(missing) = wanted.iter().find(|id| !known.contains(*id)) {
            return Err(EngineError::UnknownIdentifier {
                axis,
                id: missing.to_string(),
            });
        }
        let wanted: HashSet<&str> = wanted.into_iter().collect();
        let keep = |i: usize| wanted.contains(axis_ids[i].as_str());
        if intersect {
            let mut filter = self.live.axis(axis).clone();
            filter.intersect_with(keep);
            Ok(filter)
        } else {
            Ok(AxisFilter::from_mask((0..axis_ids.len()).map(keep).collect()))
        }
    }

    /// The filter `set_by_selection` would install, leaving the live pair untouched.
    pub(crate) fn selection_filter(&self, axis: Axis, selection: &Selection, intersect: bool) -> Result<AxisFilter> {
        let current = self.live.axis(axis);
        let bound = if intersect { current.selected_count() } else { current.len() };

        // Mask over the candidate positions (whole axis, or current selection).
        let relative: Vec<bool> = match selection {
            Selection::Mask(mask) => {
                if mask.len() != bound {
                    return Err(EngineError::LengthMismatch {
                        axis,
                        expected: bound,
                        found: mask.len(),
                    });
                }
                mask.clone()
            }
            Selection::Indices(indices) => {
                let mut mask = vec![false; bound];
                for &index in indices {
                    if index >= bound {
                        return Err(EngineError::IndexOutOfRange { axis, index, bound });
                    }
                    mask[index] = true;
                }
                mask
            }
            Selection::Range(range) => {
                if range.start > range.end || range.end > bound {
                    return Err(EngineError::IndexOutOfRange {
                        axis,
                        index: range.end.max(range.start),
                        bound,
                    });
                }
                (0..bound).map(|i| range.contains(&i)).collect()
            }
        };

        if intersect {
            let mut filter = current.clone();
            let mut candidates = relative.into_iter();
            for flag in filter.mask.iter_mut().filter(|b| **b) {
                *flag = candidates.next().unwrap_or(false);
            }
            filter.recount();
            Ok(filter)
        } else {
            Ok(AxisFilter::from_mask(relative))
        }
    }

    /// Replaces one live axis filter. The mask must span the axis.
    pub(crate) fn install(&mut self, axis: Axis, filter: AxisFilter) {
        *self.live.axis_mut(axis) = filter;
    }

    /// Selects variants on the listed chromosomes, optionally within inclusive bp ranges
    /// (one per `include` entry). `include = None` selects every variant.
    pub fn set_by_chromosome<S: AsRef<str>>(
        &mut self,
        chromosomes: &[String],
        positions: &[i32],
        include: Option<&[S]>,
        ranges: Option<&[(i32, i32)]>,
        intersect: bool,
    ) -> Result<()> {
        let candidate: Vec<bool> = match include {
            None => vec![true; chromosomes.len()],
            Some(include) => {
                let mut wanted: HashMap<&str, Vec<(i32, i32)>> = HashMap::new();
                match ranges {
                    Some(ranges) => {
                        if ranges.len() != include.len() {
                            return Err(EngineError::LengthMismatch {
                                axis: Axis::Variant,
                                expected: include.len(),
                                found: ranges.len(),
                            });
                        }
                        for (chrom, &(from, to)) in include.iter().zip(ranges) {
                            wanted.entry(chrom.as_ref()).or_default().push((from, to));
                        }
                    }
                    None => {
                        for chrom in include {
                            wanted.entry(chrom.as_ref()).or_default().push((i32::MIN, i32::MAX));
                        }
                    }
                }
                chromosomes
                    .iter()
                    .zip(positions)
                    .map(|(chrom, &pos)| {
                        wanted.get(chrom.as_str()).map_or(false, |spans| {
                            spans.iter().any(|&(from, to)| from <= pos && pos <= to)
                        })
                    })
                    .collect()
            }
        };

        let filter = self.live.axis_mut(Axis::Variant);
        if intersect {
            filter.intersect_with(|i| candidate[i]);
        } else {
            *filter = AxisFilter::from_mask(candidate);
        }
        Ok(())
    }

    pub fn reset(&mut self, axis: Axis) {
        let len = self.live.axis(axis).len();
        *self.live.axis_mut(axis) = AxisFilter::all(len);
    }

    /// Saves the live pair; with `reset_after` both axes then select everything.
    pub fn push(&mut self, reset_after: bool) {
        self.stack.push(self.live.clone());
        if reset_after {
            self.reset(Axis::Sample);
            self.reset(Axis::Variant);
        }
    }

    /// Restores the most recently pushed pair.
    pub fn pop(&mut self) -> Result<()> {
        let top = self.stack.pop().ok_or(EngineError::EmptyStack)?;
        self.live = top;
        Ok(())
    }

    /// Replaces the live pair, e.g. with a snapshot taken in another handle.
    pub(crate) fn restore(&mut self, state: FilterState) -> Result<()> {
        for axis in [Axis::Sample, Axis::Variant] {
            let expected = self.live.axis(axis).len();
            let found = state.axis(axis).len();
            if expected != found {
                return Err(EngineError::LengthMismatch { axis, expected, found });
            }
        }
        self.live = state;
        Ok(())
    }

    /// Drops every stack entry at or above `depth` and makes `saved` live again.
    /// Returns false when entries below `depth` were already gone.
    pub(crate) fn unwind_to(&mut self, depth: usize, saved: FilterState) -> bool {
        let intact = self.stack.len() >= depth;
        self.stack.truncate(depth);
        self.live = saved;
        intact
    }

    pub(crate) fn narrow(&mut self, axis: Axis, ranks: Range<usize>) {
        self.live.axis_mut(axis).narrow_to_ranks(ranks);
    }
}
