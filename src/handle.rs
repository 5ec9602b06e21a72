// handle.rs
//
// One open store connection: its genotype source plus the filter state layered on top.

use std::ops::{Deref, DerefMut};
use std::path::{Path, PathBuf};

use log::{debug, info};

use crate::bed::BedStore;
use crate::error::{EngineError, Result};
use crate::filter::{AxisFilter, FilterState, FilterStore, Selection};
use crate::split::SplitMode;
use crate::store::{Axis, ColumnData, GenotypeStore, MemoryStore, OpenRegistration, StoreSource, Variable};
use crate::vcf;

/// How a store file is opened.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct OpenOptions {
    pub read_only: bool,
    /// Permit opening a path that is already open in this process.
    pub allow_duplicate: bool,
}

impl Default for OpenOptions {
    fn default() -> Self {
        Self {
            read_only: true,
            allow_duplicate: false,
        }
    }
}

impl OpenOptions {
    pub fn duplicate() -> Self {
        Self {
            allow_duplicate: true,
            ..Self::default()
        }
    }
}

fn log_selection(verbose: bool, axis: Axis, filter: &AxisFilter) {
    if verbose {
        info!("# of selected {}: {} / {}", axis.plural(), filter.selected_count(), filter.len());
    } else {
        debug!("# of selected {}: {} / {}", axis.plural(), filter.selected_count(), filter.len());
    }
}

/// One open store connection together with its filter state.
pub struct FileHandle {
    store: Box<dyn GenotypeStore>,
    filters: FilterStore,
    registration: Option<OpenRegistration>,
}

impl FileHandle {
    /// Opens a `.bed` (PLINK) or `.vcf`/`.vcf.gz` file.
    pub fn open(path: impl AsRef<Path>, options: OpenOptions) -> Result<Self> {
        let path = path.as_ref();
        let source = if is_vcf_path(path) {
            StoreSource::Vcf(path.to_path_buf())
        } else {
            StoreSource::Bed(path.to_path_buf())
        };
        Self::open_source(&source, options)
    }

    /// Opens a store from a previously captured source description.
    pub fn open_source(source: &StoreSource, options: OpenOptions) -> Result<Self> {
        if !options.read_only {
            return Err(EngineError::config("stores can only be opened read-only"));
        }
        let registration = match source.path() {
            Some(path) => Some(OpenRegistration::acquire(path, options.allow_duplicate)?),
            None => None,
        };
        let store: Box<dyn GenotypeStore> = match source {
            StoreSource::Bed(path) => Box::new(BedStore::open(path)?),
            StoreSource::Vcf(path) => Box::new(vcf::load_vcf(path)?),
            StoreSource::Memory => {
                return Err(EngineError::config(
                    "an in-memory store has no file to open; use FileHandle::from_store",
                ))
            }
        };
        let mut handle = Self::from_store(store);
        handle.registration = registration;
        Ok(handle)
    }

    /// Wraps an already-open store, selecting everything.
    pub fn from_store(store: Box<dyn GenotypeStore>) -> Self {
        let filters = FilterStore::new(store.cardinality(Axis::Sample), store.cardinality(Axis::Variant));
        Self {
            store,
            filters,
            registration: None,
        }
    }

    pub fn from_memory(store: MemoryStore) -> Self {
        Self::from_store(Box::new(store))
    }

    /// Closes the handle and releases its registration.
    pub fn close(self) {
        debug!("Closing store {:?}.", self.store.source());
        drop(self.registration);
    }

    pub fn source(&self) -> &StoreSource {
        self.store.source()
    }

    pub fn path(&self) -> Option<PathBuf> {
        self.store.source().path().map(Path::to_path_buf)
    }

    pub fn cardinality(&self, axis: Axis) -> usize {
        self.store.cardinality(axis)
    }

    pub fn ids(&self, axis: Axis) -> &[String] {
        self.store.ids(axis)
    }

    pub fn ploidy(&self) -> usize {
        self.store.meta().ploidy
    }

    pub(crate) fn shares_handles(&self) -> bool {
        self.store.shares_handles()
    }

    /// A second handle over the same open store with a copy of this handle's filter state.
    pub(crate) fn share(&self) -> Option<FileHandle> {
        self.store.share().map(|store| FileHandle {
            store,
            filters: self.filters.clone(),
            registration: None,
        })
    }

    // --- Filters ---

    pub fn set_filter_by_ids<S: AsRef<str>>(
        &mut self,
        sample_ids: Option<&[S]>,
        variant_ids: Option<&[S]>,
        intersect: bool,
        verbose: bool,
    ) -> Result<()> {
        let mut staged = Vec::with_capacity(2);
        for (axis, wanted) in [(Axis::Sample, sample_ids), (Axis::Variant, variant_ids)] {
            if let Some(wanted) = wanted {
                staged.push((axis, self.filters.ids_filter(axis, self.store.ids(axis), wanted, intersect)?));
            }
        }
        self.install_filters(staged, verbose);
        Ok(())
    }

    pub fn set_filter_by_selection(
        &mut self,
        samples: Option<&Selection>,
        variants: Option<&Selection>,
        intersect: bool,
        verbose: bool,
    ) -> Result<()> {
        let mut staged = Vec::with_capacity(2);
        for (axis, selection) in [(Axis::Sample, samples), (Axis::Variant, variants)] {
            if let Some(selection) = selection {
                staged.push((axis, self.filters.selection_filter(axis, selection, intersect)?));
            }
        }
        self.install_filters(staged, verbose);
        Ok(())
    }

    // Both axes are validated before either is replaced.
    fn install_filters(&mut self, staged: Vec<(Axis, AxisFilter)>, verbose: bool) {
        for (axis, filter) in staged {
            self.filters.install(axis, filter);
            log_selection(verbose, axis, self.filters.get(axis));
        }
    }

    /// Selects variants by chromosome, optionally within inclusive base-pair ranges.
    pub fn set_filter_chrom<S: AsRef<str>>(
        &mut self,
        include: Option<&[S]>,
        ranges: Option<&[(i32, i32)]>,
        intersect: bool,
        verbose: bool,
    ) -> Result<()> {
        let meta = self.store.meta();
        self.filters
            .set_by_chromosome(&meta.chromosomes, &meta.positions, include, ranges, intersect)?;
        log_selection(verbose, Axis::Variant, self.filters.get(Axis::Variant));
        Ok(())
    }

    pub fn reset_filter(&mut self, samples: bool, variants: bool, verbose: bool) {
        for (axis, wanted) in [(Axis::Sample, samples), (Axis::Variant, variants)] {
            if wanted {
                self.filters.reset(axis);
                log_selection(verbose, axis, self.filters.get(axis));
            }
        }
    }

    pub fn push_filter(&mut self, reset_after: bool) {
        self.filters.push(reset_after);
    }

    pub fn pop_filter(&mut self) -> Result<()> {
        self.filters.pop()
    }

    pub fn get_filter(&self, axis: Axis) -> &AxisFilter {
        self.filters.get(axis)
    }

    pub fn filter_state(&self) -> &FilterState {
        self.filters.live()
    }

    pub fn filter_depth(&self) -> usize {
        self.filters.depth()
    }

    pub fn selected_count(&self, axis: Axis) -> usize {
        self.filters.get(axis).selected_count()
    }

    /// `(selected samples, total samples, selected variants, total variants)`.
    pub fn summary(&self) -> (usize, usize, usize, usize) {
        let samples = self.filters.get(Axis::Sample);
        let variants = self.filters.get(Axis::Variant);
        (
            samples.selected_count(),
            samples.len(),
            variants.selected_count(),
            variants.len(),
        )
    }

    pub(crate) fn restore_filters(&mut self, state: FilterState) -> Result<()> {
        self.filters.restore(state)
    }

    /// Pushes the filter pair now; dropping the guard restores exactly that pair and depth.
    pub fn filter_scope(&mut self, reset: bool) -> FilterScope<'_> {
        let depth = self.filters.depth();
        let saved = self.filters.live().clone();
        self.filters.push(reset);
        FilterScope {
            handle: self,
            depth,
            saved: Some(saved),
        }
    }

    /// Runs `f` inside a pushed filter scope; the restore happens on every exit path.
    pub fn with_filter_scope<R>(&mut self, reset: bool, f: impl FnOnce(&mut FileHandle) -> R) -> R {
        let mut scope = self.filter_scope(reset);
        f(&mut *scope)
    }

    /// Narrows the live filter to `worker`'s share of the split axis.
    pub fn narrow_to_split(&mut self, worker: usize, workers: usize, mode: SplitMode) -> Result<()> {
        let Some(axis) = mode.axis() else {
            return Ok(());
        };
        let selected = self.filters.get(axis).selected_count();
        let ranks = mode.range(selected, worker, workers)?;
        debug!(
            "Worker {}/{}: {} positions {:?} of {} selected {}.",
            worker + 1,
            workers,
            axis,
            ranks,
            selected,
            axis.plural()
        );
        self.filters.narrow(axis, ranks);
        Ok(())
    }

    // --- Data ---

    /// Reads a variable over the whole current selection.
    pub fn get_data(&mut self, name: &str) -> Result<ColumnData> {
        let variable: Variable = name.parse()?;
        let samples = self.filters.get(Axis::Sample).selected_indices();
        let variants = self.filters.get(Axis::Variant).selected_indices();
        self.store.read(variable, &samples, &variants)
    }

    pub(crate) fn read_indices(
        &mut self,
        variable: Variable,
        samples: &[usize],
        variants: &[usize],
    ) -> Result<ColumnData> {
        self.store.read(variable, samples, variants)
    }
}

impl std::fmt::Debug for FileHandle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("FileHandle")
            .field("source", self.store.source())
            .field("filters", &self.filters)
            .finish()
    }
}

/// Restores the pushed filter pair on drop.
pub struct FilterScope<'a> {
    handle: &'a mut FileHandle,
    depth: usize,
    saved: Option<FilterState>,
}

impl Deref for FilterScope<'_> {
    type Target = FileHandle;

    fn deref(&self) -> &FileHandle {
        self.handle
    }
}

impl DerefMut for FilterScope<'_> {
    fn deref_mut(&mut self) -> &mut FileHandle {
        self.handle
    }
}

impl Drop for FilterScope<'_> {
    fn drop(&mut self) {
        let Some(saved) = self.saved.take() else {
            return;
        };
        // Entries pushed before the scope must survive it.
        if !self.handle.filters.unwind_to(self.depth, saved) {
            log::warn!(
                "Filter scope popped below its entry depth {}; earlier saved filters are lost.",
                self.depth
            );
        }
    }
}

fn is_vcf_path(path: &Path) -> bool {
    path.file_name()
        .map(|name| name.to_string_lossy().to_ascii_lowercase())
        .map_or(false, |name| name.ends_with(".vcf") || name.ends_with(".vcf.gz"))
}
