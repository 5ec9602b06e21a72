// store.rs
//
// The storage collaborator boundary: what the filter and apply machinery needs from an
// open genotype array store, plus the in-memory store used for loaded VCFs and tests.

use std::collections::HashMap;
use std::fmt;
use std::path::{Path, PathBuf};
use std::str::FromStr;
use std::sync::{Arc, Mutex, OnceLock};

use log::debug;
use ndarray::{Array1, Array2, Array3, Axis as NdAxis};

use crate::error::{EngineError, Result};

/// Missing genotype / dosage code, shared with the bed-reader convention for `i8` reads.
pub const MISSING_I8: i8 = -127;

// --- Axes ---

/// One of the two selectable dimensions of a store.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum Axis {
    /// Rows: samples.
    Sample,
    /// Columns: variants.
    Variant,
}

impl Axis {
    pub fn other(self) -> Axis {
        match self {
            Axis::Sample => Axis::Variant,
            Axis::Variant => Axis::Sample,
        }
    }

    pub(crate) fn plural(self) -> &'static str {
        match self {
            Axis::Sample => "samples",
            Axis::Variant => "variants",
        }
    }
}

impl fmt::Display for Axis {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Axis::Sample => write!(f, "sample"),
            Axis::Variant => write!(f, "variant"),
        }
    }
}

// --- Variables ---

/// A readable variable of a store.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum Variable {
    SampleId,
    VariantId,
    Position,
    Chromosome,
    Allele,
    /// Allele indices, variant x sample x ploidy.
    Genotype,
    /// Count of allele 0 per call, variant x sample.
    Dosage,
    /// `chr_pos` labels, unique within a run of repeated sites.
    ChromPos,
    /// Number of alleles listed for each variant.
    NumAllele,
}

impl Variable {
    pub fn name(self) -> &'static str {
        match self {
            Variable::SampleId => "sample.id",
            Variable::VariantId => "variant.id",
            Variable::Position => "position",
            Variable::Chromosome => "chromosome",
            Variable::Allele => "allele",
            Variable::Genotype => "genotype",
            Variable::Dosage => "$dosage",
            Variable::ChromPos => "$chrom_pos",
            Variable::NumAllele => "$num_allele",
        }
    }

    /// The axis the variable's leading dimension runs along.
    pub fn axis(self) -> Axis {
        match self {
            Variable::SampleId => Axis::Sample,
            _ => Axis::Variant,
        }
    }
}

impl FromStr for Variable {
    type Err = EngineError;

    fn from_str(s: &str) -> Result<Self> {
        match s {
            "sample.id" => Ok(Variable::SampleId),
            "variant.id" => Ok(Variable::VariantId),
            "position" => Ok(Variable::Position),
            "chromosome" => Ok(Variable::Chromosome),
            "allele" => Ok(Variable::Allele),
            "genotype" => Ok(Variable::Genotype),
            "$dosage" => Ok(Variable::Dosage),
            "$chrom_pos" => Ok(Variable::ChromPos),
            "$num_allele" => Ok(Variable::NumAllele),
            other => Err(EngineError::UnknownVariable(other.to_string())),
        }
    }
}

impl fmt::Display for Variable {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

/// Columnar data returned for one variable over a set of selected positions.
#[derive(Clone, Debug, PartialEq)]
pub enum ColumnData {
    Int(Array1<i32>),
    Text(Array1<String>),
    /// variant x sample, `MISSING_I8` for missing calls.
    Dosage(Array2<i8>),
    /// variant x sample x ploidy, `MISSING_I8` for missing alleles.
    Genotype(Array3<i8>),
}

impl ColumnData {
    /// Extent of the leading dimension.
    pub fn len(&self) -> usize {
        match self {
            ColumnData::Int(a) => a.len(),
            ColumnData::Text(a) => a.len(),
            ColumnData::Dosage(a) => a.nrows(),
            ColumnData::Genotype(a) => a.len_of(NdAxis(0)),
        }
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn as_int(&self) -> Option<&Array1<i32>> {
        match self {
            ColumnData::Int(a) => Some(a),
            _ => None,
        }
    }

    pub fn as_text(&self) -> Option<&Array1<String>> {
        match self {
            ColumnData::Text(a) => Some(a),
            _ => None,
        }
    }

    pub fn as_dosage(&self) -> Option<&Array2<i8>> {
        match self {
            ColumnData::Dosage(a) => Some(a),
            _ => None,
        }
    }

    pub fn as_genotype(&self) -> Option<&Array3<i8>> {
        match self {
            ColumnData::Genotype(a) => Some(a),
            _ => None,
        }
    }
}

// --- Store metadata ---

/// Per-axis metadata every store carries, loaded once when the store is opened.
#[derive(Clone, Debug, Default, PartialEq)]
pub struct StoreMeta {
    pub sample_ids: Vec<String>,
    pub variant_ids: Vec<String>,
    pub chromosomes: Vec<String>,
    pub positions: Vec<i32>,
    /// Comma-separated allele list per variant, allele 0 first.
    pub alleles: Vec<String>,
    pub ploidy: usize,
}

impl StoreMeta {
    pub fn cardinality(&self, axis: Axis) -> usize {
        match axis {
            Axis::Sample => self.sample_ids.len(),
            Axis::Variant => self.variant_ids.len(),
        }
    }

    pub fn ids(&self, axis: Axis) -> &[String] {
        match axis {
            Axis::Sample => &self.sample_ids,
            Axis::Variant => &self.variant_ids,
        }
    }

    fn validate(&self) -> Result<()> {
        let num_variants = self.variant_ids.len();
        for (found, what) in [
            (self.chromosomes.len(), "chromosome"),
            (self.positions.len(), "position"),
            (self.alleles.len(), "allele"),
        ] {
            if found != num_variants {
                return Err(EngineError::storage(format!(
                    "store metadata has {} variants but {} {} entries",
                    num_variants, found, what
                )));
            }
        }
        if self.ploidy == 0 {
            return Err(EngineError::storage("store ploidy must be at least 1"));
        }
        Ok(())
    }

    /// Reads every variable that is answered from metadata alone.
    fn read_metadata(
        &self,
        variable: Variable,
        samples: &[usize],
        variants: &[usize],
    ) -> Option<ColumnData> {
        let pick_text = |values: &[String], idx: &[usize]| {
            ColumnData::Text(idx.iter().map(|&i| values[i].clone()).collect())
        };
        match variable {
            Variable::SampleId => Some(pick_text(&self.sample_ids, samples)),
            Variable::VariantId => Some(pick_text(&self.variant_ids, variants)),
            Variable::Chromosome => Some(pick_text(&self.chromosomes, variants)),
            Variable::Allele => Some(pick_text(&self.alleles, variants)),
            Variable::Position => Some(ColumnData::Int(
                variants.iter().map(|&i| self.positions[i]).collect(),
            )),
            Variable::ChromPos => Some(ColumnData::Text(chrom_pos_labels(
                variants
                    .iter()
                    .map(|&i| (self.chromosomes[i].as_str(), self.positions[i])),
            ))),
            Variable::NumAllele => Some(ColumnData::Int(
                variants
                    .iter()
                    .map(|&i| self.alleles[i].split(',').filter(|a| !a.is_empty()).count() as i32)
                    .collect(),
            )),
            Variable::Genotype | Variable::Dosage => None,
        }
    }
}

fn chrom_pos_labels<'a>(sites: impl Iterator<Item = (&'a str, i32)>) -> Array1<String> {
    let mut labels = Vec::new();
    let mut previous = String::new();
    let mut dup = 0usize;
    for (chrom, pos) in sites {
        let label = format!("{}_{}", chrom, pos);
        if label == previous {
            dup += 1;
            labels.push(format!("{}_{}", label, dup));
        } else {
            dup = 0;
            labels.push(label.clone());
            previous = label;
        }
    }
    Array1::from_vec(labels)
}

/// Collapses allele indices into a count of allele 0 per call.
pub fn dosage_from_genotypes(genotypes: &Array3<i8>) -> Array2<i8> {
    let (num_variants, num_samples, _) = genotypes.dim();
    let mut dosage = Array2::<i8>::zeros((num_variants, num_samples));
    for ((v, s), out) in dosage.indexed_iter_mut() {
        let call = genotypes.slice(ndarray::s![v, s, ..]);
        *out = if call.iter().any(|&a| a < 0) {
            MISSING_I8
        } else {
            call.iter().filter(|&&a| a == 0).count() as i8
        };
    }
    dosage
}

// --- Collaborator trait ---

/// Where an open store came from, kept so a worker can reopen it independently.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum StoreSource {
    Memory,
    Bed(PathBuf),
    Vcf(PathBuf),
}

impl StoreSource {
    pub fn path(&self) -> Option<&Path> {
        match self {
            StoreSource::Memory => None,
            StoreSource::Bed(p) | StoreSource::Vcf(p) => Some(p),
        }
    }
}

/// One open connection to a genotype array store.
///
/// Index arguments are absolute positions on the store's axes, in ascending order.
pub trait GenotypeStore: Send {
    fn source(&self) -> &StoreSource;

    fn meta(&self) -> &StoreMeta;

    /// Allele indices for the requested cells, variant x sample x ploidy.
    fn read_genotypes(&mut self, samples: &[usize], variants: &[usize]) -> Result<Array3<i8>>;

    fn read_dosage(&mut self, samples: &[usize], variants: &[usize]) -> Result<Array2<i8>> {
        Ok(dosage_from_genotypes(&self.read_genotypes(samples, variants)?))
    }

    /// Whether `share` can hand a worker this store without reopening it.
    fn shares_handles(&self) -> bool {
        false
    }

    fn share(&self) -> Option<Box<dyn GenotypeStore>> {
        None
    }

    fn cardinality(&self, axis: Axis) -> usize {
        self.meta().cardinality(axis)
    }

    fn ids(&self, axis: Axis) -> &[String] {
        self.meta().ids(axis)
    }

    fn read(&mut self, variable: Variable, samples: &[usize], variants: &[usize]) -> Result<ColumnData> {
        if let Some(data) = self.meta().read_metadata(variable, samples, variants) {
            return Ok(data);
        }
        match variable {
            Variable::Dosage => Ok(ColumnData::Dosage(self.read_dosage(samples, variants)?)),
            _ => Ok(ColumnData::Genotype(self.read_genotypes(samples, variants)?)),
        }
    }
}

// --- In-memory store ---

/// Genotype array store held entirely in memory. Handles share the underlying arrays.
#[derive(Clone, Debug)]
pub struct MemoryStore {
    source: StoreSource,
    meta: Arc<StoreMeta>,
    genotypes: Arc<Array3<i8>>,
}

impl MemoryStore {
    /// `genotypes` is variant x sample x ploidy.
    pub fn new(meta: StoreMeta, genotypes: Array3<i8>) -> Result<Self> {
        Self::with_source(StoreSource::Memory, meta, genotypes)
    }

    pub(crate) fn with_source(source: StoreSource, meta: StoreMeta, genotypes: Array3<i8>) -> Result<Self> {
        meta.validate()?;
        let expected = (meta.variant_ids.len(), meta.sample_ids.len(), meta.ploidy);
        if genotypes.dim() != expected {
            return Err(EngineError::storage(format!(
                "genotype array has shape {:?}, expected {:?} (variant x sample x ploidy)",
                genotypes.dim(),
                expected
            )));
        }
        debug!(
            "In-memory store ready: {} samples x {} variants, ploidy {}.",
            meta.sample_ids.len(),
            meta.variant_ids.len(),
            meta.ploidy
        );
        Ok(Self {
            source,
            meta: Arc::new(meta),
            genotypes: Arc::new(genotypes),
        })
    }
}

impl GenotypeStore for MemoryStore {
    fn source(&self) -> &StoreSource {
        &self.source
    }

    fn meta(&self) -> &StoreMeta {
        &self.meta
    }

    fn read_genotypes(&mut self, samples: &[usize], variants: &[usize]) -> Result<Array3<i8>> {
        Ok(self
            .genotypes
            .select(NdAxis(0), variants)
            .select(NdAxis(1), samples))
    }

    fn shares_handles(&self) -> bool {
        true
    }

    fn share(&self) -> Option<Box<dyn GenotypeStore>> {
        Some(Box::new(self.clone()))
    }
}

// --- Open-file registry ---

fn open_files() -> &'static Mutex<HashMap<PathBuf, usize>> {
    static OPEN_FILES: OnceLock<Mutex<HashMap<PathBuf, usize>>> = OnceLock::new();
    OPEN_FILES.get_or_init(|| Mutex::new(HashMap::new()))
}

/// Marks a path as open in this process until dropped.
#[derive(Debug)]
pub(crate) struct OpenRegistration {
    path: PathBuf,
}

impl OpenRegistration {
    pub(crate) fn acquire(path: &Path, allow_duplicate: bool) -> Result<Self> {
        let key = std::fs::canonicalize(path).unwrap_or_else(|_| path.to_path_buf());
        let mut open = open_files().lock().unwrap_or_else(|poisoned| poisoned.into_inner());
        let count = open.entry(key.clone()).or_insert(0);
        if *count > 0 && !allow_duplicate {
            return Err(EngineError::FileAlreadyOpen(path.to_path_buf()));
        }
        *count += 1;
        Ok(Self { path: key })
    }
}

impl Drop for OpenRegistration {
    fn drop(&mut self) {
        let mut open = open_files().lock().unwrap_or_else(|poisoned| poisoned.into_inner());
        if let Some(count) = open.get_mut(&self.path) {
            *count -= 1;
            if *count == 0 {
                open.remove(&self.path);
            }
        }
    }
}
