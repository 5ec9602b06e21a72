// bed.rs
//
// PLINK .bed/.bim/.fam backend read through bed-reader.

use std::path::{Path, PathBuf};

use bed_reader::{Bed, ReadOptions};
use log::{debug, info};
use ndarray::{Array2, Array3};

use crate::error::{EngineError, Result};
use crate::store::{GenotypeStore, StoreMeta, StoreSource, MISSING_I8};

/// A PLINK fileset. Metadata is loaded once; every genotype read opens its own `Bed` reader,
/// so a handle never shares reader state with another handle.
#[derive(Debug)]
pub struct BedStore {
    source: StoreSource,
    bed_file_path: PathBuf,
    meta: StoreMeta,
}

impl BedStore {
    pub fn open(path: impl AsRef<Path>) -> Result<Self> {
        let bed_file_path = path.as_ref().to_path_buf();
        info!("Opening PLINK fileset: {}", bed_file_path.display());
        let mut bed = Bed::new(&bed_file_path).map_err(|e| {
            EngineError::storage(format!(
                "failed to open BED file '{}': {}",
                bed_file_path.display(),
                e
            ))
        })?;

        let allele_1 = bed.allele_1()?.to_owned();
        let allele_2 = bed.allele_2()?.to_owned();
        let meta = StoreMeta {
            sample_ids: bed.iid()?.to_vec(),
            variant_ids: bed.sid()?.to_vec(),
            chromosomes: bed.chromosome()?.to_vec(),
            positions: bed.bp_position()?.to_vec(),
            alleles: allele_1
                .iter()
                .zip(allele_2.iter())
                .map(|(a1, a2)| format!("{},{}", a1, a2))
                .collect(),
            ploidy: 2,
        };
        debug!(
            "BED metadata loaded: {} samples, {} variants.",
            meta.sample_ids.len(),
            meta.variant_ids.len()
        );

        Ok(Self {
            source: StoreSource::Bed(bed_file_path.clone()),
            bed_file_path,
            meta,
        })
    }

    /// Allele-1 counts, sample x variant as bed-reader returns them.
    fn read_counts(&self, samples: &[usize], variants: &[usize]) -> Result<Array2<i8>> {
        let iid_index: Vec<isize> = samples.iter().map(|&i| i as isize).collect();
        let sid_index: Vec<isize> = variants.iter().map(|&i| i as isize).collect();
        let mut bed = Bed::new(&self.bed_file_path)?;
        let counts = ReadOptions::builder()
            .iid_index(&iid_index)
            .sid_index(&sid_index)
            .i8()
            .count_a1()
            .read(&mut bed)?;
        Ok(counts)
    }
}

impl GenotypeStore for BedStore {
    fn source(&self) -> &StoreSource {
        &self.source
    }

    fn meta(&self) -> &StoreMeta {
        &self.meta
    }

    fn read_genotypes(&mut self, samples: &[usize], variants: &[usize]) -> Result<Array3<i8>> {
        let dosage = self.read_dosage(samples, variants)?;
        let mut genotypes = Array3::<i8>::zeros((variants.len(), samples.len(), 2));
        for ((v, s), &count) in dosage.indexed_iter() {
            let call = match count {
                2 => [0, 0],
                1 => [0, 1],
                0 => [1, 1],
                _ => [MISSING_I8, MISSING_I8],
            };
            genotypes[[v, s, 0]] = call[0];
            genotypes[[v, s, 1]] = call[1];
        }
        Ok(genotypes)
    }

    /// Allele 0 is the .bim A1 allele, so the A1 count is the dosage directly.
    fn read_dosage(&mut self, samples: &[usize], variants: &[usize]) -> Result<Array2<i8>> {
        if samples.is_empty() || variants.is_empty() {
            return Ok(Array2::zeros((variants.len(), samples.len())));
        }
        let counts = self.read_counts(samples, variants)?;
        Ok(counts.t().to_owned())
    }
}
