// vcf.rs
//
// Loads a VCF (plain or bgzipped) into an in-memory store.

use std::path::Path;

use log::{debug, info, warn};
use ndarray::Array3;
use noodles_vcf::{
    self as vcf,
    variant::record::{
        samples::series::Value, samples::Series as VcfSeriesTrait, AlternateBases as _,
        Ids as _,
    },
};

use crate::error::{EngineError, Result};
use crate::store::{MemoryStore, StoreMeta, StoreSource, MISSING_I8};

const PLOIDY: usize = 2;

/// Parses a textual GT such as `0/1`, `1|1`, `./.` or `0` into allele indices.
///
/// Haploid calls are padded with a missing allele; extra alleles beyond diploid are dropped.
fn parse_gt(gt: &str) -> Option<[i8; PLOIDY]> {
    let mut call = [MISSING_I8; PLOIDY];
    for (slot, allele) in gt.split(['/', '|']).enumerate() {
        if slot >= PLOIDY {
            break;
        }
        call[slot] = match allele {
            "." => MISSING_I8,
            digits => {
                let index: u8 = digits.parse().ok()?;
                i8::try_from(index).ok()?
            }
        };
    }
    Some(call)
}

fn site_label(record: &vcf::Record) -> String {
    format!(
        "{}:{}",
        record.reference_sequence_name(),
        record
            .variant_start()
            .map_or(0u64, |res_p| res_p.map_or(0u64, |p| p.get() as u64))
    )
}

/// Reads every record of `path`. Variant ids come from the ID column, or
/// `chr:pos:ref:alt` when it is empty.
pub fn load_vcf(path: &Path) -> Result<MemoryStore> {
    info!("Loading VCF: {}", path.display());
    let mut reader = vcf::io::reader::Builder::default().build_from_path(path)?;
    let header = reader.read_header()?;
    let sample_ids: Vec<String> = header.sample_names().iter().cloned().collect();
    let num_samples = sample_ids.len();

    let gt_key = vcf::variant::record::samples::keys::key::GENOTYPE.as_ref();
    if num_samples > 0 && !header.formats().contains_key(gt_key) {
        return Err(EngineError::storage(format!(
            "GT key (FORMAT={}) not found in FORMAT header of {}",
            gt_key,
            path.display()
        )));
    }

    let mut meta = StoreMeta {
        sample_ids,
        ploidy: PLOIDY,
        ..StoreMeta::default()
    };
    let mut calls: Vec<i8> = Vec::new();
    let mut record = vcf::Record::default();

    while reader.read_record(&mut record)? != 0 {
        let chrom = record.reference_sequence_name().to_string();
        let position = match record.variant_start() {
            Some(p) => i32::try_from(p?.get()).map_err(|_| {
                EngineError::storage(format!("position of {} does not fit in i32", site_label(&record)))
            })?,
            None => 0,
        };
        let reference = record.reference_bases().to_string();
        let alternate_bases = record.alternate_bases();
        let alternates = alternate_bases
            .iter()
            .collect::<std::io::Result<Vec<&str>>>()?;
        let mut alleles = vec![reference.as_str()];
        alleles.extend(alternates.iter().copied());

        let id = record
            .ids()
            .iter()
            .next()
            .map(str::to_string)
            .unwrap_or_else(|| format!("{}:{}:{}:{}", chrom, position, reference, alternates.join(",")));

        let mut row = vec![MISSING_I8; num_samples * PLOIDY];
        if let Some(series) = record.samples().select(gt_key) {
            for (sample, value) in series.iter(&header).enumerate() {
                if sample >= num_samples {
                    warn!(
                        "More GT values than samples at {} in {}; extra values ignored.",
                        site_label(&record),
                        path.display()
                    );
                    break;
                }
                let call = match value.map_err(|e| {
                    EngineError::storage(format!("bad GT at {}: {}", site_label(&record), e))
                })? {
                    Some(Value::String(gt)) => parse_gt(gt.as_ref()),
                    Some(Value::Genotype(genotype)) => {
                        let mut call = [MISSING_I8; PLOIDY];
                        let mut ok = true;
                        for (slot, item) in genotype.iter().enumerate().take(PLOIDY) {
                            match item {
                                Ok((Some(index), _phasing)) => match i8::try_from(index) {
                                    Ok(index) => call[slot] = index,
                                    Err(_) => ok = false,
                                },
                                Ok((None, _)) => {}
                                Err(_) => ok = false,
                            }
                        }
                        ok.then_some(call)
                    }
                    Some(other) => {
                        debug!(
                            "GT of sample {} at {} has unexpected type {:?}; treated as missing.",
                            sample,
                            site_label(&record),
                            other
                        );
                        None
                    }
                    None => None,
                };
                match call {
                    Some(call) => row[sample * PLOIDY..(sample + 1) * PLOIDY].copy_from_slice(&call),
                    None => debug!(
                        "Unparsable GT for sample {} at {}; treated as missing.",
                        sample,
                        site_label(&record)
                    ),
                }
            }
        }

        calls.extend_from_slice(&row);
        meta.variant_ids.push(id);
        meta.chromosomes.push(chrom);
        meta.positions.push(position);
        meta.alleles.push(alleles.join(","));
    }

    let num_variants = meta.variant_ids.len();
    info!(
        "Loaded {} variants x {} samples from {}.",
        num_variants,
        num_samples,
        path.display()
    );
    let genotypes = Array3::from_shape_vec((num_variants, num_samples, PLOIDY), calls)
        .map_err(|e| EngineError::storage(format!("genotype array shape: {}", e)))?;
    MemoryStore::with_source(StoreSource::Vcf(path.to_path_buf()), meta, genotypes)
}
