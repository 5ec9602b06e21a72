// tests/engine.rs
//
// End-to-end runs over file-backed stores.

use std::path::{Path, PathBuf};

use ndarray::Array2;
use seqapply::{
    ApplyOptions, Axis, Block, ColumnData, Combine, Combined, EngineError, FileHandle,
    OpenOptions, Selection, SplitMode, Workers,
};

fn write_vcf(dir: &Path) -> PathBuf {
    let path = dir.join("cohort.vcf");
    let mut text = String::from(
        "##fileformat=VCFv4.3\n\
         ##contig=<ID=1,length=100000>\n\
         ##contig=<ID=2,length=100000>\n\
         ##FORMAT=<ID=GT,Number=1,Type=String,Description=\"Genotype\">\n\
         #CHROM\tPOS\tID\tREF\tALT\tQUAL\tFILTER\tINFO\tFORMAT",
    );
    for s in 0..6 {
        text.push_str(&format!("\tS{}", s));
    }
    text.push('\n');
    for v in 0..10 {
        let chrom = if v < 6 { "1" } else { "2" };
        text.push_str(&format!("{}\t{}\tv{}\tA\tC\t.\tPASS\t.\tGT", chrom, 1000 + 10 * v, v));
        for s in 0..6 {
            let gt = match (v + s) % 4 {
                0 => "0/0",
                1 => "0/1",
                2 => "1/1",
                _ => "./.",
            };
            text.push('\t');
            text.push_str(gt);
        }
        text.push('\n');
    }
    std::fs::write(&path, text).unwrap();
    path
}

fn count_block(block: &Block, _: &()) -> Result<Array2<u64>, EngineError> {
    let dosage = block
        .get("$dosage")
        .and_then(ColumnData::as_dosage)
        .ok_or_else(|| EngineError::UnknownVariable("$dosage".into()))?;
    let mut counts = Array2::<u64>::zeros((2, dosage.nrows()));
    for (v, row) in dosage.rows().into_iter().enumerate() {
        for &d in row.iter().filter(|&&d| d >= 0) {
            counts[[0, v]] += d as u64;
            counts[[1, v]] += 1;
        }
    }
    Ok(counts)
}

fn count_worker(handle: &mut FileHandle, block_size: &usize) -> Result<Array2<u64>, EngineError> {
    let combine: Combine<Array2<u64>> = Combine::flatten();
    let out = handle.apply(
        &["$dosage"],
        count_block,
        &(),
        &combine,
        &ApplyOptions::default().with_block_size(*block_size),
    )?;
    Ok(out
        .into_value()
        .filter(|counts| counts.nrows() == 2)
        .unwrap_or_else(|| Array2::zeros((2, 0))))
}

#[test]
fn vcf_counts_agree_across_splits_and_worker_counts() {
    let dir = tempfile::tempdir().unwrap();
    let path = write_vcf(dir.path());
    let mut handle = FileHandle::open(&path, OpenOptions::default()).unwrap();
    handle
        .set_filter_by_ids(Some(&["S0", "S2", "S3", "S5"][..]), None, false, false)
        .unwrap();
    handle
        .set_filter_chrom(Some(&["1"][..]), None, true, false)
        .unwrap();
    assert_eq!(handle.summary(), (4, 6, 6, 10));

    let flatten: Combine<Array2<u64>> = Combine::flatten();
    let expected = handle
        .run_parallel(count_worker, &4, Workers::Sequential, SplitMode::ByVariant, &flatten)
        .unwrap()
        .into_value()
        .unwrap();
    assert_eq!(expected.dim(), (2, 6));

    for workers in [1, 2, 3, 8] {
        for block_size in [1, 2, 5] {
            let by_variant = handle
                .run_parallel(count_worker, &block_size, Workers::Count(workers), SplitMode::ByVariant, &flatten)
                .unwrap();
            assert_eq!(by_variant, Combined::Value(expected.clone()));
        }
    }

    let sum = Combine::reduce(|a: Array2<u64>, b: Array2<u64>| a + b);
    let by_sample = handle
        .run_parallel(count_worker, &3, Workers::Count(3), SplitMode::BySample, &sum)
        .unwrap();
    assert_eq!(by_sample, Combined::Value(expected));
}

#[test]
fn opening_twice_needs_duplicates_allowed() {
    let dir = tempfile::tempdir().unwrap();
    let path = write_vcf(dir.path());
    let first = FileHandle::open(&path, OpenOptions::default()).unwrap();
    assert!(matches!(
        FileHandle::open(&path, OpenOptions::default()),
        Err(EngineError::FileAlreadyOpen(_))
    ));
    let second = FileHandle::open(&path, OpenOptions::duplicate()).unwrap();
    second.close();
    first.close();
    FileHandle::open(&path, OpenOptions::default()).unwrap().close();
}

#[test]
fn scoped_filters_inside_workers_do_not_leak() {
    let dir = tempfile::tempdir().unwrap();
    let path = write_vcf(dir.path());
    let mut handle = FileHandle::open(&path, OpenOptions::default()).unwrap();
    handle
        .set_filter_by_selection(None, Some(&Selection::Range(2..8)), false, false)
        .unwrap();
    let before = handle.filter_state().clone();

    let out = handle
        .run_parallel(
            |h: &mut FileHandle, _: &()| -> Result<(usize, usize), EngineError> {
                let narrowed = h.selected_count(Axis::Variant);
                let everything = h.with_filter_scope(true, |h| h.selected_count(Axis::Variant));
                assert_eq!(h.selected_count(Axis::Variant), narrowed);
                Ok((narrowed, everything))
            },
            &(),
            Workers::Count(4),
            SplitMode::ByVariant,
            &Combine::Collect,
        )
        .unwrap();
    assert_eq!(
        out.into_collected().unwrap(),
        vec![(2, 10), (2, 10), (1, 10), (1, 10)]
    );
    assert_eq!(handle.filter_state(), &before);
    assert_eq!(handle.filter_depth(), 0);
}
