// main.rs

// --- External Crate Imports ---
use anyhow::{anyhow, Error, Result};
use clap::Parser;
use log::{debug, info, warn};
use ndarray::Array2;
use seqapply::{
    ApplyOptions, Axis, Block, ColumnData, Combine, Combined, EngineError, FileHandle,
    OpenOptions, SplitMode, Variable, Workers,
};
use std::{
    fs::{self, File},
    io::{BufWriter, Write},
    path::Path,
    time::Instant,
};

// --- Main Function ---
fn main() -> Result<(), Error> {
    let total_time_start = Instant::now();
    let cli_args = cli::CliArgs::parse();

    // Initialize logger
    let log_level = cli_args
        .log_level
        .parse::<log::LevelFilter>()
        .unwrap_or_else(|_| {
            eprintln!(
                "Warning: Invalid log level '{}' provided. Defaulting to Info.",
                cli_args.log_level
            );
            log::LevelFilter::Info
        });
    env_logger::Builder::new()
        .filter_level(log_level)
        .format_timestamp_micros()
        .init();

    info!("Starting seqapply with args: {:?}", cli_args);

    let split: SplitMode = cli_args.split.parse()?;
    if cli_args.block_size == 0 {
        return Err(anyhow!("--block-size must be a positive integer"));
    }

    // --- 1. Open the store and install filters ---
    let mut handle = FileHandle::open(&cli_args.input, OpenOptions::default())?;
    info!(
        "Opened {}: {} samples x {} variants.",
        cli_args.input.display(),
        handle.cardinality(Axis::Sample),
        handle.cardinality(Axis::Variant)
    );

    if let Some(path) = &cli_args.samples {
        let ids = read_id_list(path)?;
        handle.set_filter_by_ids(Some(&ids[..]), None, false, true)?;
    }
    if let Some(path) = &cli_args.variants {
        let ids = read_id_list(path)?;
        handle.set_filter_by_ids(None, Some(&ids[..]), false, true)?;
    }
    if let Some(chrom) = &cli_args.chrom {
        let include: Vec<&str> = chrom.split(',').map(str::trim).filter(|c| !c.is_empty()).collect();
        handle.set_filter_chrom(Some(&include[..]), None, true, true)?;
    }

    let (num_samples, _, num_variants, _) = handle.summary();
    if num_variants == 0 {
        warn!("No variants selected; the output will only contain a header.");
    }

    // --- 2. Count alleles in parallel ---
    let workers = if cli_args.sequential {
        Workers::Sequential
    } else {
        cli_args.threads.map_or(Workers::Auto, Workers::Count)
    };
    let combine = match split {
        // Every worker counts all variants over its own samples.
        SplitMode::BySample => Combine::reduce(|a: Array2<u64>, b: Array2<u64>| a + b),
        SplitMode::ByVariant | SplitMode::None => Combine::flatten(),
    };
    let options = ApplyOptions::default()
        .with_block_size(cli_args.block_size)
        .with_verbose(cli_args.progress);

    let counts = match handle.run_parallel(freq::count_worker, &options, workers, split, &combine)? {
        Combined::Value(counts) => counts,
        _ => Array2::zeros((2, 0)),
    };
    if counts.ncols() != num_variants {
        return Err(anyhow!(
            "Worker counts cover {} variants, expected {}",
            counts.ncols(),
            num_variants
        ));
    }

    // --- 3. Write results ---
    output_writer::write_frequencies(&cli_args.output_prefix, &mut handle, &counts, num_samples)?;
    handle.close();

    info!(
        "seqapply finished successfully in {:.2?}.",
        total_time_start.elapsed()
    );
    Ok(())
}

fn read_id_list(path: &Path) -> Result<Vec<String>> {
    let ids: Vec<String> = fs::read_to_string(path)
        .map_err(|e| anyhow!("Failed to read id list {}: {}", path.display(), e))?
        .lines()
        .map(str::trim)
        .filter(|line| !line.is_empty() && !line.starts_with('#'))
        .map(String::from)
        .collect();
    debug!("Read {} ids from {}.", ids.len(), path.display());
    Ok(ids)
}

// --- Module Implementations ---

mod cli {
    use std::path::PathBuf;
    use clap::Parser; // For the derive macro to find Parser

    #[derive(Parser, Debug)]
    #[command(author, version, about = "Per-variant allele counts over a filtered genotype store.", long_about = None, propagate_version = true)]
    pub(crate) struct CliArgs {
        /// PLINK .bed file or VCF (.vcf / .vcf.gz).
        pub(crate) input: PathBuf,

        #[arg(long)]
        pub(crate) samples: Option<PathBuf>,

        #[arg(long)]
        pub(crate) variants: Option<PathBuf>,

        /// Comma-separated chromosomes to keep.
        #[arg(long)]
        pub(crate) chrom: Option<String>,

        #[arg(short, long = "out", required = true)]
        pub(crate) output_prefix: String,

        #[arg(short = 't', long)]
        pub(crate) threads: Option<usize>,

        #[arg(long, default_value_t = seqapply::DEFAULT_BLOCK_SIZE)]
        pub(crate) block_size: usize,

        /// by.variant, by.sample or none.
        #[arg(long, default_value = "by.variant")]
        pub(crate) split: String,

        #[arg(long)]
        pub(crate) sequential: bool,

        #[arg(long)]
        pub(crate) progress: bool,

        #[arg(long, default_value = "Info")]
        pub(crate) log_level: String,
    }
}

mod freq {
    use super::{ApplyOptions, Array2, Block, ColumnData, Combine, EngineError, FileHandle, Variable};

    /// Row 0: allele-0 count; row 1: called samples. One column per variant in the block.
    fn count_block(block: &Block, _: &()) -> Result<Array2<u64>, EngineError> {
        let dosage = block
            .variable(Variable::Dosage)
            .and_then(ColumnData::as_dosage)
            .ok_or_else(|| EngineError::UnknownVariable(Variable::Dosage.to_string()))?;
        let mut counts = Array2::<u64>::zeros((2, dosage.nrows()));
        for (v, row) in dosage.rows().into_iter().enumerate() {
            for &d in row.iter().filter(|&&d| d >= 0) {
                counts[[0, v]] += d as u64;
                counts[[1, v]] += 1;
            }
        }
        Ok(counts)
    }

    pub(crate) fn count_worker(handle: &mut FileHandle, options: &ApplyOptions) -> Result<Array2<u64>, EngineError> {
        let combine: Combine<Array2<u64>> = Combine::flatten();
        let counts = handle
            .apply(&["$dosage"], count_block, &(), &combine, options)?
            .into_value()
            .filter(|counts| counts.nrows() == 2);
        Ok(counts.unwrap_or_else(|| Array2::zeros((2, 0))))
    }
}

mod output_writer {
    use super::{anyhow, info, Result, Array2, File, BufWriter, Write, FileHandle};

    fn create_output_file(prefix: &str, suffix: &str) -> Result<BufWriter<File>> {
        let filename = format!("{}.{}", prefix, suffix);
        File::create(&filename)
            .map(BufWriter::new)
            .map_err(|e| anyhow!("Failed to create output file {}: {}", filename, e))
    }

    fn text_column(handle: &mut FileHandle, name: &str) -> Result<Vec<String>> {
        let data = handle.get_data(name)?;
        data.as_text()
            .map(|a| a.to_vec())
            .ok_or_else(|| anyhow!("Variable {} is not textual", name))
    }

    pub(crate) fn write_frequencies(
        output_prefix: &str,
        handle: &mut FileHandle,
        counts: &Array2<u64>,
        num_samples: usize,
    ) -> Result<()> {
        let variant_ids = text_column(handle, "variant.id")?;
        let chromosomes = text_column(handle, "chromosome")?;
        let alleles = text_column(handle, "allele")?;
        let positions = handle.get_data("position")?;
        let positions = positions
            .as_int()
            .ok_or_else(|| anyhow!("Variable position is not integer"))?;
        let ploidy = handle.ploidy() as f64;

        let mut writer = create_output_file(output_prefix, "freq.tsv")?;
        info!("Writing allele frequencies to {}.freq.tsv", output_prefix);

        writeln!(writer, "VariantID\tChrom\tPos\tAlleles\tAllele0Freq\tMissingRate\tCalled")?;
        for (v, variant_id) in variant_ids.iter().enumerate() {
            let allele0 = counts[[0, v]];
            let called = counts[[1, v]];
            write!(
                writer,
                "{}\t{}\t{}\t{}",
                variant_id, chromosomes[v], positions[v], alleles[v]
            )?;
            if called > 0 {
                write!(writer, "\t{:.6}", allele0 as f64 / (ploidy * called as f64))?;
            } else {
                write!(writer, "\tNA")?;
            }
            if num_samples > 0 {
                write!(writer, "\t{:.6}", 1.0 - called as f64 / num_samples as f64)?;
            } else {
                write!(writer, "\tNA")?;
            }
            writeln!(writer, "\t{}", called)?;
        }
        writer.flush()?;
        Ok(())
    }
}
