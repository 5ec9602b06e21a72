// parallel.rs
//
// Splits the current selection across worker threads, each owning its own FileHandle, and
// combines the per-worker results in worker order.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use log::{debug, info, warn};
use rayon::ThreadPool;

use crate::combine::{Combine, Combined};
use crate::error::{EngineError, Result, ThreadSafeStdError};
use crate::filter::FilterState;
use crate::handle::{FileHandle, OpenOptions};
use crate::split::SplitMode;
use crate::store::StoreSource;

/// How many workers `run_parallel` uses.
#[derive(Clone, Debug, Default)]
pub enum Workers {
    /// One less than the available cores, at least one.
    #[default]
    Auto,
    /// A fixed count; `Count(0)` behaves like `Auto`.
    Count(usize),
    /// Run on an existing pool with as many workers as it has threads.
    Pool(Arc<ThreadPool>),
    /// No workers: the callback runs once on the calling thread over the full selection.
    Sequential,
}

impl Workers {
    /// Number of workers this setting dispatches; 0 for `Sequential`.
    pub fn resolve(&self) -> usize {
        match self {
            Workers::Auto | Workers::Count(0) => num_cpus::get().saturating_sub(1).max(1),
            Workers::Count(n) => *n,
            Workers::Pool(pool) => pool.current_num_threads().max(1),
            Workers::Sequential => 0,
        }
    }
}

/// How a worker obtains its own view of the caller's store.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum DispatchStrategy {
    /// Workers receive a clone of the caller's open handle, filters included.
    SharedState,
    /// Workers reopen the store by path and re-apply a snapshot of the caller's filters.
    Reopen,
}

impl DispatchStrategy {
    pub fn for_handle(handle: &FileHandle) -> Self {
        if handle.shares_handles() {
            DispatchStrategy::SharedState
        } else {
            DispatchStrategy::Reopen
        }
    }
}

/// What one worker starts from.
enum WorkerStart<'a> {
    Shared(FileHandle),
    Reopen {
        source: &'a StoreSource,
        filters: &'a FilterState,
    },
}

impl WorkerStart<'_> {
    fn into_handle(self) -> Result<FileHandle> {
        match self {
            WorkerStart::Shared(handle) => Ok(handle),
            WorkerStart::Reopen { source, filters } => {
                let mut handle = FileHandle::open_source(source, OpenOptions::duplicate())?;
                handle.restore_filters(filters.clone())?;
                Ok(handle)
            }
        }
    }
}

fn worker_failure(worker: usize, source: impl Into<ThreadSafeStdError>) -> EngineError {
    EngineError::WorkerFailure {
        worker,
        source: source.into(),
    }
}

fn run_worker<T, E, P, F>(
    worker: usize,
    workers: usize,
    split: SplitMode,
    start: WorkerStart<'_>,
    f: &F,
    param: &P,
) -> Result<T>
where
    E: Into<ThreadSafeStdError>,
    P: ?Sized,
    F: Fn(&mut FileHandle, &P) -> std::result::Result<T, E>,
{
    let mut handle = start.into_handle().map_err(|e| worker_failure(worker, e))?;
    handle
        .narrow_to_split(worker, workers, split)
        .map_err(|e| worker_failure(worker, e))?;
    let (selected_samples, _, selected_variants, _) = handle.summary();
    debug!(
        "Worker {} starting with {} samples x {} variants.",
        worker, selected_samples, selected_variants
    );
    f(&mut handle, param).map_err(|e| worker_failure(worker, e))
}

fn build_pool(workers: usize) -> Result<ThreadPool> {
    rayon::ThreadPoolBuilder::new()
        .num_threads(workers)
        .thread_name(|i| format!("seqapply-worker-{}", i))
        .build()
        .map_err(|e| EngineError::ThreadPool(e.to_string()))
}

impl FileHandle {
    /// Runs `f` once per worker, each on its own handle narrowed to the worker's share of the
    /// `split` axis, and combines the returned values in worker-index order.
    ///
    /// The caller's filters are left untouched. If any worker fails, the error of the failing
    /// worker with the lowest index is returned as `WorkerFailure` and no result is combined.
    /// With `Workers::Sequential`, `f` runs once on this handle and its error comes back as is.
    pub fn run_parallel<T, E, P, F>(
        &mut self,
        f: F,
        param: &P,
        workers: Workers,
        split: SplitMode,
        combine: &Combine<T>,
    ) -> std::result::Result<Combined<T>, E>
    where
        T: Send,
        E: From<EngineError> + Into<ThreadSafeStdError>,
        P: Sync + ?Sized,
        F: Fn(&mut FileHandle, &P) -> std::result::Result<T, E> + Sync,
    {
        if let Workers::Sequential = workers {
            debug!("Running without workers on the calling thread.");
            let output = f(self, param)?;
            return Ok(combine.finish(vec![output])?);
        }
        Ok(self.dispatch(&f, param, workers, split, combine)?)
    }

    fn dispatch<T, E, P, F>(
        &mut self,
        f: &F,
        param: &P,
        workers: Workers,
        split: SplitMode,
        combine: &Combine<T>,
    ) -> Result<Combined<T>>
    where
        T: Send,
        E: Into<ThreadSafeStdError>,
        P: Sync + ?Sized,
        F: Fn(&mut FileHandle, &P) -> std::result::Result<T, E> + Sync,
    {
        let num_workers = match split {
            SplitMode::None => 1,
            _ => workers.resolve(),
        };
        let strategy = DispatchStrategy::for_handle(self);
        info!(
            "Dispatching {} worker(s), split {}, {:?} strategy.",
            num_workers, split, strategy
        );

        let source = self.source().clone();
        let filters = self.filter_state().clone();
        let mut starts = Vec::with_capacity(num_workers);
        for _ in 0..num_workers {
            let start = match strategy {
                DispatchStrategy::SharedState => match self.share() {
                    Some(handle) => WorkerStart::Shared(handle),
                    None => return Err(EngineError::config("store reported shared handles but refused to share")),
                },
                DispatchStrategy::Reopen => {
                    if source.path().is_none() {
                        return Err(EngineError::config("a store without a path cannot be reopened by workers"));
                    }
                    WorkerStart::Reopen {
                        source: &source,
                        filters: &filters,
                    }
                }
            };
            starts.push(start);
        }

        let owned_pool;
        let pool: &ThreadPool = match &workers {
            Workers::Pool(pool) => pool,
            _ => {
                owned_pool = build_pool(num_workers)?;
                &owned_pool
            }
        };

        let abort = AtomicBool::new(false);
        let (tx, rx) = flume::unbounded::<(usize, Result<T>)>();
        {
            let abort = &abort;
            pool.scope(|scope| {
                for (worker, start) in starts.into_iter().enumerate() {
                    let tx = tx.clone();
                    scope.spawn(move |_| {
                        if abort.load(Ordering::Acquire) {
                            debug!("Worker {} skipped after an earlier failure.", worker);
                            return;
                        }
                        let result = run_worker(worker, num_workers, split, start, f, param);
                        if result.is_err() {
                            abort.store(true, Ordering::Release);
                        }
                        // The receiver outlives the scope.
                        let _ = tx.send((worker, result));
                    });
                }
            });
        }
        drop(tx);

        let mut slots: Vec<Option<T>> = (0..num_workers).map(|_| None).collect();
        let mut failure: Option<(usize, EngineError)> = None;
        for (worker, result) in rx.drain() {
            match result {
                Ok(output) => slots[worker] = Some(output),
                Err(e) => {
                    if failure.as_ref().map_or(true, |(first, _)| worker < *first) {
                        failure = Some((worker, e));
                    }
                }
            }
        }
        if let Some((worker, e)) = failure {
            warn!("Worker {} failed; discarding all worker results.", worker);
            return Err(e);
        }

        let mut outputs = Vec::with_capacity(num_workers);
        for (worker, slot) in slots.into_iter().enumerate() {
            match slot {
                Some(output) => outputs.push(output),
                None => return Err(worker_failure(worker, "worker produced no result")),
            }
        }
        combine.finish(outputs)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::apply::ApplyOptions;
    use crate::filter::Selection;
    use crate::store::tests::toy_store;
    use crate::store::{Axis, ColumnData};
    use anyhow::anyhow;
    use std::sync::atomic::AtomicUsize;

    /// Per selected variant: sum of called allele-0 counts.
    fn dosage_totals(handle: &mut FileHandle, block_size: &usize) -> std::result::Result<Vec<i32>, EngineError> {
        let flat: Combine<Vec<i32>> = Combine::flatten();
        let out = handle.apply(
            &["$dosage"],
            |block, _: &()| {
                let dosage = block.get("$dosage").and_then(ColumnData::as_dosage);
                Ok::<_, EngineError>(dosage.map_or_else(Vec::new, |d| {
                    d.rows()
                        .into_iter()
                        .map(|row| row.iter().filter(|&&x| x >= 0).map(|&x| x as i32).sum::<i32>())
                        .collect()
                }))
            },
            &(),
            &flat,
            &ApplyOptions::default().with_block_size(*block_size),
        )?;
        Ok(out.into_value().unwrap_or_default())
    }

    #[test]
    fn one_worker_matches_the_sequential_path() {
        let mut handle = FileHandle::from_memory(toy_store());
        let flat: Combine<Vec<i32>> = Combine::flatten();
        let sequential = handle
            .run_parallel(dosage_totals, &2, Workers::Sequential, SplitMode::ByVariant, &flat)
            .unwrap();
        let single = handle
            .run_parallel(dosage_totals, &2, Workers::Count(1), SplitMode::ByVariant, &flat)
            .unwrap();
        assert_eq!(sequential, single);
        assert_eq!(sequential.into_value().unwrap().len(), 5);
    }

    #[test]
    fn worker_order_is_deterministic_for_any_count() {
        let mut handle = FileHandle::from_memory(toy_store());
        handle
            .set_filter_by_selection(Some(&Selection::Range(1..4)), None, false, false)
            .unwrap();
        let flat: Combine<Vec<i32>> = Combine::flatten();
        let expected = handle
            .run_parallel(dosage_totals, &1, Workers::Sequential, SplitMode::ByVariant, &flat)
            .unwrap();
        for workers in 1..=7 {
            let out = handle
                .run_parallel(dosage_totals, &1, Workers::Count(workers), SplitMode::ByVariant, &flat)
                .unwrap();
            assert_eq!(out, expected, "{} workers", workers);
        }
        // The caller's filters are unchanged by the run.
        assert_eq!(handle.summary(), (3, 4, 5, 5));
    }

    #[test]
    fn reduce_folds_worker_outputs_left_to_right() {
        let mut handle = FileHandle::from_memory(toy_store());
        handle
            .set_filter_by_selection(None, Some(&Selection::Range(0..3)), false, false)
            .unwrap();
        let values = [10i64, 20, 5];
        let per_worker = |h: &mut FileHandle, values: &[i64; 3]| -> std::result::Result<String, EngineError> {
            let own = h.get_filter(Axis::Variant).selected_indices();
            Ok(own.iter().map(|&v| values[v]).sum::<i64>().to_string())
        };

        let trace = Combine::reduce(|a: String, b: String| format!("({}+{})", a, b));
        let out = handle
            .run_parallel(per_worker, &values, Workers::Count(3), SplitMode::ByVariant, &trace)
            .unwrap();
        assert_eq!(out.into_value().unwrap(), "((10+20)+5)");

        let sum = Combine::reduce(|a: i64, b: i64| a + b);
        let out = handle
            .run_parallel(
                |h: &mut FileHandle, values: &[i64; 3]| -> std::result::Result<i64, EngineError> {
                    Ok(h.get_filter(Axis::Variant).selected_indices().iter().map(|&v| values[v]).sum())
                },
                &values,
                Workers::Count(3),
                SplitMode::ByVariant,
                &sum,
            )
            .unwrap();
        assert_eq!(out, Combined::Value(35));
    }

    #[test]
    fn failing_worker_is_identified() {
        let mut handle = FileHandle::from_memory(toy_store());
        let err = handle
            .run_parallel(
                |h: &mut FileHandle, _: &()| {
                    if h.get_filter(Axis::Variant).is_selected(3) {
                        Err(anyhow!("variant 3 is not allowed"))
                    } else {
                        Ok(1u32)
                    }
                },
                &(),
                Workers::Count(2),
                SplitMode::ByVariant,
                &Combine::Collect,
            )
            .unwrap_err();
        match err.downcast_ref::<EngineError>() {
            Some(EngineError::WorkerFailure { worker, source }) => {
                assert_eq!(*worker, 1);
                assert_eq!(source.to_string(), "variant 3 is not allowed");
            }
            other => panic!("unexpected error: {:?}", other),
        }
    }

    #[test]
    fn sequential_errors_come_back_unwrapped() {
        let mut handle = FileHandle::from_memory(toy_store());
        let err = handle
            .run_parallel(
                |_: &mut FileHandle, _: &()| Err::<(), _>(EngineError::EmptyStack),
                &(),
                Workers::Sequential,
                SplitMode::ByVariant,
                &Combine::Discard,
            )
            .unwrap_err();
        assert!(matches!(err, EngineError::EmptyStack));

        let err = handle
            .run_parallel(
                |_: &mut FileHandle, _: &()| Err::<(), _>(anyhow!("boom")),
                &(),
                Workers::Sequential,
                SplitMode::ByVariant,
                &Combine::Discard,
            )
            .unwrap_err();
        assert_eq!(err.to_string(), "boom");
        assert!(err.downcast_ref::<EngineError>().is_none());
    }

    #[test]
    fn split_none_runs_a_single_worker_over_everything() {
        let mut handle = FileHandle::from_memory(toy_store());
        let calls = AtomicUsize::new(0);
        let out = handle
            .run_parallel(
                |h: &mut FileHandle, calls: &AtomicUsize| -> std::result::Result<usize, EngineError> {
                    calls.fetch_add(1, Ordering::SeqCst);
                    Ok(h.selected_count(Axis::Variant))
                },
                &calls,
                Workers::Count(4),
                SplitMode::None,
                &Combine::Collect,
            )
            .unwrap();
        assert_eq!(out, Combined::Collected(vec![5]));
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn surplus_workers_see_empty_selections() {
        let mut handle = FileHandle::from_memory(toy_store());
        handle
            .set_filter_by_selection(None, Some(&Selection::Indices(vec![1, 4])), false, false)
            .unwrap();
        let out = handle
            .run_parallel(
                |h: &mut FileHandle, _: &()| -> std::result::Result<Vec<usize>, EngineError> {
                    Ok(h.get_filter(Axis::Variant).selected_indices())
                },
                &(),
                Workers::Count(4),
                SplitMode::ByVariant,
                &Combine::Collect,
            )
            .unwrap();
        assert_eq!(out, Combined::Collected(vec![vec![1], vec![4], vec![], vec![]]));
    }

    #[test]
    fn split_by_sample_partitions_samples() {
        let mut handle = FileHandle::from_memory(toy_store());
        let out = handle
            .run_parallel(
                |h: &mut FileHandle, _: &()| -> std::result::Result<Vec<String>, EngineError> {
                    let ids = h.get_data("sample.id")?;
                    Ok(ids.as_text().map(|a| a.to_vec()).unwrap_or_default())
                },
                &(),
                Workers::Count(3),
                SplitMode::BySample,
                &Combine::flatten(),
            )
            .unwrap();
        assert_eq!(out.into_value().unwrap(), vec!["S0", "S1", "S2", "S3"]);
    }

    #[test]
    fn adopted_pool_sets_the_worker_count() {
        let pool = Arc::new(build_pool(2).unwrap());
        assert_eq!(Workers::Pool(Arc::clone(&pool)).resolve(), 2);
        assert!(Workers::Auto.resolve() >= 1);
        assert_eq!(Workers::Count(0).resolve(), Workers::Auto.resolve());
        assert_eq!(Workers::Sequential.resolve(), 0);

        let mut handle = FileHandle::from_memory(toy_store());
        let out = handle
            .run_parallel(
                |h: &mut FileHandle, _: &()| -> std::result::Result<usize, EngineError> {
                    Ok(h.selected_count(Axis::Variant))
                },
                &(),
                Workers::Pool(pool),
                SplitMode::ByVariant,
                &Combine::Collect,
            )
            .unwrap();
        assert_eq!(out, Combined::Collected(vec![3, 2]));
    }

    #[test]
    fn memory_stores_use_the_shared_state_strategy() {
        let handle = FileHandle::from_memory(toy_store());
        assert_eq!(DispatchStrategy::for_handle(&handle), DispatchStrategy::SharedState);
    }

    #[test]
    fn bed_stores_are_reopened_by_each_worker() {
        let dir = tempfile::tempdir().unwrap();
        let path = crate::bed::tests::write_fixture(dir.path());
        let mut handle = FileHandle::open(&path, OpenOptions::default()).unwrap();
        assert_eq!(DispatchStrategy::for_handle(&handle), DispatchStrategy::Reopen);

        handle
            .set_filter_by_ids(Some(&["I1", "I3"][..]), None, false, false)
            .unwrap();
        let flat: Combine<Vec<i32>> = Combine::flatten();
        let sequential = handle
            .run_parallel(dosage_totals, &1, Workers::Sequential, SplitMode::ByVariant, &flat)
            .unwrap();
        let parallel = handle
            .run_parallel(dosage_totals, &1, Workers::Count(3), SplitMode::ByVariant, &flat)
            .unwrap();
        assert_eq!(sequential, parallel);
        // rs1: 2 + 0, rs2: 1 + 2, rs3: 0 + 1, rs4: 2 + 2
        assert_eq!(parallel.into_value().unwrap(), vec![2, 3, 1, 4]);
        handle.close();
    }
}
