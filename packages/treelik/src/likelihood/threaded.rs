use crate::accel::instance::AccelerationBackend;
use crate::alignment::patterns::Patterns;
use crate::likelihood::config::LikelihoodConfig;
use crate::likelihood::{create_single_likelihood, LikelihoodCalculator, ModelContext};
use crate::make_error;
use crate::utils::error::panic_message;
use eyre::{Report, WrapErr};
use itertools::Itertools;
use log::{debug, warn};
use rayon::prelude::*;
use rayon::{ThreadPool, ThreadPoolBuilder};
use std::ops::Range;
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::Arc;

/// Splits `pattern_count` patterns into `workers` contiguous, non-empty, covering ranges.
///
/// Without proportions the ranges are as even as possible. Proportions are reused cyclically when there are fewer of
/// them than workers, normalized, and accumulated into rounded boundaries.
pub fn partition_patterns(pattern_count: usize, workers: usize, proportions: Option<&[f64]>) -> Vec<Range<usize>> {
  assert!(
    workers >= 1 && workers <= pattern_count,
    "Cannot split {pattern_count} patterns between {workers} workers"
  );

  let mut boundaries = vec![0; workers + 1];
  match proportions {
    Some(proportions) if !proportions.is_empty() => {
      let weights = (0..workers).map(|i| proportions[i % proportions.len()]).collect_vec();
      let total: f64 = weights.iter().sum();
      let mut cumulative = 0.0;
      for (i, weight) in weights.iter().enumerate() {
        cumulative += weight / total;
        boundaries[i + 1] = (cumulative * pattern_count as f64).round() as usize;
      }
    }
    _ => {
      for (i, boundary) in boundaries.iter_mut().enumerate() {
        *boundary = i * pattern_count / workers;
      }
    }
  }

  // Keep every range non-empty while leaving room for the ranges after it
  boundaries[workers] = pattern_count;
  for i in 1..workers {
    boundaries[i] = boundaries[i].clamp(boundaries[i - 1] + 1, pattern_count - (workers - i));
  }

  boundaries.iter().tuple_windows().map(|(&start, &end)| start..end).collect_vec()
}

/// Sum of independent engines, each over a contiguous range of patterns, evaluated in parallel
pub struct ThreadedTreeLikelihood {
  ranges: Vec<Range<usize>>,
  workers: Vec<Box<dyn LikelihoodCalculator>>,
  pool: ThreadPool,
  log_p: f64,
  stored_log_p: f64,
}

impl ThreadedTreeLikelihood {
  pub fn new(
    config: &LikelihoodConfig,
    patterns: &Patterns,
    ctx: &ModelContext,
    backend: Arc<dyn AccelerationBackend>,
  ) -> Result<Self, Report> {
    let pattern_count = patterns.pattern_count();
    let mut n_workers = config.threads.clamp(1, pattern_count);
    if patterns.is_ascertained() && n_workers > 1 {
      warn!("Ascertainment correction spans all patterns: computing the likelihood in a single worker");
      n_workers = 1;
    }

    let proportions = config.proportions()?;
    let ranges = partition_patterns(pattern_count, n_workers, proportions.as_deref());
    debug!(
      "Splitting {pattern_count} patterns between {n_workers} workers: {}",
      ranges.iter().map(|range| format!("{range:?}")).join(", ")
    );

    let workers = ranges
      .iter()
      .enumerate()
      .map(|(i, range)| {
        let subset = if n_workers == 1 {
          patterns.clone()
        } else {
          patterns.subset(range.clone())
        };
        create_single_likelihood(config, &subset, ctx, backend.as_ref())
          .wrap_err_with(|| format!("When creating likelihood worker {i} for patterns {range:?}"))
      })
      .collect::<Result<Vec<_>, Report>>()?;

    let pool = ThreadPoolBuilder::new()
      .num_threads(n_workers)
      .thread_name(|i| format!("likelihood-worker-{i}"))
      .build()
      .wrap_err("When creating likelihood worker pool")?;

    Ok(Self {
      ranges,
      workers,
      pool,
      log_p: f64::NAN,
      stored_log_p: f64::NAN,
    })
  }

  pub fn ranges(&self) -> &[Range<usize>] {
    &self.ranges
  }

  pub fn worker_count(&self) -> usize {
    self.workers.len()
  }
}

impl LikelihoodCalculator for ThreadedTreeLikelihood {
  fn calculate_log_p(&mut self, ctx: &ModelContext) -> Result<f64, Report> {
    let Self {
      pool, workers, ranges, ..
    } = self;

    let results: Vec<Result<f64, Report>> = pool.install(|| {
      workers
        .par_iter_mut()
        .map(|worker| {
          catch_unwind(AssertUnwindSafe(|| worker.calculate_log_p(ctx)))
            .unwrap_or_else(|payload| make_error!("Likelihood worker panicked: {}", panic_message(payload.as_ref())))
        })
        .collect()
    });

    let mut log_p = 0.0;
    for (i, result) in results.into_iter().enumerate() {
      log_p += result.wrap_err_with(|| format!("In likelihood worker {i} for patterns {:?}", ranges[i]))?;
    }

    self.log_p = log_p;
    Ok(log_p)
  }

  fn log_p(&self) -> f64 {
    self.log_p
  }

  fn pattern_log_likelihoods(&self) -> Vec<f64> {
    self.workers.iter().flat_map(|worker| worker.pattern_log_likelihoods()).collect()
  }

  fn make_dirty(&mut self) {
    self.workers.iter_mut().for_each(|worker| worker.make_dirty());
  }

  fn store(&mut self) {
    self.workers.iter_mut().for_each(|worker| worker.store());
    self.stored_log_p = self.log_p;
  }

  fn restore(&mut self) {
    self.workers.iter_mut().for_each(|worker| worker.restore());
    std::mem::swap(&mut self.log_p, &mut self.stored_log_p);
  }
}
