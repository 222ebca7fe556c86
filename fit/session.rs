//! # Fitting Sessions
//!
//! Runs the per-order optimizer over many orders at once. Orders are fully
//! independent, so each one is moved out of the model, optimized on a rayon
//! worker, and moved back. A failing order is logged and reported without
//! disturbing the others.

use crate::model::{Model, ModelError};
use crate::optimize::{OptimizeError, OptimizeOptions, OrderReport, optimize_order};
use crate::progress::{BarProgress, create_progress_bar};
use crate::spectra::Spectra;
use rayon::prelude::*;
use rayon::{ThreadPool, ThreadPoolBuilder};
use std::collections::BTreeSet;
use std::path::PathBuf;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use thiserror::Error;

#[derive(Error, Debug)]
pub enum SessionError {
    #[error("Failed to build the worker thread pool: {0}")]
    ThreadPool(#[from] rayon::ThreadPoolBuildError),

    #[error("Order {0} was requested more than once.")]
    DuplicateOrder(usize),

    #[error(transparent)]
    Model(#[from] ModelError),
}

#[derive(Debug, Clone, Default)]
pub struct SessionOptions {
    /// Worker threads; `None` uses one per logical core.
    pub threads: Option<usize>,
    pub hide_progress: bool,
    pub optimize: OptimizeOptions,
}

/// Lets another thread ask a running session to stop at the next iteration
/// boundary. The request is consumed when that call to
/// [`FitSession::optimize_orders`] returns.
#[derive(Debug, Clone)]
pub struct StopHandle(Arc<AtomicBool>);

impl StopHandle {
    pub fn request_stop(&self) {
        self.0.store(true, Ordering::Relaxed);
    }

    pub fn is_stop_requested(&self) -> bool {
        self.0.load(Ordering::Relaxed)
    }
}

/// Outcome of optimizing a set of orders.
#[derive(Debug, Default)]
pub struct SessionReport {
    pub completed: Vec<OrderReport>,
    pub failed: Vec<(usize, OptimizeError)>,
}

impl SessionReport {
    pub fn is_success(&self) -> bool {
        self.failed.is_empty()
    }

    /// True when any order ended early on a stop request.
    pub fn stopped(&self) -> bool {
        self.completed.iter().any(|r| r.stopped)
    }
}

pub struct FitSession {
    pool: ThreadPool,
    stop: Arc<AtomicBool>,
    options: SessionOptions,
}

impl FitSession {
    pub fn new(options: SessionOptions) -> Result<Self, SessionError> {
        let mut builder = ThreadPoolBuilder::new();
        if let Some(threads) = options.threads {
            builder = builder.num_threads(threads);
        }
        let pool = builder.build()?;
        log::info!("Fitting session using {} worker threads.", pool.current_num_threads());
        Ok(Self {
            pool,
            stop: Arc::new(AtomicBool::new(false)),
            options,
        })
    }

    pub fn options(&self) -> &SessionOptions {
        &self.options
    }

    pub fn stop_handle(&self) -> StopHandle {
        StopHandle(Arc::clone(&self.stop))
    }

    /// Optimizes `orders` of `data` in parallel, writing every result back
    /// into `model`.
    pub fn optimize_orders(
        &self,
        model: &mut Model,
        data: &Spectra,
        orders: &[usize],
    ) -> Result<SessionReport, SessionError> {
        model.check_dataset(data)?;
        let mut seen = BTreeSet::new();
        for &r in orders {
            if !seen.insert(r) {
                return Err(SessionError::DuplicateOrder(r));
            }
        }

        // --- 1. Move the requested orders out of the model ---
        let settings = model.component_settings();
        let mut taken = Vec::with_capacity(orders.len());
        for &r in orders {
            taken.push((r, model.take_order(r)?));
        }

        // --- 2. Optimize independently ---
        let options = &self.options.optimize;
        let total = (orders.len() * options.niter) as u64;
        let bar = create_progress_bar(total, "Optimizing orders", self.options.hide_progress);
        let results: Vec<_> = self.pool.install(|| {
            taken
                .into_par_iter()
                .map(|(r, mut states)| {
                    let mut observer = BarProgress::new(bar.clone(), Arc::clone(&self.stop));
                    let result = data.order(r).map_err(OptimizeError::from).and_then(|order| {
                        optimize_order(&order, &settings, &mut states, options, &mut observer)
                    });
                    (r, states, result)
                })
                .collect()
        });
        bar.finish_and_clear();
        // A stop request ends one run; the next call starts fresh.
        self.stop.store(false, Ordering::Relaxed);

        // --- 3. Put everything back and sort out failures ---
        let mut report = SessionReport::default();
        for (r, states, result) in results {
            model.restore_order(r, states)?;
            match result {
                Ok(order_report) => {
                    log::info!(
                        "Order {r}: {} iterations, final NLL {:.6e}.",
                        order_report.iterations,
                        order_report.final_nll
                    );
                    report.completed.push(order_report);
                }
                Err(e) => {
                    log::error!("Order {r} failed: {e}");
                    report.failed.push((r, e));
                }
            }
        }
        log::info!(
            "Optimized {} of {} orders ({} failed).",
            report.completed.len(),
            orders.len(),
            report.failed.len()
        );
        Ok(report)
    }

    /// Optimizes every order of the dataset.
    pub fn optimize_all(&self, model: &mut Model, data: &Spectra) -> Result<SessionReport, SessionError> {
        let orders: Vec<usize> = (0..data.n_orders()).collect();
        self.optimize_orders(model, data, &orders)
    }

    /// Where [`FitSession::finish`] writes the model, if checkpointing is on.
    pub fn final_model_path(&self) -> Option<PathBuf> {
        self.options
            .optimize
            .checkpoint
            .as_ref()
            .map(|sink| sink.dir.join(format!("{}_model.toml", sink.basename)))
    }

    /// Saves the full model next to the per-order checkpoints.
    pub fn finish(&self, model: &Model) -> Result<Option<PathBuf>, SessionError> {
        let Some(path) = self.final_model_path() else {
            return Ok(None);
        };
        model.save(&path)?;
        log::info!("Model written to {}.", path.display());
        Ok(Some(path))
    }
}
