use indicatif::{ProgressBar, ProgressDrawTarget, ProgressStyle};
use std::io::IsTerminal;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

/// Observer for reporting incremental progress while optimizing one order.
pub trait OptimizeObserver {
    fn on_order_start(&mut self, order: usize, niter: usize) {
        let _ = (order, niter);
    }
    fn on_iteration(&mut self, order: usize, iteration: usize, nll: f64) {
        let _ = (order, iteration, nll);
    }
    fn on_order_finish(&mut self, order: usize, completed: usize) {
        let _ = (order, completed);
    }
    /// Polled at every iteration boundary; `true` ends the order early.
    fn should_stop(&self) -> bool {
        false
    }
}

#[derive(Default)]
pub struct NoopProgress;

impl OptimizeObserver for NoopProgress {}

/// Drives a shared progress bar and honors a shared stop flag.
#[derive(Clone)]
pub struct BarProgress {
    bar: ProgressBar,
    stop: Arc<AtomicBool>,
}

impl BarProgress {
    pub fn new(bar: ProgressBar, stop: Arc<AtomicBool>) -> Self {
        Self { bar, stop }
    }
}

impl OptimizeObserver for BarProgress {
    fn on_order_start(&mut self, order: usize, niter: usize) {
        log::debug!("Optimizing order {order} for {niter} iterations.");
    }

    fn on_iteration(&mut self, order: usize, iteration: usize, nll: f64) {
        self.bar.inc(1);
        if iteration == 0 {
            self.bar.set_message(format!("order {order}: nll {nll:.4e}"));
        }
    }

    fn on_order_finish(&mut self, order: usize, completed: usize) {
        log::debug!("Order {order} finished after {completed} iterations.");
    }

    fn should_stop(&self) -> bool {
        self.stop.load(Ordering::Relaxed)
    }
}

/// A bar over `len` iterations, drawn only when stderr is a terminal.
pub fn create_progress_bar(len: u64, message: &str, hidden: bool) -> ProgressBar {
    let draw_target = if !hidden && std::io::stderr().is_terminal() {
        ProgressDrawTarget::stderr_with_hz(20)
    } else {
        ProgressDrawTarget::hidden()
    };

    let pb = ProgressBar::with_draw_target(Some(len), draw_target);
    let style = ProgressStyle::with_template(
        "\n> [{elapsed_precise}] [{bar:40.cyan/blue}] {pos}/{len} ({eta}) {msg}",
    )
    .unwrap_or_else(|_| ProgressStyle::default_bar())
    .progress_chars("█▉▊▋▌▍▎▏  ");
    pb.set_style(style);
    pb.set_message(message.to_string());

    pb
}
