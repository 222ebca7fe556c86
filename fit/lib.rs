#![deny(unused_variables)]
#![deny(dead_code)]
#![deny(unused_imports)]
#![deny(clippy::no_effect_underscore_binding)]
pub mod adam;
pub mod component;
pub mod config;
pub mod doppler;
pub mod history;
pub mod interp;
pub mod model;
pub mod optimize;
pub mod progress;
pub mod session;

#[path = "../spectra/mod.rs"]
pub mod spectra;

pub use component::{Component, ComponentKind, Template};
pub use config::FitConfig;
pub use history::History;
pub use model::Model;
pub use optimize::{OptimizeOptions, Penalties};
pub use session::{FitSession, SessionOptions};
pub use spectra::Spectra;
