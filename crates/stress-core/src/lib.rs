pub mod client;
pub mod config;
pub mod error;
pub mod hooks;
pub mod report;
pub mod result;
pub mod share;
pub mod stats;
mod step;
pub mod task;
pub mod tracer;
mod transaction;

pub use client::*;
pub use config::*;
pub use error::*;
pub use hooks::*;
pub use report::*;
pub use result::*;
pub use share::*;
pub use stats::*;
pub use task::*;
pub use tracer::*;
