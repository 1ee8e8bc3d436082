pub mod core_registry;
pub mod models;
pub mod monitor;
pub mod ports;
pub mod profile;
pub mod score;

pub use core_registry::*;
pub use dataflow_core::{SchedulerError, SchedulerResult};
pub use models::*;
pub use monitor::*;
pub use ports::*;
pub use profile::*;
pub use score::*;
