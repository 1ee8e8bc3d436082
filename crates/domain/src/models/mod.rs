pub mod data;
pub mod implementation;
pub mod parameter;
pub mod resources;
pub mod task;

pub use data::*;
pub use implementation::*;
pub use parameter::*;
pub use resources::*;
pub use task::*;

pub type TaskId = u64;
pub type AppId = u64;
pub type ActionId = u64;
pub type JobId = u64;
pub type DataId = u64;
pub type CoreId = usize;
pub type ImplId = usize;
