pub mod chat;
pub mod consts;

mod api;
mod error;
mod job;
mod models;
mod planner;
mod pool;
mod resume;
mod store;
mod task;

pub use api::*;
pub use error::*;
pub use job::*;
pub use models::*;
pub use planner::*;
pub use pool::*;
pub use resume::*;
pub use store::*;
pub use task::*;
