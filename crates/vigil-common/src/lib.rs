pub mod duration;
pub mod error;
pub mod task;
pub mod time;

pub use error::{Result, VigilError};
pub use task::{PeriodicTask, Schedule, StopSignal};
