mod log;
mod remote;
mod task;

pub use log::*;
pub use remote::*;
pub use task::*;
