pub mod backup;
pub mod compose;
pub mod config;
pub mod definition;
pub mod deploy;
pub mod envfile;
pub mod error;
pub mod git;
pub mod io;
pub mod locks;
pub mod paths;
pub mod process;
pub mod remote;
pub mod removal;
pub mod runner;
pub mod runtime;
pub mod scheduler;
pub mod stack;

pub use error::{Result, StackrError};
