pub mod ast;
pub mod db;
pub mod error;

pub use error::{CompileError, DriverError, Error, Result};
