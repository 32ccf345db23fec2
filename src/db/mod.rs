mod config;
mod driver;
mod registry;
mod session;
#[cfg(feature = "mssql")]
pub mod tds;
#[cfg(test)]
mod testing;

pub use config::*;
pub use driver::*;
pub use registry::*;
pub use session::*;
