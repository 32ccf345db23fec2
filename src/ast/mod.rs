/// Statement compiler for the SQL Server dialect.
///
/// ```text
/// Host ORM builders
///       ↓
/// Typed descriptors   (types.rs)
///       ↓
/// T-SQL compiler      (compiler.rs)
///       ↓
/// Session adapter     (db/ module)
/// ```
///
/// Compilation is pure and synchronous; it never suspends and never
/// writes back into the descriptors.
pub mod compiler;
pub mod types;

// Re-export key types for convenience
pub use compiler::{
    apply_limit, apply_random_order, compile_create_table, compile_drop_table, compile_select,
    quote_ident, quote_literal,
};
pub use types::*;
