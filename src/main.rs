use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use mssql_adapter::ast::{
    apply_limit, apply_random_order, compile_create_table, compile_drop_table, compile_select,
    SelectQuery, TableSchema,
};
use mssql_adapter::db::ConnectionConfig;
use std::path::{Path, PathBuf};
use tracing_subscriber::EnvFilter;

/// Compile ORM descriptors into SQL Server T-SQL
#[derive(Parser)]
#[command(version, about)]
struct Cli {
    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Compile a select descriptor (TOML)
    Select {
        file: PathBuf,
        /// Row count; combined with --offset it paginates
        #[arg(long)]
        limit: Option<u64>,
        #[arg(long)]
        offset: Option<u64>,
        /// Order rows randomly
        #[arg(long)]
        random: bool,
    },
    /// Compile a table schema (TOML) into create table DDL
    CreateTable { file: PathBuf },
    /// Print the drop table statement for a table
    DropTable { name: String },
    /// Print the pool options a connection config maps to, as JSON
    PoolOptions {
        /// Defaults to the user config path
        file: Option<PathBuf>,
    },
}

fn read_toml<T: serde::de::DeserializeOwned>(path: &Path) -> Result<T> {
    let content = std::fs::read_to_string(path)
        .with_context(|| format!("Failed to read {}", path.display()))?;
    toml::from_str(&content).with_context(|| format!("Failed to parse {}", path.display()))
}

fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env())
        .with_writer(std::io::stderr)
        .init();

    let cli = Cli::parse();

    match cli.command {
        Command::Select {
            file,
            limit,
            offset,
            random,
        } => {
            let mut query: SelectQuery = read_toml(&file)?;
            if let Some(count) = limit {
                query = apply_limit(query, count, offset);
            }
            if random {
                query = apply_random_order(query);
            }
            tracing::debug!("Compiling select on {:?}", query.table);
            println!("{}", compile_select(&query)?);
            if !query.bindings.is_empty() {
                println!("-- bindings: {}", serde_json::to_string(&query.bindings)?);
            }
        }
        Command::CreateTable { file } => {
            let table: TableSchema = read_toml(&file)?;
            println!("{}", compile_create_table(&table)?);
        }
        Command::DropTable { name } => {
            println!("{}", compile_drop_table(&name));
        }
        Command::PoolOptions { file } => {
            let path = file.unwrap_or_else(ConnectionConfig::get_config_path);
            let config = ConnectionConfig::load(&path)?;
            tracing::info!("Loaded connection config for {}", config.display_string());
            println!("{}", serde_json::to_string_pretty(&config.pool_options())?);
        }
    }

    Ok(())
}
