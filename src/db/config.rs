use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;

/// Generic connection settings as the host ORM supplies them.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct ConnectionConfig {
    pub host: String,
    pub port: u16,
    pub database: String,
    pub user: String,
    #[serde(skip_serializing)]
    pub password: String,
    /// Applies to connecting, to each request, and to idle pooled connections.
    pub timeout_ms: u64,
    /// Maximum number of pooled physical connections.
    pub max: u32,
    /// ADO-style connection string. When set it wins over the individual fields.
    pub connection_string: Option<String>,
}

impl Default for ConnectionConfig {
    fn default() -> Self {
        Self {
            host: String::from("localhost"),
            port: 1433,
            database: String::from("master"),
            user: String::from("sa"),
            password: String::new(),
            timeout_ms: 5000,
            max: 10,
            connection_string: None,
        }
    }
}

/// Pool settings in the shape the SQL Server driver expects.
#[derive(Debug, Clone, Serialize, PartialEq)]
#[serde(untagged)]
pub enum PoolOptions {
    ConnectionString(String),
    Fields(ServerOptions),
}

#[derive(Debug, Clone, Serialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct ServerOptions {
    pub server: String,
    pub port: u16,
    pub database: String,
    pub user: String,
    #[serde(skip_serializing)]
    pub password: String,
    #[serde(with = "millis")]
    pub connection_timeout: Duration,
    #[serde(with = "millis")]
    pub request_timeout: Duration,
    pub pool: PoolLimits,
}

#[derive(Debug, Clone, Serialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct PoolLimits {
    pub max: u32,
    pub min: u32,
    #[serde(with = "millis")]
    pub idle_timeout: Duration,
}

mod millis {
    use serde::Serializer;
    use std::time::Duration;

    pub fn serialize<S: Serializer>(value: &Duration, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_u64(value.as_millis() as u64)
    }
}

impl ConnectionConfig {
    /// Key under which this configuration's pool is registered.
    ///
    /// Two configurations with the same signature share one pool. The
    /// password is not part of it.
    pub fn signature(&self) -> String {
        match &self.connection_string {
            Some(conn) => conn.clone(),
            None => format!(
                "mssql://{}@{}:{}/{}",
                self.user, self.host, self.port, self.database
            ),
        }
    }

    pub fn display_string(&self) -> String {
        match &self.connection_string {
            Some(_) => String::from("mssql (connection string)"),
            None => format!(
                "{}@{}:{}/{}",
                self.user, self.host, self.port, self.database
            ),
        }
    }

    pub fn timeout(&self) -> Duration {
        Duration::from_millis(self.timeout_ms)
    }

    /// Map the generic settings onto SQL Server pool options.
    pub fn pool_options(&self) -> PoolOptions {
        if let Some(conn) = &self.connection_string {
            return PoolOptions::ConnectionString(conn.clone());
        }
        let timeout = self.timeout();
        PoolOptions::Fields(ServerOptions {
            server: self.host.clone(),
            port: self.port,
            database: self.database.clone(),
            user: self.user.clone(),
            password: self.password.clone(),
            connection_timeout: timeout,
            request_timeout: timeout,
            pool: PoolLimits {
                max: self.max,
                min: 0,
                idle_timeout: timeout,
            },
        })
    }

    pub fn from_toml_str(content: &str) -> Result<Self> {
        toml::from_str(content).context("Failed to parse connection config")
    }

    pub fn load(path: &Path) -> Result<Self> {
        let content = std::fs::read_to_string(path)
            .with_context(|| format!("Failed to read config file: {}", path.display()))?;
        Self::from_toml_str(&content)
    }

    pub fn get_config_path() -> PathBuf {
        dirs::config_dir()
            .unwrap_or_else(|| PathBuf::from("."))
            .join("mssql-adapter")
            .join("connection.toml")
    }
}
