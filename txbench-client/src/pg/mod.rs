//! PostgreSQL connections speaking the v3 frontend/backend protocol.

use clap::Args;

use crate::{ClientError, Connection, Connector};

mod connection;

pub use connection::PgConnection;

/// Where and as whom to connect.
#[derive(Debug, Clone, Args)]
pub struct PgConfig {
    /// Database server host or socket directory
    #[arg(short = 'h', long, env = "PGHOST", default_value = "localhost")]
    pub host: String,

    /// Database server port number
    #[arg(short = 'p', long, env = "PGPORT", default_value_t = 5432)]
    pub port: u16,

    /// Connect as the specified database user
    #[arg(short = 'U', long = "username", env = "PGUSER")]
    pub user: Option<String>,

    /// Password used when the server asks for one
    #[arg(long, env = "PGPASSWORD", hide_env_values = true)]
    pub password: Option<String>,

    /// Database to connect to, defaults to the user name
    #[arg(env = "PGDATABASE")]
    pub dbname: Option<String>,
}

impl Default for PgConfig {
    fn default() -> Self {
        Self {
            host: "localhost".into(),
            port: 5432,
            user: None,
            password: None,
            dbname: None,
        }
    }
}

impl PgConfig {
    pub fn user(&self) -> String {
        self.user
            .clone()
            .or_else(|| std::env::var("USER").ok())
            .unwrap_or_else(|| "postgres".into())
    }

    pub fn dbname(&self) -> String {
        self.dbname.clone().unwrap_or_else(|| self.user())
    }

    /// Whether `host` names a Unix-domain socket directory.
    pub fn is_unix_socket(&self) -> bool {
        self.host.starts_with('/')
    }
}

/// Opens [`PgConnection`]s.
#[derive(Debug, Clone)]
pub struct PgConnector {
    config: PgConfig,
}

impl PgConnector {
    pub fn new(config: PgConfig) -> Self {
        Self { config }
    }

    pub fn config(&self) -> &PgConfig {
        &self.config
    }
}

impl Connector for PgConnector {
    fn connect(&self) -> Result<Box<dyn Connection>, ClientError> {
        Ok(Box::new(PgConnection::connect(&self.config)?))
    }
}
