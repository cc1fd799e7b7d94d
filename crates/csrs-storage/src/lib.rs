//! Source-store reads and fact-table bulk updates for the CSRS reporting sync.

use std::collections::BTreeMap;
use std::fmt;

use async_trait::async_trait;
use csrs_core::{FormattedNames, GradeRecord, OrganisationNode};
use sqlx::mysql::{MySqlConnectOptions, MySqlPool, MySqlPoolOptions};
use sqlx::postgres::{PgConnectOptions, PgPool, PgPoolOptions};
use sqlx::Row;
use thiserror::Error;
use tracing::{debug, info_span, Instrument};

pub const CRATE_NAME: &str = "csrs-storage";

pub const DEFAULT_FACT_TABLE: &str = "course_completion_events";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StoreKind {
    Source,
    Target,
}

impl fmt::Display for StoreKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Source => f.write_str("source"),
            Self::Target => f.write_str("target"),
        }
    }
}

#[derive(Debug, Error, PartialEq, Eq)]
pub enum ConfigError {
    #[error("missing environment variable {0}")]
    Missing(String),
    #[error("invalid value {value:?} for {var}")]
    Invalid { var: String, value: String },
    #[error("{0:?} is not a plain SQL identifier")]
    Identifier(String),
}

#[derive(Debug, Error)]
pub enum StoreError {
    #[error("connecting to {store} store: {source}")]
    Connect {
        store: StoreKind,
        #[source]
        source: sqlx::Error,
    },
    #[error("loading {what} from source store: {source}")]
    Query {
        what: &'static str,
        #[source]
        source: sqlx::Error,
    },
    #[error("updating {table}.{column}: {source}")]
    Update {
        table: String,
        column: &'static str,
        #[source]
        source: sqlx::Error,
    },
}

/// Connection parameters for one store.
#[derive(Clone, PartialEq, Eq)]
pub struct StoreConfig {
    pub host: String,
    pub port: u16,
    pub user: String,
    pub password: String,
    pub database: String,
}

impl fmt::Debug for StoreConfig {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("StoreConfig")
            .field("host", &self.host)
            .field("port", &self.port)
            .field("user", &self.user)
            .field("password", &"<redacted>")
            .field("database", &self.database)
            .finish()
    }
}

impl StoreConfig {
    /// Reads `{prefix}_HOST`, `{prefix}_USER`, `{prefix}_PASSWORD` (required) and
    /// `{prefix}_PORT`, `{prefix}_DATABASE` (defaulted) through `lookup`.
    pub fn from_lookup<F>(
        prefix: &str,
        default_port: u16,
        default_database: &str,
        lookup: F,
    ) -> Result<Self, ConfigError>
    where
        F: Fn(&str) -> Option<String>,
    {
        let required = |suffix: &str| {
            let var = format!("{prefix}_{suffix}");
            lookup(&var).ok_or(ConfigError::Missing(var))
        };
        let port_var = format!("{prefix}_PORT");
        let port = match lookup(&port_var) {
            Some(value) => value.trim().parse().map_err(|_| ConfigError::Invalid {
                var: port_var,
                value,
            })?,
            None => default_port,
        };
        Ok(Self {
            host: required("HOST")?,
            port,
            user: required("USER")?,
            password: required("PASSWORD")?,
            database: lookup(&format!("{prefix}_DATABASE"))
                .unwrap_or_else(|| default_database.to_string()),
        })
    }

    fn mysql_options(&self) -> MySqlConnectOptions {
        MySqlConnectOptions::new()
            .host(&self.host)
            .port(self.port)
            .username(&self.user)
            .password(&self.password)
            .database(&self.database)
    }

    fn pg_options(&self) -> PgConnectOptions {
        PgConnectOptions::new()
            .host(&self.host)
            .port(self.port)
            .username(&self.user)
            .password(&self.password)
            .database(&self.database)
    }
}

/// Checks `name` is `ident` or `schema.ident` made of ASCII word characters.
pub fn validate_identifier(name: &str) -> Result<&str, ConfigError> {
    let valid_part = |part: &str| {
        let mut chars = part.chars();
        matches!(chars.next(), Some(c) if c.is_ascii_alphabetic() || c == '_')
            && chars.all(|c| c.is_ascii_alphanumeric() || c == '_')
    };
    let parts: Vec<&str> = name.split('.').collect();
    if parts.len() <= 2 && parts.iter().all(|p| valid_part(p)) {
        Ok(name)
    } else {
        Err(ConfigError::Identifier(name.to_string()))
    }
}

/// Denormalized display column on the fact table and the id column it is keyed by.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DisplayColumn {
    OrganisationName,
    GradeName,
}

impl DisplayColumn {
    pub fn column(self) -> &'static str {
        match self {
            Self::OrganisationName => "organisation_name",
            Self::GradeName => "grade_name",
        }
    }

    pub fn key_column(self) -> &'static str {
        match self {
            Self::OrganisationName => "organisation_id",
            Self::GradeName => "grade_id",
        }
    }
}

/// Set-based update joining an unnested `(id, name)` payload against the fact table.
pub fn bulk_update_sql(table: &str, column: DisplayColumn) -> String {
    format!(
        "UPDATE {table}
            SET {col} = payload.name
           FROM UNNEST($1::bigint[], $2::text[]) AS payload (id, name)
          WHERE {table}.{key} = payload.id",
        col = column.column(),
        key = column.key_column(),
    )
}

/// Read side: normalized reference data.
#[async_trait]
pub trait ReferenceSource: Send + Sync {
    async fn load_grades(&self) -> Result<Vec<GradeRecord>, StoreError>;
    async fn load_organisations(&self) -> Result<Vec<OrganisationNode>, StoreError>;
}

/// Write side: one committed set-based update per call.
#[async_trait]
pub trait FactTableWriter: Send + Sync {
    async fn update_display_names(
        &self,
        column: DisplayColumn,
        names: &FormattedNames,
    ) -> Result<u64, StoreError>;
}

#[derive(Debug, Clone)]
pub struct MySqlReferenceSource {
    pool: MySqlPool,
}

impl MySqlReferenceSource {
    pub fn new(pool: MySqlPool) -> Self {
        Self { pool }
    }

    /// Opens the single source-store session used for the whole run.
    pub async fn connect(config: &StoreConfig) -> Result<Self, StoreError> {
        let pool = MySqlPoolOptions::new()
            .max_connections(1)
            .connect_with(config.mysql_options())
            .await
            .map_err(|source| StoreError::Connect {
                store: StoreKind::Source,
                source,
            })?;
        Ok(Self::new(pool))
    }
}

#[async_trait]
impl ReferenceSource for MySqlReferenceSource {
    async fn load_grades(&self) -> Result<Vec<GradeRecord>, StoreError> {
        let query_err = |source| StoreError::Query {
            what: "grades",
            source,
        };
        let rows = sqlx::query("SELECT CAST(id AS SIGNED) AS id, name FROM grade")
            .fetch_all(&self.pool)
            .await
            .map_err(query_err)?;

        rows.iter()
            .map(|row| {
                Ok(GradeRecord {
                    id: row.try_get("id")?,
                    name: row.try_get("name")?,
                })
            })
            .collect::<Result<Vec<_>, sqlx::Error>>()
            .map_err(query_err)
    }

    async fn load_organisations(&self) -> Result<Vec<OrganisationNode>, StoreError> {
        let query_err = |source| StoreError::Query {
            what: "organisational units",
            source,
        };
        let rows = sqlx::query(
            r#"
            SELECT CAST(id AS SIGNED) AS id,
                   name,
                   CAST(parent_id AS SIGNED) AS parent_id
              FROM organisational_unit
            "#,
        )
        .fetch_all(&self.pool)
        .await
        .map_err(query_err)?;

        rows.iter()
            .map(|row| {
                Ok(OrganisationNode {
                    id: row.try_get("id")?,
                    name: row.try_get("name")?,
                    parent_id: row.try_get("parent_id")?,
                })
            })
            .collect::<Result<Vec<_>, sqlx::Error>>()
            .map_err(query_err)
    }
}

#[derive(Debug, Clone)]
pub struct PgFactTableWriter {
    pool: PgPool,
    table: String,
}

impl PgFactTableWriter {
    pub fn new(pool: PgPool, table: impl Into<String>) -> Self {
        Self {
            pool,
            table: table.into(),
        }
    }

    /// Opens the single target-store session; `table` must already be validated.
    pub async fn connect(config: &StoreConfig, table: &str) -> Result<Self, StoreError> {
        let pool = PgPoolOptions::new()
            .max_connections(1)
            .connect_with(config.pg_options())
            .await
            .map_err(|source| StoreError::Connect {
                store: StoreKind::Target,
                source,
            })?;
        Ok(Self::new(pool, table))
    }

    pub fn table(&self) -> &str {
        &self.table
    }
}

#[async_trait]
impl FactTableWriter for PgFactTableWriter {
    async fn update_display_names(
        &self,
        column: DisplayColumn,
        names: &FormattedNames,
    ) -> Result<u64, StoreError> {
        if names.is_empty() {
            return Ok(0);
        }

        let span = info_span!(
            "bulk_update",
            table = %self.table,
            column = column.column(),
            rows = names.len()
        );
        let update_err = |source| StoreError::Update {
            table: self.table.clone(),
            column: column.column(),
            source,
        };
        let (ids, values) = split_payload(names);
        let sql = bulk_update_sql(&self.table, column);

        async move {
            debug!(%sql, "executing bulk update");
            let mut tx = self.pool.begin().await.map_err(update_err)?;
            let result = sqlx::query(&sql)
                .bind(ids)
                .bind(values)
                .execute(&mut *tx)
                .await
                .map_err(update_err)?;
            tx.commit().await.map_err(update_err)?;
            Ok(result.rows_affected())
        }
        .instrument(span)
        .await
    }
}

fn split_payload(names: &BTreeMap<i64, String>) -> (Vec<i64>, Vec<String>) {
    names.iter().map(|(id, name)| (*id, name.clone())).unzip()
}
