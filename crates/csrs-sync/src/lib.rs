//! Sequential display-name sync from the CSRS store into the reporting fact table.

use anyhow::{Context, Result};
use chrono::{DateTime, Utc};
use csrs_core::{grade_names, DanglingReference, FormattedNames, OrganisationHierarchy};
use csrs_storage::{
    validate_identifier, ConfigError, DisplayColumn, FactTableWriter, MySqlReferenceSource,
    PgFactTableWriter, ReferenceSource, StoreConfig, DEFAULT_FACT_TABLE,
};
use serde::Serialize;
use tracing::{info, warn};
use uuid::Uuid;

pub const CRATE_NAME: &str = "csrs-sync";

#[derive(Debug, Clone)]
pub struct SyncConfig {
    pub source: StoreConfig,
    pub target: StoreConfig,
    pub fact_table: String,
}

impl SyncConfig {
    pub fn from_env() -> Result<Self> {
        Self::from_lookup(|key| std::env::var(key).ok()).context("reading sync configuration")
    }

    pub fn from_lookup<F>(lookup: F) -> Result<Self, ConfigError>
    where
        F: Fn(&str) -> Option<String>,
    {
        let fact_table =
            lookup("REPORTING_FACT_TABLE").unwrap_or_else(|| DEFAULT_FACT_TABLE.to_string());
        validate_identifier(&fact_table)?;
        Ok(Self {
            source: StoreConfig::from_lookup("MYSQL", 3306, "csrs", &lookup)?,
            target: StoreConfig::from_lookup("PG", 5432, "reporting", &lookup)?,
            fact_table,
        })
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct SyncRunSummary {
    pub run_id: Uuid,
    pub started_at: DateTime<Utc>,
    pub finished_at: DateTime<Utc>,
    pub grades_loaded: usize,
    pub grade_rows_updated: u64,
    pub organisations_loaded: usize,
    pub organisation_rows_updated: u64,
    pub dangling_references: Vec<DanglingReference>,
}

/// Computed payloads without any write to the reporting store.
#[derive(Debug, Clone, Default)]
pub struct SyncPreview {
    pub grade_names: FormattedNames,
    pub organisation_names: FormattedNames,
    pub dangling_references: Vec<DanglingReference>,
}

pub struct SyncPipeline {
    source: Box<dyn ReferenceSource>,
    writer: Box<dyn FactTableWriter>,
}

impl SyncPipeline {
    pub fn new(source: Box<dyn ReferenceSource>, writer: Box<dyn FactTableWriter>) -> Self {
        Self { source, writer }
    }

    /// Connects both stores, source first.
    pub async fn connect(config: &SyncConfig) -> Result<Self> {
        let source = MySqlReferenceSource::connect(&config.source).await?;
        let writer = PgFactTableWriter::connect(&config.target, &config.fact_table).await?;
        Ok(Self::new(Box::new(source), Box::new(writer)))
    }

    /// Grades are loaded and written before organisations are touched; each
    /// update commits on its own.
    pub async fn run_once(&self) -> Result<SyncRunSummary> {
        let started_at = Utc::now();
        let run_id = Uuid::new_v4();
        info!(%run_id, "starting display-name sync");

        info!("loading grade data");
        let grades = load_grade_names(self.source.as_ref()).await?;
        info!(count = grades.len(), "grades left to process");
        let grade_rows_updated = self
            .update_if_any(DisplayColumn::GradeName, &grades)
            .await?;

        info!("loading organisation data");
        let (organisations, dangling_references) =
            load_organisation_names(self.source.as_ref()).await?;
        info!(count = organisations.len(), "organisations left to process");
        let organisation_rows_updated = self
            .update_if_any(DisplayColumn::OrganisationName, &organisations)
            .await?;

        let summary = SyncRunSummary {
            run_id,
            started_at,
            finished_at: Utc::now(),
            grades_loaded: grades.len(),
            grade_rows_updated,
            organisations_loaded: organisations.len(),
            organisation_rows_updated,
            dangling_references,
        };
        info!(
            %run_id,
            grade_rows_updated,
            organisation_rows_updated,
            "display-name sync complete"
        );
        Ok(summary)
    }

    async fn update_if_any(&self, column: DisplayColumn, names: &FormattedNames) -> Result<u64> {
        if names.is_empty() {
            info!(column = column.column(), "nothing to update");
            return Ok(0);
        }
        info!(column = column.column(), rows = names.len(), "updating fact table");
        let updated = self
            .writer
            .update_display_names(column, names)
            .await
            .with_context(|| format!("updating {}", column.column()))?;
        info!(column = column.column(), updated, "update committed");
        Ok(updated)
    }
}

/// Runs the load and flatten steps only.
pub async fn preview(source: &dyn ReferenceSource) -> Result<SyncPreview> {
    let grade_names = load_grade_names(source).await?;
    let (organisation_names, dangling_references) = load_organisation_names(source).await?;
    Ok(SyncPreview {
        grade_names,
        organisation_names,
        dangling_references,
    })
}

async fn load_grade_names(source: &dyn ReferenceSource) -> Result<FormattedNames> {
    let records = source.load_grades().await.context("fetching grades")?;
    Ok(grade_names(records))
}

async fn load_organisation_names(
    source: &dyn ReferenceSource,
) -> Result<(FormattedNames, Vec<DanglingReference>)> {
    let nodes = source
        .load_organisations()
        .await
        .context("fetching organisations")?;
    let hierarchy = OrganisationHierarchy::from_nodes(nodes);

    info!("formatting organisation names");
    let dangling = hierarchy.dangling_references();
    for reference in &dangling {
        warn!(
            organisation_id = reference.organisation_id,
            missing_parent_id = reference.missing_parent_id,
            "parent organisation not found; name truncated at this level"
        );
    }
    let names = hierarchy
        .flatten()
        .context("flattening organisation hierarchy")?;
    Ok((names, dangling))
}

pub async fn run_sync_once_from_env() -> Result<SyncRunSummary> {
    let config = SyncConfig::from_env()?;
    let pipeline = SyncPipeline::connect(&config).await?;
    pipeline.run_once().await
}

pub async fn preview_from_env() -> Result<SyncPreview> {
    let config = SyncConfig::from_env()?;
    let source = MySqlReferenceSource::connect(&config.source).await?;
    preview(&source).await
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;
    use std::sync::{Arc, Mutex};

    use async_trait::async_trait;
    use csrs_core::{GradeRecord, HierarchyError, OrganisationNode};
    use csrs_storage::StoreError;

    #[derive(Default)]
    struct FakeSource {
        grades: Vec<GradeRecord>,
        organisations: Vec<OrganisationNode>,
    }

    #[async_trait]
    impl ReferenceSource for FakeSource {
        async fn load_grades(&self) -> Result<Vec<GradeRecord>, StoreError> {
            Ok(self.grades.clone())
        }

        async fn load_organisations(&self) -> Result<Vec<OrganisationNode>, StoreError> {
            Ok(self.organisations.clone())
        }
    }

    type Calls = Arc<Mutex<Vec<(DisplayColumn, FormattedNames)>>>;

    #[derive(Default)]
    struct RecordingWriter {
        calls: Calls,
    }

    #[async_trait]
    impl FactTableWriter for RecordingWriter {
        async fn update_display_names(
            &self,
            column: DisplayColumn,
            names: &FormattedNames,
        ) -> Result<u64, StoreError> {
            self.calls.lock().unwrap().push((column, names.clone()));
            Ok(names.len() as u64)
        }
    }

    fn pipeline(source: FakeSource) -> (SyncPipeline, Calls) {
        let writer = RecordingWriter::default();
        let calls = writer.calls.clone();
        (SyncPipeline::new(Box::new(source), Box::new(writer)), calls)
    }

    #[tokio::test]
    async fn grades_are_written_before_organisations() {
        let (pipeline, calls) = pipeline(FakeSource {
            grades: vec![GradeRecord::new(2, "Grade B"), GradeRecord::new(1, "Grade A")],
            organisations: vec![
                OrganisationNode::new(10, "Cabinet Office", None),
                OrganisationNode::new(11, "Digital", Some(10)),
            ],
        });

        let summary = pipeline.run_once().await.unwrap();
        let calls = calls.lock().unwrap();
        assert_eq!(calls.len(), 2);
        assert_eq!(calls[0].0, DisplayColumn::GradeName);
        assert_eq!(
            calls[0].1,
            FormattedNames::from([(1, "Grade A".to_string()), (2, "Grade B".to_string())])
        );
        assert_eq!(calls[1].0, DisplayColumn::OrganisationName);
        assert_eq!(calls[1].1[&11], "Cabinet Office | Digital");
        assert_eq!(summary.grade_rows_updated, 2);
        assert_eq!(summary.organisation_rows_updated, 2);
    }

    #[tokio::test]
    async fn empty_sets_never_reach_the_writer() {
        let (pipeline, calls) = pipeline(FakeSource::default());
        let summary = pipeline.run_once().await.unwrap();
        assert!(calls.lock().unwrap().is_empty());
        assert_eq!(summary.grades_loaded, 0);
        assert_eq!(summary.organisations_loaded, 0);
    }

    #[tokio::test]
    async fn organisations_update_even_without_grades() {
        let (pipeline, calls) = pipeline(FakeSource {
            grades: vec![],
            organisations: vec![OrganisationNode::new(1, "HMRC", None)],
        });
        pipeline.run_once().await.unwrap();
        let calls = calls.lock().unwrap();
        assert_eq!(calls.len(), 1);
        assert_eq!(calls[0].0, DisplayColumn::OrganisationName);
    }

    #[tokio::test]
    async fn cycle_aborts_after_grade_commit() {
        let (pipeline, calls) = pipeline(FakeSource {
            grades: vec![GradeRecord::new(1, "Grade A")],
            organisations: vec![
                OrganisationNode::new(1, "A", Some(2)),
                OrganisationNode::new(2, "B", Some(1)),
            ],
        });
        let err = pipeline.run_once().await.unwrap_err();
        assert!(matches!(
            err.downcast_ref::<HierarchyError>(),
            Some(HierarchyError::Cycle { .. })
        ));
        let calls = calls.lock().unwrap();
        assert_eq!(calls.len(), 1);
        assert_eq!(calls[0].0, DisplayColumn::GradeName);
    }

    #[tokio::test]
    async fn dangling_references_are_reported_not_fatal() {
        let (pipeline, _calls) = pipeline(FakeSource {
            grades: vec![],
            organisations: vec![OrganisationNode::new(5, "Orphan", Some(404))],
        });
        let summary = pipeline.run_once().await.unwrap();
        assert_eq!(summary.dangling_references.len(), 1);
        assert_eq!(summary.dangling_references[0].missing_parent_id, 404);
    }

    #[tokio::test]
    async fn preview_does_not_write() {
        let source = FakeSource {
            grades: vec![GradeRecord::new(1, "Grade A")],
            organisations: vec![
                OrganisationNode::new(1, "A", None),
                OrganisationNode::new(2, "B", Some(1)),
                OrganisationNode::new(3, "C", Some(2)),
            ],
        };
        let preview = preview(&source).await.unwrap();
        assert_eq!(preview.grade_names[&1], "Grade A");
        assert_eq!(preview.organisation_names[&3], "A | B | C");
        assert!(preview.dangling_references.is_empty());
    }

    #[test]
    fn config_reads_both_stores() {
        let env: HashMap<&str, &str> = HashMap::from([
            ("MYSQL_HOST", "mysql"),
            ("MYSQL_USER", "csrs"),
            ("MYSQL_PASSWORD", "secret"),
            ("PG_HOST", "pg"),
            ("PG_USER", "reporting"),
            ("PG_PASSWORD", "secret"),
        ]);
        let config = SyncConfig::from_lookup(|k| env.get(k).map(|v| v.to_string())).unwrap();
        assert_eq!(config.source.database, "csrs");
        assert_eq!(config.source.port, 3306);
        assert_eq!(config.target.database, "reporting");
        assert_eq!(config.target.port, 5432);
        assert_eq!(config.fact_table, DEFAULT_FACT_TABLE);
    }

    #[test]
    fn config_rejects_unsafe_table_name() {
        let err = SyncConfig::from_lookup(|k| {
            (k == "REPORTING_FACT_TABLE").then(|| "events; --".to_string())
        })
        .unwrap_err();
        assert_eq!(err, ConfigError::Identifier("events; --".into()));
    }
}
