//! The sites lakehouse pipeline: bronze ingestion, silver staging, the dbt
//! model and test chain, docs, and the gold export.

use crate::capabilities::{STORAGE, TRANSFORM_TOOL};
use crate::columnar::encode_parquet;
use crate::config::PipelineConfig;
use crate::export::{DEFAULT_EXPORT_OPERATION, ExportStep};
use crate::graph::{NodeDefinition, NodeRegistry};
use crate::runtime::{NodeCompute, NodeContext, NodeInputs, NodeOutput};
use crate::staging::{StagingError, clean_sites_data, clean_sites_metadata, flatten_metadata_document};
use crate::table::Table;
use crate::tool::{ModelSelection, ToolCommand};
use crate::{GraphValidationError, PipelineError};
use async_trait::async_trait;
use std::path::PathBuf;
use std::sync::Arc;
use strata_store::MetadataValue;

pub const SITES_CSV_KEY: &str = "bronze/sites_data.csv";
pub const SITES_METADATA_PREFIX: &str = "bronze/sites_metadata/";
pub const SITES_DATA_PARQUET_KEY: &str = "silver/sites_data.parquet";
pub const SITES_METADATA_PARQUET_KEY: &str = "silver/sites_metadata.parquet";
pub const BUSINESS_INSIGHTS_KEY: &str = "gold/site_business_insights.parquet";
pub const BUSINESS_INSIGHTS_TABLE: &str = "site_business_insights";

pub const SITES_DATA_CSV: &str = "sites_data_csv";
pub const SITES_METADATA_JSON: &str = "sites_metadata_json";
pub const STAGED_SITES_DATA: &str = "staged_sites_data";
pub const STAGED_SITES_METADATA: &str = "staged_sites_metadata";
pub const GENERATE_DBT_DOCS: &str = "generate_dbt_docs";
pub const EXPORT_BUSINESS_INSIGHTS: &str = "export_business_insights_to_gold";

const PREVIEW_ROWS: usize = 5;

/// dbt models in dependency order: `(model, upstream nodes, description)`.
const MODELS: &[(&str, &[&str], &str)] = &[
    (
        "stg_sites",
        &[STAGED_SITES_DATA],
        "Bronze model loading the staged sites data",
    ),
    (
        "stg_sites_metadata",
        &[STAGED_SITES_METADATA],
        "Bronze model loading the staged sites metadata",
    ),
    (
        "sites_unions",
        &["dbt_stg_sites", "dbt_stg_sites_metadata"],
        "Silver model combining sites data and metadata",
    ),
    (
        "sites_enriched",
        &["dbt_sites_unions"],
        "Silver model applying business rules and deduplication",
    ),
    (
        BUSINESS_INSIGHTS_TABLE,
        &["dbt_sites_enriched"],
        "Gold model with business-ready site insights",
    ),
];

pub fn model_node(model: &str) -> String {
    format!("dbt_{model}")
}

pub fn test_node(model: &str) -> String {
    format!("dbt_test_{model}")
}

/// Deployment-specific values the node definitions close over.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct SitesSettings {
    pub bucket: String,
    pub scratch_root: Option<PathBuf>,
    pub export_operation: String,
}

impl Default for SitesSettings {
    fn default() -> Self {
        Self {
            bucket: crate::config::DEFAULT_BUCKET.to_string(),
            scratch_root: None,
            export_operation: DEFAULT_EXPORT_OPERATION.to_string(),
        }
    }
}

impl From<&PipelineConfig> for SitesSettings {
    fn from(config: &PipelineConfig) -> Self {
        Self {
            bucket: config.bucket.clone(),
            scratch_root: config.scratch_dir.clone(),
            ..Self::default()
        }
    }
}

pub struct SitesPipeline;

impl SitesPipeline {
    pub fn registry(settings: &SitesSettings) -> Result<NodeRegistry, GraphValidationError> {
        let mut registry = NodeRegistry::new();

        registry.register(
            NodeDefinition::new(
                SITES_DATA_CSV,
                Arc::new(ReadSitesCsv {
                    bucket: settings.bucket.clone(),
                }),
            )
            .with_description("Ingest sites data from the bronze layer")
            .with_capability(STORAGE),
        )?;
        registry.register(
            NodeDefinition::new(
                SITES_METADATA_JSON,
                Arc::new(ReadSitesMetadata {
                    bucket: settings.bucket.clone(),
                }),
            )
            .with_description("Ingest sites metadata documents from the bronze layer")
            .with_capability(STORAGE),
        )?;
        registry.register(
            NodeDefinition::new(
                STAGED_SITES_DATA,
                Arc::new(StageTable {
                    source: SITES_DATA_CSV,
                    bucket: settings.bucket.clone(),
                    key: SITES_DATA_PARQUET_KEY,
                    clean: clean_sites_data,
                }),
            )
            .with_description("Clean and stage sites data to the silver layer")
            .with_input(SITES_DATA_CSV)
            .with_capability(STORAGE),
        )?;
        registry.register(
            NodeDefinition::new(
                STAGED_SITES_METADATA,
                Arc::new(StageTable {
                    source: SITES_METADATA_JSON,
                    bucket: settings.bucket.clone(),
                    key: SITES_METADATA_PARQUET_KEY,
                    clean: clean_sites_metadata,
                }),
            )
            .with_description("Clean and stage sites metadata to the silver layer")
            .with_input(SITES_METADATA_JSON)
            .with_capability(STORAGE),
        )?;

        for (model, upstream, description) in MODELS {
            let node = upstream.iter().fold(
                NodeDefinition::new(
                    model_node(model),
                    Arc::new(RunTool {
                        command: ToolCommand::Run(ModelSelection::model(*model)),
                        completion: format!("{model}_completed"),
                    }),
                )
                .with_description(*description)
                .with_capability(TRANSFORM_TOOL),
                |node, dependency| node.with_gate(*dependency),
            );
            registry.register(node)?;
        }

        for (model, _, _) in MODELS {
            registry.register(
                NodeDefinition::new(
                    test_node(model),
                    Arc::new(RunTool {
                        command: ToolCommand::Test(ModelSelection::model(*model)),
                        completion: format!("{model}_tests_passed"),
                    }),
                )
                .with_description(format!("Run dbt tests for {model}"))
                .with_gate(model_node(model))
                .with_capability(TRANSFORM_TOOL),
            )?;
        }

        registry.register(
            NodeDefinition::new(
                GENERATE_DBT_DOCS,
                Arc::new(RunTool {
                    command: ToolCommand::GenerateDocs,
                    completion: "dbt_docs_generated".to_string(),
                }),
            )
            .with_description("Generate dbt documentation once the gold model is tested")
            .with_gate(test_node(BUSINESS_INSIGHTS_TABLE))
            .with_capability(TRANSFORM_TOOL),
        )?;

        let export = ExportStep::new(
            BUSINESS_INSIGHTS_TABLE,
            settings.bucket.clone(),
            BUSINESS_INSIGHTS_KEY,
        )
        .with_operation(settings.export_operation.clone())
        .with_scratch_root(settings.scratch_root.clone());
        registry.register(
            NodeDefinition::new(EXPORT_BUSINESS_INSIGHTS, Arc::new(ExportTable { step: export }))
                .with_description("Export the business insights table to the gold layer")
                .with_gate(GENERATE_DBT_DOCS)
                .with_capability(TRANSFORM_TOOL)
                .with_capability(STORAGE),
        )?;

        Ok(registry)
    }
}

fn table_output(table: &Table) -> Result<NodeOutput, PipelineError> {
    Ok(NodeOutput::json(table)?
        .with_metadata("row_count", table.row_count())
        .with_metadata(
            "preview",
            MetadataValue::Markdown(table.to_markdown(PREVIEW_ROWS)),
        ))
}

struct ReadSitesCsv {
    bucket: String,
}

#[async_trait]
impl NodeCompute for ReadSitesCsv {
    async fn compute(
        &self,
        _inputs: &NodeInputs,
        ctx: &NodeContext<'_>,
    ) -> Result<NodeOutput, PipelineError> {
        let storage = ctx.storage(STORAGE)?;
        let raw = storage.get(&self.bucket, SITES_CSV_KEY).await?;
        let table = Table::from_csv(&raw)?;
        tracing::info!(rows = table.row_count(), key = SITES_CSV_KEY, "read sites data");
        table_output(&table)
    }
}

struct ReadSitesMetadata {
    bucket: String,
}

#[async_trait]
impl NodeCompute for ReadSitesMetadata {
    async fn compute(
        &self,
        _inputs: &NodeInputs,
        ctx: &NodeContext<'_>,
    ) -> Result<NodeOutput, PipelineError> {
        let storage = ctx.storage(STORAGE)?;
        let mut keys: Vec<String> = storage
            .list(&self.bucket, SITES_METADATA_PREFIX)
            .await?
            .into_iter()
            .filter(|key| key.ends_with(".json"))
            .collect();
        keys.sort();

        let mut records = Vec::with_capacity(keys.len());
        for key in &keys {
            let raw = storage.get(&self.bucket, key).await?;
            let record = flatten_metadata_document(&raw).map_err(|err| match err {
                StagingError::Json(message) => StagingError::Json(format!("{key}: {message}")),
                other => other,
            })?;
            records.push(record);
        }

        let table = Table::from_records(records);
        tracing::info!(files = keys.len(), rows = table.row_count(), "read sites metadata");
        Ok(table_output(&table)?.with_metadata("file_count", keys.len()))
    }
}

struct StageTable {
    source: &'static str,
    bucket: String,
    key: &'static str,
    clean: fn(&Table) -> Result<Table, StagingError>,
}

#[async_trait]
impl NodeCompute for StageTable {
    async fn compute(
        &self,
        inputs: &NodeInputs,
        ctx: &NodeContext<'_>,
    ) -> Result<NodeOutput, PipelineError> {
        let storage = ctx.storage(STORAGE)?;
        let table: Table = inputs.decode(self.source)?;
        let cleaned = (self.clean)(&table)?;
        let body = encode_parquet(&cleaned)?;
        let bytes = body.len();

        storage.put(&self.bucket, self.key, body).await?;
        let locator = storage.locator(&self.bucket, self.key);
        tracing::info!(rows = cleaned.row_count(), locator = %locator, "staged table");

        Ok(NodeOutput::location(locator)
            .with_metadata("row_count", cleaned.row_count())
            .with_metadata("bytes", bytes))
    }
}

struct RunTool {
    command: ToolCommand,
    completion: String,
}

#[async_trait]
impl NodeCompute for RunTool {
    async fn compute(
        &self,
        _inputs: &NodeInputs,
        ctx: &NodeContext<'_>,
    ) -> Result<NodeOutput, PipelineError> {
        let tool = ctx.transform_tool(TRANSFORM_TOOL)?;
        tool.invoke(&self.command)
            .await?
            .ensure_success(&self.command)?;
        Ok(NodeOutput::value(self.completion.clone())
            .with_metadata("command", self.command.label()))
    }
}

struct ExportTable {
    step: ExportStep,
}

#[async_trait]
impl NodeCompute for ExportTable {
    async fn compute(
        &self,
        _inputs: &NodeInputs,
        ctx: &NodeContext<'_>,
    ) -> Result<NodeOutput, PipelineError> {
        let tool = ctx.transform_tool(TRANSFORM_TOOL)?;
        let storage = ctx.storage(STORAGE)?;
        let receipt = self.step.execute(tool.as_ref(), storage.as_ref()).await?;
        Ok(NodeOutput::location(receipt.locator)
            .with_metadata("bytes", i64::try_from(receipt.bytes).unwrap_or(i64::MAX))
            .with_metadata("content_hash", receipt.content_hash))
    }
}
