//! Extraction pipeline orchestration.
//!
//! Drives one run across all enabled object types: resolve the property set,
//! walk pagination, flatten each record against the fixed column list, hand
//! page-sized row batches to the table sink, resolve associations for the
//! page's ids, and commit the object type's checkpoint once its pagination
//! finished cleanly.
//!
//! Object types are independent: one failing type is recorded in the
//! [`RunReport`] and the run moves on, unless `fetch.fail_fast` is set.
//! A failed type never advances its checkpoint.

use chrono::{DateTime, Utc};
use serde_json::Value;
use std::collections::BTreeSet;

use crate::associations::{
    association_table_name, resolve_associations, AssociationEdge, ASSOCIATION_COLUMNS,
};
use crate::checkpoint::{Checkpoint, CheckpointStore, WATERMARK_SAFETY_MARGIN_MS};
use crate::client::{ApiClient, FetchFilters, RawRecord};
use crate::config::{parse_date_bound, Config, DateFrom, FetchMode};
use crate::endpoints::{EndpointDefinition, EndpointRegistry};
use crate::error::{ExtractError, Result};
use crate::flatten::Flattener;
use crate::properties::resolve_properties;
use crate::sink::{Row, TableSink};

/// Output table for property value history, shared by all object types.
pub const PROPERTY_HISTORY_TABLE: &str = "property_history";

pub const PROPERTY_HISTORY_COLUMNS: [&str; 9] = [
    "object_type",
    "object_id",
    "property_name",
    "value",
    "timestamp",
    "source_type",
    "source_id",
    "source_label",
    "updated_by_user_id",
];

/// Extraction progress of one object type. Used for structured logging and
/// for pinpointing where a type failed.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Phase {
    Pending,
    ResolvingProperties,
    Fetching,
    Associating,
    CommittingCheckpoint,
    Done,
}

/// Outcome of one run: which object types completed and which failed, with
/// the error that stopped each one. Association streams report under their
/// table name.
#[derive(Debug, Default)]
pub struct RunReport {
    pub succeeded: Vec<String>,
    pub failed: Vec<(String, ExtractError)>,
}

impl RunReport {
    pub fn is_success(&self) -> bool {
        self.failed.is_empty()
    }
}

/// Build the endpoint registry for a run: the static catalog plus the
/// account-specific custom object types from configuration.
pub fn registry_for(config: &Config) -> EndpointRegistry {
    let mut registry = EndpointRegistry::builtin();
    for type_id in &config.objects.custom {
        registry.register_custom_object(type_id);
    }
    registry
}

/// Run one extraction across all enabled object types.
pub async fn run_extraction(
    config: &Config,
    registry: &EndpointRegistry,
    client: &ApiClient,
    store: &CheckpointStore,
    sink: &mut dyn TableSink,
) -> Result<RunReport> {
    let run_started = Utc::now();
    let date_from = parse_date_bound(&config.fetch.date_from, run_started)?;

    let mut object_types: Vec<&str> = config.objects.enabled.iter().map(String::as_str).collect();
    for custom in &config.objects.custom {
        if !object_types.contains(&custom.as_str()) {
            object_types.push(custom);
        }
    }

    let mut report = RunReport::default();

    for object_type in object_types {
        let outcome = extract_object_type(
            object_type,
            config,
            registry,
            client,
            store,
            sink,
            run_started,
            date_from,
            &mut report,
        )
        .await;

        match outcome {
            Ok(()) => {
                tracing::info!(object_type, "object type extracted");
                report.succeeded.push(object_type.to_string());
            }
            Err(err) => {
                tracing::error!(object_type, "extraction failed: {}", err);
                report.failed.push((object_type.to_string(), err));
                if config.fetch.fail_fast {
                    tracing::error!("fail-fast is set, aborting the run");
                    break;
                }
            }
        }
    }

    sink.finish()?;
    Ok(report)
}

#[allow(clippy::too_many_arguments)]
async fn extract_object_type(
    object_type: &str,
    config: &Config,
    registry: &EndpointRegistry,
    client: &ApiClient,
    store: &CheckpointStore,
    sink: &mut dyn TableSink,
    run_started: DateTime<Utc>,
    date_from: DateFrom,
    report: &mut RunReport,
) -> Result<()> {
    let mut phase = Phase::Pending;
    tracing::trace!(object_type, ?phase, "starting");
    let def = registry.lookup(object_type)?;

    phase = Phase::ResolvingProperties;
    tracing::debug!(object_type, ?phase, "resolving properties");
    let property_set = resolve_properties(client, def, &config.properties).await?;

    // Columns from earlier runs stay in the schema so destination tables
    // never lose columns between runs.
    let stored_columns = store.get_columns(object_type).await?.unwrap_or_default();
    let mut columns = merge_columns(&stored_columns, &property_set.columns);
    let mut columns_settled = def.supports_properties;
    let mut observed_extra: BTreeSet<String> = BTreeSet::new();

    let incremental =
        config.fetch.mode == FetchMode::IncrementalFetch && def.supports_incremental;
    let modified_since = if incremental {
        incremental_bound(store, object_type, date_from).await?
    } else {
        None
    };
    log_fetch_plan(object_type, config, def, incremental, modified_since);

    // Only resolved property names go on the wire; the primary key and
    // metadata columns come back in the record envelope regardless.
    let base_filters = FetchFilters {
        properties: property_set.properties.clone(),
        properties_with_history: property_set.with_history.clone(),
        archived: false,
        modified_since,
    };

    // With archived inclusion the archived records are fetched in a separate
    // pass before the live ones. The search API has no archived listing, so
    // incremental fetches skip the extra pass.
    let mut passes = vec![false];
    if config.fetch.archived && modified_since.is_none() {
        if def.supports_archived {
            passes.insert(0, true);
        } else {
            tracing::info!(
                object_type,
                "archived records are not supported for this object type"
            );
        }
    }

    let associations: Vec<_> = config
        .associations
        .iter()
        .filter(|assoc| assoc.from_object == object_type)
        .collect();
    if !associations.is_empty() && !def.supports_associations {
        tracing::warn!(
            object_type,
            "associations are configured but not supported, skipping them"
        );
    }
    let flattener = Flattener::default();

    for archived_pass in passes {
        phase = Phase::Fetching;
        tracing::debug!(object_type, ?phase, archived = archived_pass, "paging");

        let mut stream = client.paginate(
            def,
            FetchFilters {
                archived: archived_pass,
                ..base_filters.clone()
            },
        );

        while let Some(page) = stream.next_page().await? {
            if !columns_settled {
                if page.is_empty() {
                    continue;
                }
                extend_from_page(&mut columns, &page, &flattener);
                columns_settled = true;
            }

            let projected = project_page(&page, def, &columns, &flattener, &mut observed_extra);
            sink.write_rows(object_type, &[def.primary_key], &columns, &projected.rows)?;

            if !projected.history_rows.is_empty() {
                let history_columns: Vec<String> = PROPERTY_HISTORY_COLUMNS
                    .iter()
                    .map(|c| c.to_string())
                    .collect();
                sink.write_rows(
                    PROPERTY_HISTORY_TABLE,
                    &["object_type", "object_id", "property_name", "timestamp"],
                    &history_columns,
                    &projected.history_rows,
                )?;
            }

            if def.supports_associations && !associations.is_empty() {
                phase = Phase::Associating;
                tracing::debug!(object_type, ?phase, ids = projected.ids.len(), "associating");
                for assoc in &associations {
                    fetch_page_associations(
                        client,
                        sink,
                        object_type,
                        &assoc.to_object,
                        &projected.ids,
                        config.fetch.fail_fast,
                        report,
                    )
                    .await?;
                }
            }
        }
    }

    phase = Phase::CommittingCheckpoint;
    tracing::debug!(object_type, ?phase, "committing checkpoint");
    store
        .set(
            object_type,
            &Checkpoint {
                watermark_ms: run_started.timestamp_millis(),
                run_timestamp: run_started.timestamp(),
            },
        )
        .await?;

    if !observed_extra.is_empty() {
        for extra in &observed_extra {
            columns.push(extra.clone());
        }
    }
    store.set_columns(object_type, &columns).await?;

    phase = Phase::Done;
    tracing::debug!(object_type, ?phase, "done");
    Ok(())
}

/// Effective modified-since bound for one object type, or `None` when the
/// first incremental run should behave as a full fetch.
async fn incremental_bound(
    store: &CheckpointStore,
    object_type: &str,
    date_from: DateFrom,
) -> Result<Option<i64>> {
    match store.get(object_type).await? {
        None => {
            tracing::info!(
                object_type,
                "no checkpoint stored yet, falling back to a full fetch"
            );
            Ok(None)
        }
        Some(checkpoint) => {
            let base = checkpoint.watermark_ms - WATERMARK_SAFETY_MARGIN_MS;
            let bound = match date_from {
                DateFrom::LastRun => base,
                // An explicit date can only widen the window. Moving the
                // bound forward past the stored watermark would skip records
                // modified between the watermark and that date.
                DateFrom::At(ts) => base.min(ts),
            };
            Ok(Some(bound))
        }
    }
}

fn log_fetch_plan(
    object_type: &str,
    config: &Config,
    def: &EndpointDefinition,
    incremental: bool,
    modified_since: Option<i64>,
) {
    if config.fetch.mode == FetchMode::IncrementalFetch && !def.supports_incremental {
        tracing::info!(
            object_type,
            "modified-since filtering is not supported, fetching everything"
        );
        return;
    }
    match (incremental, modified_since) {
        (true, Some(since)) => tracing::info!(
            object_type,
            since_ms = since,
            "downloading incrementally from the stored watermark"
        ),
        _ => tracing::info!(object_type, "downloading with a full fetch"),
    }
}

/// Merge previously stored columns with the current resolved list; stored
/// columns come first so header order is stable across runs.
fn merge_columns(stored: &[String], current: &[String]) -> Vec<String> {
    let mut merged: Vec<String> = Vec::with_capacity(stored.len() + current.len());
    for column in stored.iter().chain(current.iter()) {
        if !merged.iter().any(|existing| existing == column) {
            merged.push(column.clone());
        }
    }
    merged
}

/// For schema-less endpoints the first page defines the column list: every
/// flattened key not already present, after whatever came from state.
fn extend_from_page(columns: &mut Vec<String>, page: &[RawRecord], flattener: &Flattener) {
    for record in page {
        for key in flattener.flatten_record(record).keys() {
            if !columns.iter().any(|existing| existing == key) {
                columns.push(key.clone());
            }
        }
    }
}

struct ProjectedPage {
    rows: Vec<Row>,
    history_rows: Vec<Row>,
    ids: Vec<String>,
}

/// Flatten one page of raw records into rows aligned to `columns`.
///
/// CRM v3 records keep their property values in a `properties` sub-map and
/// their lifecycle metadata top-level in camelCase; both are projected into
/// the flat snake_case column set. Missing values become empty cells so the
/// row shape never varies. Keys that are not part of the column set are
/// collected into `observed_extra` so the next run can pick them up.
fn project_page(
    page: &[RawRecord],
    def: &EndpointDefinition,
    columns: &[String],
    flattener: &Flattener,
    observed_extra: &mut BTreeSet<String>,
) -> ProjectedPage {
    let mut rows = Vec::with_capacity(page.len());
    let mut history_rows = Vec::new();
    let mut ids = Vec::with_capacity(page.len());

    for record in page {
        let Some(object) = record.as_object() else {
            tracing::warn!(object_type = %def.object_type, "skipping non-object record");
            continue;
        };

        let flat = flattener.flatten_record(record);
        let properties = object.get("properties").and_then(Value::as_object);

        let id = object
            .get(def.primary_key)
            .map(render_cell)
            .unwrap_or_default();
        if !id.is_empty() {
            ids.push(id.clone());
        }

        let row: Row = columns
            .iter()
            .map(|column| {
                if column == def.primary_key {
                    return id.clone();
                }
                if let Some(top_level_key) = metadata_source_key(column) {
                    if let Some(value) = object.get(top_level_key) {
                        return render_cell(value);
                    }
                }
                if let Some(value) = properties.and_then(|p| p.get(column)) {
                    return render_cell(value);
                }
                flat.get(column).map(render_cell).unwrap_or_default()
            })
            .collect();
        rows.push(row);

        for key in flat.keys() {
            let known = columns.iter().any(|c| c == key)
                || key == "properties"
                || key.starts_with("properties_")
                || key.starts_with("propertiesWithHistory")
                || metadata_target_exists(key, columns);
            if !known {
                observed_extra.insert(key.clone());
            }
        }

        if let Some(history) = object.get("propertiesWithHistory").and_then(Value::as_object) {
            collect_history_rows(&def.object_type, &id, history, &mut history_rows);
        }
    }

    ProjectedPage {
        rows,
        history_rows,
        ids,
    }
}

/// The camelCase top-level field backing a fixed metadata column.
fn metadata_source_key(column: &str) -> Option<&'static str> {
    match column {
        "created_at" => Some("createdAt"),
        "updated_at" => Some("updatedAt"),
        "archived" => Some("archived"),
        "archived_at" => Some("archivedAt"),
        _ => None,
    }
}

fn metadata_target_exists(raw_key: &str, columns: &[String]) -> bool {
    let target = match raw_key {
        "createdAt" => "created_at",
        "updatedAt" => "updated_at",
        "archivedAt" => "archived_at",
        other => other,
    };
    columns.iter().any(|c| c == target)
}

fn collect_history_rows(
    object_type: &str,
    object_id: &str,
    history: &serde_json::Map<String, Value>,
    out: &mut Vec<Row>,
) {
    for (property_name, events) in history {
        for event in events.as_array().into_iter().flatten() {
            let field = |key: &str| event.get(key).map(render_cell).unwrap_or_default();
            out.push(vec![
                object_type.to_string(),
                object_id.to_string(),
                property_name.clone(),
                field("value"),
                field("timestamp"),
                field("sourceType"),
                field("sourceId"),
                field("sourceLabel"),
                field("updatedByUserId"),
            ]);
        }
    }
}

#[allow(clippy::too_many_arguments)]
async fn fetch_page_associations(
    client: &ApiClient,
    sink: &mut dyn TableSink,
    from_object_type: &str,
    to_object_type: &str,
    ids: &[String],
    fail_fast: bool,
    report: &mut RunReport,
) -> Result<()> {
    if ids.is_empty() {
        return Ok(());
    }

    let table = association_table_name(from_object_type, to_object_type);
    match resolve_associations(client, from_object_type, to_object_type, ids).await {
        Ok(edges) => {
            let columns: Vec<String> = ASSOCIATION_COLUMNS.iter().map(|c| c.to_string()).collect();
            let rows: Vec<Row> = edges.iter().map(edge_row).collect();
            sink.write_rows(&table, &["from_id", "to_id"], &columns, &rows)?;
            Ok(())
        }
        Err(err) if fail_fast => Err(err),
        Err(err) => {
            // Edges are best-effort enrichment: the object rows stand, the
            // failure is reported, and extraction moves to the next page.
            tracing::warn!(%table, "association fetch failed: {}", err);
            if !report.failed.iter().any(|(name, _)| name == &table) {
                report.failed.push((table, err));
            }
            Ok(())
        }
    }
}

fn edge_row(edge: &AssociationEdge) -> Row {
    vec![
        edge.from_object_type.clone(),
        edge.from_id.clone(),
        edge.to_object_type.clone(),
        edge.to_id.clone(),
    ]
}

/// Render a JSON value into a CSV cell. Missing and null values become the
/// empty string; structured values are kept as compact JSON.
fn render_cell(value: &Value) -> String {
    match value {
        Value::Null => String::new(),
        Value::String(s) => s.clone(),
        Value::Bool(b) => b.to_string(),
        Value::Number(n) => n.to_string(),
        other => other.to_string(),
    }
}
