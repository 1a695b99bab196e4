//! Projects staged payloads into typed destination tables, then runs the task's
//! own post-load procedures.

use fitdash_core::{non_placeholder, Task};
use fitdash_storage::{FlattenSpec, PgStore, StorageError};
use tracing::{debug, info, warn};

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct FlattenReport {
    pub mappings: usize,
    pub rows_written: u64,
    pub procedures: Vec<String>,
}

pub async fn flatten_task(store: &PgStore, task: &Task) -> Result<FlattenReport, StorageError> {
    let mut report = FlattenReport::default();

    for mapping in store.staging_mappings(task.task_id).await? {
        let facts = store.fact_mappings(mapping.staging_id).await?;
        if facts.is_empty() {
            warn!(
                staging_id = mapping.staging_id,
                destination = %mapping.destination_table,
                "staging mapping has no facts; skipping"
            );
            continue;
        }
        let spec = FlattenSpec::from_mapping(&mapping, &facts)?;
        let rows = store.run_flatten(&spec, task.task_id).await?;
        let recency = store.refresh_fact_recency(&spec).await?;
        debug!(
            destination = %spec.destination(),
            rows,
            recency = ?recency,
            "flattened staging mapping"
        );
        report.mappings += 1;
        report.rows_written += rows;
    }

    for procedure in [&task.flatten_procedure, &task.parse_procedure]
        .into_iter()
        .filter_map(|p| non_placeholder(p.as_deref()))
    {
        store.call_procedure(procedure).await?;
        report.procedures.push(procedure.to_string());
    }

    info!(
        task = %task.task_name,
        mappings = report.mappings,
        rows = report.rows_written,
        "flatten complete"
    );
    Ok(report)
}
