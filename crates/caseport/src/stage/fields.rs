use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;
use serde_json::{Value, json};

use crate::mapping::{FieldMapping, Mappings, ProjectMapping};
use crate::migrate::{MigrationContext, MigrationProgress};
use crate::pool::Pools;
use crate::service::{EntityKind, EntityRecord, ListFilter, ServiceError};

use super::create::{CreateJob, create_all, skip};
use super::fetch::fetch_all;
use super::{Stage, StageError, StageKind};

/// Source fields carried by built-in destination case attributes instead.
const BUILTIN_FIELDS: [&str; 4] = [
    "custom_preconds",
    "custom_steps",
    "custom_expected",
    "custom_steps_separated",
];

/// Creates case custom fields, reusing destination fields with the same
/// title.
pub struct FieldStage;

/// Destination field type for a source field type, if representable.
fn destination_type(source_type: u64) -> Option<u64> {
    match source_type {
        1 => Some(1),  // string
        2 => Some(0),  // integer -> number
        3 => Some(2),  // text
        4 => Some(7),  // url
        5 => Some(4),  // checkbox
        6 => Some(3),  // dropdown -> selectbox
        7 => Some(8),  // user
        8 => Some(9),  // date
        12 => Some(6), // multi-select
        _ => None,
    }
}

/// Parse `"1, First\n2, Second"` option lists.
fn parse_options(items: &str) -> Vec<Value> {
    items
        .lines()
        .filter_map(|line| {
            let (id, title) = line.split_once(',')?;
            let id: u64 = id.trim().parse().ok()?;
            Some(json!({ "id": id, "title": title.trim() }))
        })
        .collect()
}

fn field_options(record: &EntityRecord) -> Vec<Value> {
    record
        .get("configs")
        .and_then(Value::as_array)
        .and_then(|configs| configs.first())
        .and_then(|config| config.pointer("/options/items"))
        .and_then(Value::as_str)
        .map(parse_options)
        .unwrap_or_default()
}

fn field_payload(record: &EntityRecord, title: &str) -> Option<Value> {
    let field_type = destination_type(record.u64("type_id")?)?;
    Some(json!({
        "title": title,
        "entity": 0,
        "type": field_type,
        "value": field_options(record),
        "is_filterable": true,
        "is_visible": true,
        "is_required": false,
        "is_enabled_for_all_projects": true,
    }))
}

#[async_trait]
impl Stage for FieldStage {
    fn kind(&self) -> StageKind {
        StageKind::Fields
    }

    async fn run(
        &self,
        ctx: &MigrationContext,
        pools: &Pools,
        mappings: Mappings,
        _project: Option<&ProjectMapping>,
    ) -> Result<Mappings, StageError> {
        let fields = fetch_all(
            ctx,
            pools,
            StageKind::Fields,
            EntityKind::CustomField,
            ListFilter::default(),
        )
        .await?;

        ctx.emit(MigrationProgress::EntitiesDiscovered {
            stage: StageKind::Fields,
            kind: EntityKind::CustomField,
            project: None,
            total: fields.len(),
        });

        let destination = Arc::clone(ctx.destination());
        let existing: HashMap<String, u64> = pools
            .destination()
            .run(async move { destination.list_custom_fields().await })
            .await?
            .map_err(|source| StageError::Destination {
                stage: StageKind::Fields,
                source,
            })?
            .into_iter()
            .map(|f| (f.title.to_lowercase(), f.id))
            .collect();

        let stats = Arc::clone(&mappings.stats);
        let mut jobs = Vec::new();

        for field in fields {
            if mappings.fields.contains(&field.id) {
                skip(ctx, &stats, EntityKind::CustomField, field.id, None);
                continue;
            }

            let system_name = field
                .str("system_name")
                .map(str::to_string)
                .unwrap_or_else(|| format!("custom_{}", field.title()));
            if BUILTIN_FIELDS.contains(&system_name.as_str()) {
                continue;
            }
            if field.bool("is_active") == Some(false) {
                tracing::debug!(field = %system_name, "Skipping inactive field");
                continue;
            }

            let title = field
                .str("label")
                .map(str::to_string)
                .unwrap_or_else(|| field.title());

            if let Some(&id) = existing.get(&title.to_lowercase()) {
                mappings
                    .fields
                    .insert_new(field.id, FieldMapping { id, system_name });
                skip(ctx, &stats, EntityKind::CustomField, field.id, None);
                continue;
            }

            match field_payload(&field, &title) {
                Some(payload) => jobs.push(CreateJob::new(field.id, (payload, system_name))),
                None => {
                    tracing::warn!(
                        field = %system_name,
                        type_id = ?field.u64("type_id"),
                        "Field type has no destination equivalent"
                    );
                    ctx.emit(MigrationProgress::Warning {
                        message: format!("custom field '{title}' has an unsupported type"),
                    });
                }
            }
        }

        let destination = Arc::clone(ctx.destination());
        let table = mappings.fields.clone();
        create_all(
            ctx,
            pools,
            &stats,
            EntityKind::CustomField,
            None,
            jobs,
            move |(payload, system_name): (Value, String)| {
                let destination = Arc::clone(&destination);
                async move {
                    let id = destination
                        .create_entity(EntityKind::CustomField, None, &payload)
                        .await?;
                    Ok::<_, ServiceError>(FieldMapping { id, system_name })
                }
            },
            move |source_id, field: &FieldMapping| {
                table.insert_new(source_id, field.clone());
            },
        )
        .await?;

        Ok(mappings)
    }
}
