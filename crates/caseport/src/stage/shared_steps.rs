use std::sync::Arc;

use async_trait::async_trait;
use serde_json::{Value, json};

use crate::mapping::{Mappings, ProjectMapping, project_key};
use crate::migrate::{MigrationContext, MigrationProgress};
use crate::pool::Pools;
use crate::service::{EntityKind, EntityRecord, ListFilter};

use super::create::{CreateJob, create_all, skip};
use super::fetch::fetch_all;
use super::{Stage, StageError, StageKind};

/// Creates reusable step sequences referenced by cases.
pub struct SharedStepStage;

/// Separated step entries as destination steps.
///
/// Shared by the case stage, which inlines the same shape.
pub(super) fn step_entry(step: &Value) -> Value {
    json!({
        "action": step_text(step, "content"),
        "expected_result": step_text(step, "expected"),
        "data": step_text(step, "additional_info"),
    })
}

pub(super) fn step_text<'a>(step: &'a Value, key: &str) -> &'a str {
    step.get(key).and_then(Value::as_str).unwrap_or_default()
}

fn shared_step_payload(record: &EntityRecord) -> Value {
    let title = record.title();
    let mut steps: Vec<Value> = record
        .get("custom_steps_separated")
        .and_then(Value::as_array)
        .map(|steps| steps.iter().map(step_entry).collect())
        .unwrap_or_default();
    if steps.is_empty() {
        steps.push(json!({ "action": title }));
    }
    json!({ "title": title, "steps": steps })
}

#[async_trait]
impl Stage for SharedStepStage {
    fn kind(&self) -> StageKind {
        StageKind::SharedSteps
    }

    async fn run(
        &self,
        ctx: &MigrationContext,
        pools: &Pools,
        mappings: Mappings,
        project: Option<&ProjectMapping>,
    ) -> Result<Mappings, StageError> {
        let Some(project) = project else {
            return Err(StageError::MissingProject {
                stage: StageKind::SharedSteps,
            });
        };
        let code = project.code.as_str();
        let stats = Arc::clone(&mappings.stats);

        let steps = fetch_all(
            ctx,
            pools,
            StageKind::SharedSteps,
            EntityKind::SharedStep,
            ListFilter::project(project.source_id),
        )
        .await?;

        ctx.emit(MigrationProgress::EntitiesDiscovered {
            stage: StageKind::SharedSteps,
            kind: EntityKind::SharedStep,
            project: Some(code.to_string()),
            total: steps.len(),
        });

        let mut jobs = Vec::new();
        for step in &steps {
            if mappings.shared_steps.contains(&project_key(code, step.id)) {
                skip(ctx, &stats, EntityKind::SharedStep, step.id, Some(code));
            } else {
                jobs.push(CreateJob::new(step.id, shared_step_payload(step)));
            }
        }

        let destination = Arc::clone(ctx.destination());
        let target = code.to_string();
        let table = mappings.shared_steps.clone();
        let key_code = code.to_string();
        create_all(
            ctx,
            pools,
            &stats,
            EntityKind::SharedStep,
            Some(code),
            jobs,
            move |payload: Value| {
                let destination = Arc::clone(&destination);
                let target = target.clone();
                async move { destination.create_shared_step(&target, &payload).await }
            },
            move |source_id, hash: &String| {
                table.insert_new(project_key(&key_code, source_id), hash.clone());
            },
        )
        .await?;

        Ok(mappings)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::stage::test_support::{FakeDestination, FakeSource, harness, project};

    #[test]
    fn empty_shared_step_gets_placeholder_action() {
        let record = EntityRecord::from_value(json!({"id": 1, "title": "Log in"})).unwrap();
        let payload = shared_step_payload(&record);
        assert_eq!(payload["steps"], json!([{ "action": "Log in" }]));
    }

    #[tokio::test]
    async fn maps_shared_steps_to_hashes() {
        let source = FakeSource::new().with(
            EntityKind::SharedStep,
            ListFilter::project(10),
            vec![json!({
                "id": 4,
                "title": "Log in",
                "custom_steps_separated": [
                    {"content": "Open page", "expected": "Form shown"},
                    {"content": "Submit", "expected": "Dashboard", "additional_info": "admin"},
                ],
            })],
        );
        let destination = FakeDestination::new();
        let (ctx, pools, mappings) = harness(source, destination.clone(), |_| {});
        let demo = project("DEMO", 10);

        let mappings = SharedStepStage
            .run(&ctx, &pools, mappings, Some(&demo))
            .await
            .unwrap();

        let hash = mappings.shared_steps.get(&project_key("DEMO", 4)).unwrap();
        assert!(hash.starts_with("step-"));

        let created = destination.created(EntityKind::SharedStep);
        assert_eq!(created[0].0.as_deref(), Some("DEMO"));
        assert_eq!(created[0].1["steps"][1]["data"], "admin");
        assert_eq!(created[0].1["steps"][0]["expected_result"], "Form shown");
    }
}
