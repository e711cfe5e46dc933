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

pub struct MilestoneStage;

fn milestone_payload(record: &EntityRecord) -> Value {
    let status = if record.bool("is_completed") == Some(true) {
        "completed"
    } else {
        "active"
    };
    let mut payload = json!({
        "title": record.title(),
        "description": record.str("description").unwrap_or_default(),
        "status": status,
    });
    if let Some(due) = record.u64("due_on") {
        payload["due_date"] = json!(due);
    }
    payload
}

#[async_trait]
impl Stage for MilestoneStage {
    fn kind(&self) -> StageKind {
        StageKind::Milestones
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
                stage: StageKind::Milestones,
            });
        };
        let code = project.code.as_str();
        let stats = Arc::clone(&mappings.stats);

        let milestones = fetch_all(
            ctx,
            pools,
            StageKind::Milestones,
            EntityKind::Milestone,
            ListFilter::project(project.source_id),
        )
        .await?;

        ctx.emit(MigrationProgress::EntitiesDiscovered {
            stage: StageKind::Milestones,
            kind: EntityKind::Milestone,
            project: Some(code.to_string()),
            total: milestones.len(),
        });

        let mut jobs = Vec::new();
        for milestone in &milestones {
            if mappings.milestones.contains(&project_key(code, milestone.id)) {
                skip(ctx, &stats, EntityKind::Milestone, milestone.id, Some(code));
            } else {
                jobs.push(CreateJob::new(milestone.id, milestone_payload(milestone)));
            }
        }

        let destination = Arc::clone(ctx.destination());
        let target = code.to_string();
        let table = mappings.milestones.clone();
        let key_code = code.to_string();
        create_all(
            ctx,
            pools,
            &stats,
            EntityKind::Milestone,
            Some(code),
            jobs,
            move |payload: Value| {
                let destination = Arc::clone(&destination);
                let target = target.clone();
                async move {
                    destination
                        .create_entity(EntityKind::Milestone, Some(&target), &payload)
                        .await
                }
            },
            move |source_id, id: &u64| {
                table.insert_new(project_key(&key_code, source_id), *id);
            },
        )
        .await?;

        Ok(mappings)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::stage::run_stage;
    use crate::stage::test_support::{
        FakeDestination, FakeSource, complete_through, harness, project,
    };

    #[test]
    fn payload_carries_status_and_due_date() {
        let done = EntityRecord::from_value(
            json!({"id": 1, "name": "v1", "is_completed": true, "due_on": 1700000000}),
        )
        .unwrap();
        let payload = milestone_payload(&done);
        assert_eq!(payload["status"], "completed");
        assert_eq!(payload["due_date"], 1700000000);

        let open = EntityRecord::from_value(json!({"id": 2, "name": "v2"})).unwrap();
        let payload = milestone_payload(&open);
        assert_eq!(payload["status"], "active");
        assert!(payload.get("due_date").is_none());
    }

    #[tokio::test]
    async fn rerun_skips_mapped_milestones() {
        let source = FakeSource::new().with(
            EntityKind::Milestone,
            ListFilter::project(10),
            vec![json!({"id": 1, "name": "v1"}), json!({"id": 2, "name": "v2"})],
        );
        let destination = FakeDestination::new();
        let (ctx, pools, mappings) = harness(source, destination.clone(), |_| {});
        let demo = project("DEMO", 10);

        let mappings = MilestoneStage
            .run(&ctx, &pools, mappings, Some(&demo))
            .await
            .unwrap();
        let first = mappings.counts();
        let mappings = MilestoneStage
            .run(&ctx, &pools, mappings, Some(&demo))
            .await
            .unwrap();

        assert_eq!(mappings.counts(), first);
        assert_eq!(destination.created(EntityKind::Milestone).len(), 2);
        let stats = mappings.stats.entity(EntityKind::Milestone);
        assert_eq!(stats.succeeded, 2);
        assert_eq!(stats.skipped, 2);
    }

    #[tokio::test]
    async fn project_without_milestones_completes() {
        let destination = FakeDestination::new();
        let (ctx, pools, mut mappings) = harness(FakeSource::new(), destination.clone(), |_| {});
        let demo = project("DEMO", 10);
        complete_through(&mut mappings, StageKind::Milestones, "DEMO");

        let mappings = run_stage(&MilestoneStage, &ctx, &pools, mappings, Some(&demo))
            .await
            .unwrap();

        assert!(mappings.is_complete(StageKind::Milestones, Some("DEMO")));
        assert!(mappings.milestones.is_empty());
        assert!(destination.created(EntityKind::Milestone).is_empty());
        let stats = mappings.stats.entity(EntityKind::Milestone);
        assert_eq!(stats.attempted, 0);
        assert_eq!(stats.failed, 0);
    }
}
