use std::collections::BTreeSet;
use std::sync::Arc;

use async_trait::async_trait;
use serde_json::{Value, json};

use crate::mapping::{Mappings, ProjectMapping, project_key};
use crate::migrate::{MigrationContext, MigrationProgress};
use crate::pool::Pools;
use crate::service::{EntityKind, EntityRecord, ListFilter, short_error_message};

use super::create::{CreateJob, create_all, fail, skip};
use super::fetch::{fetch_all, list_all};
use super::{Stage, StageError, StageKind};

/// Creates test runs referencing the migrated cases and configurations.
///
/// The case list of each run comes from its tests, which are listed
/// concurrently through the source pool.
pub struct RunStage;

fn run_payload(
    mappings: &Mappings,
    code: &str,
    run: &EntityRecord,
    tests: &[EntityRecord],
) -> Value {
    let cases: BTreeSet<u64> = tests
        .iter()
        .filter_map(|test| test.u64("case_id"))
        .filter_map(|case| mappings.cases.get(&project_key(code, case)))
        .collect();

    let configurations: Vec<u64> = run
        .get("config_ids")
        .and_then(Value::as_array)
        .map(|ids| {
            ids.iter()
                .filter_map(Value::as_u64)
                .filter_map(|id| mappings.configurations.get(&project_key(code, id)))
                .collect()
        })
        .unwrap_or_default();

    let mut payload = json!({
        "title": run.title(),
        "description": run.str("description").unwrap_or_default(),
        "cases": cases,
        "author_id": mappings.user_or_default(run.u64("created_by")),
    });
    if !configurations.is_empty() {
        payload["configurations"] = json!(configurations);
    }
    if let Some(milestone) = run
        .u64("milestone_id")
        .and_then(|id| mappings.milestones.get(&project_key(code, id)))
    {
        payload["milestone_id"] = json!(milestone);
    }
    payload
}

#[async_trait]
impl Stage for RunStage {
    fn kind(&self) -> StageKind {
        StageKind::Runs
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
                stage: StageKind::Runs,
            });
        };
        let code = project.code.as_str();
        let stats = Arc::clone(&mappings.stats);

        let runs: Vec<EntityRecord> = fetch_all(
            ctx,
            pools,
            StageKind::Runs,
            EntityKind::Run,
            ListFilter::project(project.source_id),
        )
        .await?
        .into_iter()
        .filter(|run| project.suite_id.is_none() || run.u64("suite_id") == project.suite_id)
        .collect();

        ctx.emit(MigrationProgress::EntitiesDiscovered {
            stage: StageKind::Runs,
            kind: EntityKind::Run,
            project: Some(code.to_string()),
            total: runs.len(),
        });

        let mut listings = Vec::new();
        for run in runs {
            if mappings.runs.contains(&project_key(code, run.id)) {
                skip(ctx, &stats, EntityKind::Run, run.id, Some(code));
                continue;
            }
            let source = Arc::clone(ctx.source());
            let run_id = run.id;
            let handle = pools
                .source()
                .submit(async move {
                    list_all(source.as_ref(), EntityKind::Test, &ListFilter::run(run_id)).await
                })
                .await?;
            listings.push((run, handle));
        }

        let mut jobs = Vec::with_capacity(listings.len());
        for (run, handle) in listings {
            match handle.await {
                Ok(Ok(tests)) => {
                    jobs.push(CreateJob::new(run.id, run_payload(&mappings, code, &run, &tests)));
                }
                Ok(Err(e)) => fail(
                    ctx,
                    &stats,
                    EntityKind::Run,
                    run.id,
                    Some(code),
                    format!("could not list tests: {}", short_error_message(&e)),
                ),
                Err(e) => fail(ctx, &stats, EntityKind::Run, run.id, Some(code), e.to_string()),
            }
        }

        let destination = Arc::clone(ctx.destination());
        let target = code.to_string();
        let table = mappings.runs.clone();
        let key_code = code.to_string();
        create_all(
            ctx,
            pools,
            &stats,
            EntityKind::Run,
            Some(code),
            jobs,
            move |payload: Value| {
                let destination = Arc::clone(&destination);
                let target = target.clone();
                async move {
                    destination
                        .create_entity(EntityKind::Run, Some(&target), &payload)
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
