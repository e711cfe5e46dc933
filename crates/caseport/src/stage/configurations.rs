use std::sync::Arc;

use async_trait::async_trait;
use serde_json::{Value, json};

use crate::mapping::{Mappings, ProjectMapping, project_key};
use crate::migrate::{MigrationContext, MigrationProgress};
use crate::pool::Pools;
use crate::service::{EntityKind, EntityRecord, ListFilter};

use super::create::{CreateJob, create_all, fail, skip};
use super::fetch::fetch_all;
use super::{Stage, StageError, StageKind};

/// Creates configuration groups, then the configurations inside them.
pub struct ConfigurationStage;

fn group_configs(group: &EntityRecord) -> Vec<EntityRecord> {
    group
        .get("configs")
        .and_then(Value::as_array)
        .map(|configs| {
            configs
                .iter()
                .cloned()
                .filter_map(EntityRecord::from_value)
                .collect()
        })
        .unwrap_or_default()
}

#[async_trait]
impl Stage for ConfigurationStage {
    fn kind(&self) -> StageKind {
        StageKind::Configurations
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
                stage: StageKind::Configurations,
            });
        };
        let code = project.code.as_str();
        let stats = Arc::clone(&mappings.stats);

        let groups = fetch_all(
            ctx,
            pools,
            StageKind::Configurations,
            EntityKind::ConfigurationGroup,
            ListFilter::project(project.source_id),
        )
        .await?;

        ctx.emit(MigrationProgress::EntitiesDiscovered {
            stage: StageKind::Configurations,
            kind: EntityKind::ConfigurationGroup,
            project: Some(code.to_string()),
            total: groups.len(),
        });

        let mut jobs = Vec::new();
        for group in &groups {
            if mappings
                .configuration_groups
                .contains(&project_key(code, group.id))
            {
                skip(ctx, &stats, EntityKind::ConfigurationGroup, group.id, Some(code));
            } else {
                jobs.push(CreateJob::new(group.id, json!({ "title": group.title() })));
            }
        }

        let destination = Arc::clone(ctx.destination());
        let target = code.to_string();
        let table = mappings.configuration_groups.clone();
        let key_code = code.to_string();
        create_all(
            ctx,
            pools,
            &stats,
            EntityKind::ConfigurationGroup,
            Some(code),
            jobs,
            move |payload: Value| {
                let destination = Arc::clone(&destination);
                let target = target.clone();
                async move {
                    destination
                        .create_entity(EntityKind::ConfigurationGroup, Some(&target), &payload)
                        .await
                }
            },
            move |source_id, id: &u64| {
                table.insert_new(project_key(&key_code, source_id), *id);
            },
        )
        .await?;

        let mut jobs = Vec::new();
        for group in &groups {
            let parent = mappings
                .configuration_groups
                .get(&project_key(code, group.id));

            for config in group_configs(group) {
                if mappings
                    .configurations
                    .contains(&project_key(code, config.id))
                {
                    skip(ctx, &stats, EntityKind::Configuration, config.id, Some(code));
                    continue;
                }
                match parent {
                    Some(group_id) => jobs.push(CreateJob::new(
                        config.id,
                        json!({ "title": config.title(), "group_id": group_id }),
                    )),
                    None => fail(
                        ctx,
                        &stats,
                        EntityKind::Configuration,
                        config.id,
                        Some(code),
                        format!("configuration group {} was not created", group.id),
                    ),
                }
            }
        }

        let destination = Arc::clone(ctx.destination());
        let target = code.to_string();
        let table = mappings.configurations.clone();
        let key_code = code.to_string();
        create_all(
            ctx,
            pools,
            &stats,
            EntityKind::Configuration,
            Some(code),
            jobs,
            move |payload: Value| {
                let destination = Arc::clone(&destination);
                let target = target.clone();
                async move {
                    destination
                        .create_entity(EntityKind::Configuration, Some(&target), &payload)
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
