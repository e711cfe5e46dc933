use std::collections::{BTreeMap, HashMap};
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

/// Rebuilds the source section tree as destination suites.
///
/// Sections are created one depth level at a time so every parent exists
/// before its children are submitted.
pub struct SuiteStage;

/// Depth of every section, following `parent_id` links.
///
/// A parent outside the listing ends the chain. Cycles are cut after
/// `sections.len()` steps.
fn section_depths(sections: &[EntityRecord]) -> HashMap<u64, usize> {
    let parents: HashMap<u64, Option<u64>> = sections
        .iter()
        .map(|s| (s.id, s.u64("parent_id")))
        .collect();

    sections
        .iter()
        .map(|section| {
            let mut depth = 0;
            let mut current = parents.get(&section.id).copied().flatten();
            while let Some(parent) = current {
                if depth >= sections.len() {
                    break;
                }
                match parents.get(&parent) {
                    Some(next) => {
                        depth += 1;
                        current = *next;
                    }
                    None => break,
                }
            }
            (section.id, depth)
        })
        .collect()
}

#[async_trait]
impl Stage for SuiteStage {
    fn kind(&self) -> StageKind {
        StageKind::Suites
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
                stage: StageKind::Suites,
            });
        };
        let code = project.code.as_str();
        let stats = Arc::clone(&mappings.stats);

        let sections = fetch_all(
            ctx,
            pools,
            StageKind::Suites,
            EntityKind::Section,
            ListFilter::project(project.source_id).with_suite(project.suite_id),
        )
        .await?;

        ctx.emit(MigrationProgress::EntitiesDiscovered {
            stage: StageKind::Suites,
            kind: EntityKind::Suite,
            project: Some(code.to_string()),
            total: sections.len(),
        });

        let depths = section_depths(&sections);
        let mut levels: BTreeMap<usize, Vec<&EntityRecord>> = BTreeMap::new();
        for section in &sections {
            let depth = depths.get(&section.id).copied().unwrap_or_default();
            levels.entry(depth).or_default().push(section);
        }

        for (depth, level) in levels {
            let mut jobs = Vec::new();
            for section in level {
                if mappings.suites.contains(&project_key(code, section.id)) {
                    skip(ctx, &stats, EntityKind::Suite, section.id, Some(code));
                    continue;
                }

                let mut payload = json!({
                    "title": section.title(),
                    "description": section.str("description").unwrap_or_default(),
                });
                if let Some(parent) = section.u64("parent_id") {
                    match mappings.suites.get(&project_key(code, parent)) {
                        Some(parent_id) => payload["parent_id"] = json!(parent_id),
                        None => {
                            tracing::warn!(
                                section = section.id,
                                parent,
                                depth,
                                "Parent suite missing, creating at root"
                            );
                            ctx.emit(MigrationProgress::Warning {
                                message: format!(
                                    "section {} in {code}: parent {parent} missing, created at root",
                                    section.id
                                ),
                            });
                        }
                    }
                }
                jobs.push(CreateJob::new(section.id, payload));
            }

            let destination = Arc::clone(ctx.destination());
            let target = code.to_string();
            let table = mappings.suites.clone();
            let key_code = code.to_string();
            create_all(
                ctx,
                pools,
                &stats,
                EntityKind::Suite,
                Some(code),
                jobs,
                move |payload: Value| {
                    let destination = Arc::clone(&destination);
                    let target = target.clone();
                    async move {
                        destination
                            .create_entity(EntityKind::Suite, Some(&target), &payload)
                            .await
                    }
                },
                move |source_id, id: &u64| {
                    table.insert_new(project_key(&key_code, source_id), *id);
                },
            )
            .await?;
        }

        Ok(mappings)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::stage::test_support::{FakeDestination, FakeSource, harness, project};

    fn records(values: Vec<Value>) -> Vec<EntityRecord> {
        values
            .into_iter()
            .filter_map(EntityRecord::from_value)
            .collect()
    }

    #[test]
    fn depths_follow_parent_chain() {
        let sections = records(vec![
            json!({"id": 3, "parent_id": 2}),
            json!({"id": 1}),
            json!({"id": 2, "parent_id": 1}),
            json!({"id": 4, "parent_id": 99}),
        ]);
        let depths = section_depths(&sections);
        assert_eq!(depths[&1], 0);
        assert_eq!(depths[&2], 1);
        assert_eq!(depths[&3], 2);
        assert_eq!(depths[&4], 0);
    }

    #[test]
    fn depth_walk_stops_on_cycles() {
        let sections = records(vec![
            json!({"id": 1, "parent_id": 2}),
            json!({"id": 2, "parent_id": 1}),
        ]);
        let depths = section_depths(&sections);
        assert!(depths[&1] <= 2);
        assert!(depths[&2] <= 2);
    }

    #[tokio::test]
    async fn children_point_at_created_parents() {
        let source = FakeSource::new().with(
            EntityKind::Section,
            ListFilter::project(10),
            vec![
                json!({"id": 2, "name": "Login", "parent_id": 1}),
                json!({"id": 1, "name": "Auth"}),
                json!({"id": 3, "name": "Tokens", "parent_id": 2}),
            ],
        );
        let destination = FakeDestination::new();
        let (ctx, pools, mappings) = harness(source, destination.clone(), |_| {});
        let demo = project("DEMO", 10);

        let mappings = SuiteStage
            .run(&ctx, &pools, mappings, Some(&demo))
            .await
            .unwrap();

        let auth = mappings.suites.get(&project_key("DEMO", 1)).unwrap();
        let login = mappings.suites.get(&project_key("DEMO", 2)).unwrap();
        let created = destination.created(EntityKind::Suite);
        let login_payload = created
            .iter()
            .find(|(_, p)| p["title"] == "Login")
            .map(|(_, p)| p.clone())
            .unwrap();
        let tokens_payload = created
            .iter()
            .find(|(_, p)| p["title"] == "Tokens")
            .map(|(_, p)| p.clone())
            .unwrap();

        assert_eq!(created[0].1["title"], "Auth");
        assert!(created[0].1.get("parent_id").is_none());
        assert_eq!(login_payload["parent_id"], auth);
        assert_eq!(tokens_payload["parent_id"], login);
    }

    #[tokio::test]
    async fn split_project_reads_only_its_suite() {
        let source = FakeSource::new()
            .with(
                EntityKind::Section,
                ListFilter::project(10).with_suite(Some(7)),
                vec![json!({"id": 1, "name": "Only mine"})],
            )
            .with(
                EntityKind::Section,
                ListFilter::project(10),
                vec![json!({"id": 9, "name": "Everything"})],
            );
        let destination = FakeDestination::new();
        let (ctx, pools, mappings) = harness(source, destination.clone(), |_| {});
        let mut split = project("SPLIT", 10);
        split.suite_id = Some(7);

        let mappings = SuiteStage
            .run(&ctx, &pools, mappings, Some(&split))
            .await
            .unwrap();

        assert!(mappings.suites.contains(&project_key("SPLIT", 1)));
        assert!(!mappings.suites.contains(&project_key("SPLIT", 9)));
    }
}
