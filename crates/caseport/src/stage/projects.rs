use std::collections::{BTreeSet, HashSet};
use std::sync::Arc;

use async_trait::async_trait;
use serde_json::{Value, json};

use crate::mapping::{Mappings, ProjectMapping};
use crate::migrate::{MigrationContext, MigrationProgress};
use crate::pool::Pools;
use crate::service::{EntityKind, EntityRecord, ListFilter};

use super::create::{CreateJob, create_all, skip};
use super::fetch::fetch_all;
use super::{Stage, StageError, StageKind};

/// Source `suite_mode` for projects with several independent suites.
const SUITE_MODE_MULTIPLE: u64 = 3;

const MAX_CODE_LEN: usize = 10;

/// Creates one destination project per source project, or per source suite
/// for multi-suite projects, and fills [`Mappings::projects`] in source
/// order.
pub struct ProjectStage;

/// Derive a destination project code from a project title.
///
/// Codes are 2 to 10 uppercase ASCII letters, built from the initials of
/// the title's words (or its letters when there are too few words). A code
/// already in `taken` gets a letter suffix.
pub fn derive_project_code(title: &str, taken: &BTreeSet<String>) -> String {
    let initials: String = title
        .split(|c: char| !c.is_ascii_alphanumeric())
        .filter_map(|word| word.chars().find(char::is_ascii_alphabetic))
        .collect();

    let mut base = if initials.len() >= 2 {
        initials
    } else {
        title.chars().filter(char::is_ascii_alphabetic).collect()
    };
    base.make_ascii_uppercase();
    base.truncate(MAX_CODE_LEN);
    while base.len() < 2 {
        base.push('P');
    }

    if !taken.contains(&base) {
        return base;
    }

    (0usize..)
        .map(|n| {
            let suffix = alpha_suffix(n);
            let keep = MAX_CODE_LEN.saturating_sub(suffix.len()).min(base.len());
            format!("{}{suffix}", &base[..keep])
        })
        .find(|candidate| !taken.contains(candidate))
        .unwrap_or(base)
}

/// 0 -> "A", 25 -> "Z", 26 -> "AA", ...
fn alpha_suffix(mut n: usize) -> String {
    let mut out = Vec::new();
    loop {
        out.push(b'A' + (n % 26) as u8);
        if n < 26 {
            break;
        }
        n = n / 26 - 1;
    }
    out.reverse();
    String::from_utf8(out).unwrap_or_default()
}

fn project_payload(title: &str, code: &str, record: &EntityRecord) -> Value {
    json!({
        "title": title,
        "code": code,
        "description": record.str("announcement").unwrap_or_default(),
        "access": "all",
        "settings": { "runs": { "auto_complete": false } },
    })
}

enum Planned {
    Existing(ProjectMapping),
    Create { job: usize, mapping: ProjectMapping },
}

#[async_trait]
impl Stage for ProjectStage {
    fn kind(&self) -> StageKind {
        StageKind::Projects
    }

    async fn run(
        &self,
        ctx: &MigrationContext,
        pools: &Pools,
        mut mappings: Mappings,
        _project: Option<&ProjectMapping>,
    ) -> Result<Mappings, StageError> {
        let projects = fetch_all(
            ctx,
            pools,
            StageKind::Projects,
            EntityKind::Project,
            ListFilter::default(),
        )
        .await?;

        ctx.emit(MigrationProgress::EntitiesDiscovered {
            stage: StageKind::Projects,
            kind: EntityKind::Project,
            project: None,
            total: projects.len(),
        });

        let destination = Arc::clone(ctx.destination());
        let existing: HashSet<String> = pools
            .destination()
            .run(async move { destination.list_project_codes().await })
            .await?
            .map_err(|source| StageError::Destination {
                stage: StageKind::Projects,
                source,
            })?
            .into_iter()
            .map(|code| code.to_ascii_uppercase())
            .collect();

        let stats = Arc::clone(&mappings.stats);
        let mut taken: BTreeSet<String> = mappings.projects.iter().map(|p| p.code.clone()).collect();
        let mut planned = Vec::new();
        let mut jobs = Vec::new();

        for project in projects {
            if !ctx.options().include_completed_projects && project.bool("is_completed") == Some(true)
            {
                tracing::debug!(source_id = project.id, "Skipping completed project");
                continue;
            }

            let name = project.title();
            let splits: Vec<(Option<u64>, Option<String>)> =
                if project.u64("suite_mode") == Some(SUITE_MODE_MULTIPLE) {
                    let suites = fetch_all(
                        ctx,
                        pools,
                        StageKind::Projects,
                        EntityKind::Suite,
                        ListFilter::project(project.id),
                    )
                    .await?;
                    suites
                        .iter()
                        .map(|suite| (Some(suite.id), Some(suite.title())))
                        .collect()
                } else {
                    vec![(None, None)]
                };

            for (suite_id, suite_title) in splits {
                if mappings
                    .projects
                    .iter()
                    .any(|p| p.source_id == project.id && p.suite_id == suite_id)
                {
                    skip(ctx, &stats, EntityKind::Project, project.id, None);
                    continue;
                }

                let title = match &suite_title {
                    Some(suite) => format!("{name} - {suite}"),
                    None => name.clone(),
                };
                let code = derive_project_code(&title, &taken);
                taken.insert(code.clone());

                let mapping = ProjectMapping {
                    source_id: project.id,
                    code: code.clone(),
                    name: name.clone(),
                    suite_id,
                    suite_title,
                };

                if existing.contains(&code) {
                    tracing::info!(code = %code, "Project already exists at destination");
                    skip(ctx, &stats, EntityKind::Project, project.id, None);
                    planned.push(Planned::Existing(mapping));
                } else {
                    planned.push(Planned::Create {
                        job: jobs.len(),
                        mapping,
                    });
                    jobs.push(CreateJob::new(
                        project.id,
                        project_payload(&title, &code, &project),
                    ));
                }
            }
        }

        let destination = Arc::clone(ctx.destination());
        let created = create_all(
            ctx,
            pools,
            &stats,
            EntityKind::Project,
            None,
            jobs,
            move |payload: Value| {
                let destination = Arc::clone(&destination);
                async move { destination.create_project(&payload).await }
            },
            |_, _: &String| {},
        )
        .await?;

        for plan in planned {
            match plan {
                Planned::Existing(mapping) => {
                    mappings.add_project(mapping);
                }
                Planned::Create { job, mut mapping } => {
                    if let Some(Some(code)) = created.get(job) {
                        mapping.code = code.clone();
                        mappings.add_project(mapping);
                    }
                }
            }
        }

        Ok(mappings)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::stage::test_support::{FakeDestination, FakeSource, harness};

    fn taken(codes: &[&str]) -> BTreeSet<String> {
        codes.iter().map(|c| c.to_string()).collect()
    }

    #[test]
    fn code_uses_word_initials() {
        assert_eq!(derive_project_code("Mobile Banking App", &taken(&[])), "MBA");
        assert_eq!(derive_project_code("core-api v2", &taken(&[])), "CAV");
    }

    #[test]
    fn code_falls_back_to_letters_for_single_words() {
        assert_eq!(derive_project_code("web", &taken(&[])), "WEB");
        assert_eq!(derive_project_code("2024 Release", &taken(&[])), "RELEASE");
        assert_eq!(
            derive_project_code("Infrastructure", &taken(&[])),
            "INFRASTRUC"
        );
    }

    #[test]
    fn code_is_padded_to_two_letters() {
        assert_eq!(derive_project_code("X", &taken(&[])), "XP");
        assert_eq!(derive_project_code("1234", &taken(&[])), "PP");
    }

    #[test]
    fn code_is_unique_within_taken_set() {
        assert_eq!(derive_project_code("Mobile Banking App", &taken(&["MBA"])), "MBAA");
        assert_eq!(
            derive_project_code("Mobile Banking App", &taken(&["MBA", "MBAA"])),
            "MBAB"
        );
        assert_eq!(
            derive_project_code("Infrastructure", &taken(&["INFRASTRUC"])),
            "INFRASTRUA"
        );
    }

    #[test]
    fn alpha_suffix_counts_like_spreadsheet_columns() {
        assert_eq!(alpha_suffix(0), "A");
        assert_eq!(alpha_suffix(25), "Z");
        assert_eq!(alpha_suffix(26), "AA");
        assert_eq!(alpha_suffix(27), "AB");
    }

    #[tokio::test]
    async fn creates_projects_in_source_order_and_maps_existing_codes() {
        let source = FakeSource::new().with(
            EntityKind::Project,
            ListFilter::default(),
            vec![
                json!({"id": 1, "name": "Mobile Banking App"}),
                json!({"id": 2, "name": "Web Portal"}),
                json!({"id": 3, "name": "Legacy", "is_completed": true}),
            ],
        );
        let destination = FakeDestination::new().with_project_codes(&["wp"]);
        let (ctx, pools, mappings) = harness(source, destination.clone(), |_| {});

        let mappings = ProjectStage.run(&ctx, &pools, mappings, None).await.unwrap();

        let codes: Vec<_> = mappings.projects.iter().map(|p| p.code.as_str()).collect();
        assert_eq!(codes, ["MBA", "WP", "LEGACY"]);

        let created = destination.created(EntityKind::Project);
        assert_eq!(created.len(), 2);
        assert_eq!(created[0].1["title"], "Mobile Banking App");

        let stats = mappings.stats.entity(EntityKind::Project);
        assert_eq!(stats.attempted, 2);
        assert_eq!(stats.succeeded, 2);
        assert_eq!(stats.skipped, 1);
    }

    #[tokio::test]
    async fn completed_projects_can_be_excluded() {
        let source = FakeSource::new().with(
            EntityKind::Project,
            ListFilter::default(),
            vec![
                json!({"id": 1, "name": "Active"}),
                json!({"id": 2, "name": "Done", "is_completed": true}),
            ],
        );
        let (ctx, pools, mappings) = harness(source, FakeDestination::new(), |options| {
            options.include_completed_projects = false;
        });

        let mappings = ProjectStage.run(&ctx, &pools, mappings, None).await.unwrap();
        assert_eq!(mappings.projects.len(), 1);
        assert_eq!(mappings.projects[0].source_id, 1);
    }

    #[tokio::test]
    async fn multi_suite_project_is_split_per_suite() {
        let source = FakeSource::new()
            .with(
                EntityKind::Project,
                ListFilter::default(),
                vec![json!({"id": 5, "name": "Platform", "suite_mode": 3})],
            )
            .with(
                EntityKind::Suite,
                ListFilter::project(5),
                vec![
                    json!({"id": 50, "name": "Backend"}),
                    json!({"id": 51, "name": "Frontend"}),
                ],
            );
        let destination = FakeDestination::new();
        let (ctx, pools, mappings) = harness(source, destination.clone(), |_| {});

        let mappings = ProjectStage.run(&ctx, &pools, mappings, None).await.unwrap();

        assert_eq!(mappings.projects.len(), 2);
        assert_eq!(mappings.projects[0].suite_id, Some(50));
        assert_eq!(mappings.projects[0].suite_title.as_deref(), Some("Backend"));
        assert_eq!(mappings.projects[1].suite_id, Some(51));
        assert_ne!(mappings.projects[0].code, mappings.projects[1].code);

        let titles: Vec<_> = destination
            .created(EntityKind::Project)
            .into_iter()
            .map(|(_, payload)| payload["title"].as_str().unwrap().to_string())
            .collect();
        assert!(titles.contains(&"Platform - Backend".to_string()));
    }

    #[tokio::test]
    async fn failed_project_is_left_out_of_mapping() {
        let source = FakeSource::new().with(
            EntityKind::Project,
            ListFilter::default(),
            vec![
                json!({"id": 1, "name": "Alpha Beta"}),
                json!({"id": 2, "name": "Gamma Delta"}),
            ],
        );
        let destination = FakeDestination::new().failing_title("Alpha Beta");
        let (ctx, pools, mappings) = harness(source, destination, |_| {});

        let mappings = ProjectStage.run(&ctx, &pools, mappings, None).await.unwrap();

        assert_eq!(mappings.projects.len(), 1);
        assert_eq!(mappings.projects[0].code, "GD");
        let stats = mappings.stats.snapshot();
        assert_eq!(stats.entity(EntityKind::Project).failed, 1);
        assert_eq!(stats.failures[0].source_id, 1);
    }
}
