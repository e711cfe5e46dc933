use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;
use serde_json::{Map, Value, json};

use crate::mapping::{FieldMapping, IdTable, Mappings, ProjectKey, ProjectMapping, project_key};
use crate::migrate::{MigrationContext, MigrationProgress};
use crate::pool::Pools;
use crate::service::{EntityKind, EntityRecord, ListFilter};

use super::create::{CreateJob, create_all, skip};
use super::fetch::fetch_all;
use super::shared_steps::{step_entry, step_text};
use super::{Stage, StageError, StageKind};

const LINK_MARKER: &str = "index.php?/attachments/get/";

/// Creates test cases with their steps, custom field values and
/// attachments.
pub struct CaseStage;

/// Replace source attachment links in `text` with the URL `resolve` returns
/// for the attachment id.
///
/// A link runs from the last whitespace or opening delimiter before
/// `index.php?/attachments/get/` to the end of the id, so both relative and
/// absolute links are replaced whole. Links `resolve` has no URL for are
/// left untouched.
pub fn rewrite_attachment_links(text: &str, resolve: impl Fn(u64) -> Option<String>) -> String {
    let mut out = String::with_capacity(text.len());
    let mut rest = text;

    while let Some(pos) = rest.find(LINK_MARKER) {
        let id_start = pos + LINK_MARKER.len();
        let id_len = rest[id_start..]
            .bytes()
            .take_while(u8::is_ascii_digit)
            .count();
        let end = id_start + id_len;

        let link_start = rest[..pos]
            .char_indices()
            .rev()
            .find(|&(_, c)| c.is_whitespace() || matches!(c, '(' | '[' | '<' | '"' | '\'' | '='))
            .map_or(0, |(i, c)| i + c.len_utf8());

        let url = rest[id_start..end].parse::<u64>().ok().and_then(&resolve);
        match url {
            Some(url) => {
                out.push_str(&rest[..link_start]);
                out.push_str(&url);
            }
            None => out.push_str(&rest[..end]),
        }
        rest = &rest[end..];
    }

    out.push_str(rest);
    out
}

/// Destination priority for a source priority id.
fn priority(source: Option<u64>) -> u64 {
    match source {
        Some(1) => 3,
        Some(2) => 2,
        Some(3 | 4) => 1,
        _ => 0,
    }
}

fn field_value(value: &Value) -> Option<String> {
    match value {
        Value::Null => None,
        Value::String(s) => Some(s.clone()),
        Value::Bool(b) => Some(if *b { "1" } else { "0" }.to_string()),
        Value::Number(n) => Some(n.to_string()),
        Value::Array(items) => Some(
            items
                .iter()
                .filter_map(field_value)
                .collect::<Vec<_>>()
                .join(","),
        ),
        Value::Object(_) => Some(value.to_string()),
    }
}

/// Lookups for building case payloads within one project.
struct CasePayloads<'a> {
    mappings: &'a Mappings,
    code: &'a str,
    fields: Vec<FieldMapping>,
    attachments: HashMap<u64, Vec<String>>,
}

impl<'a> CasePayloads<'a> {
    fn new(mappings: &'a Mappings, code: &'a str) -> Self {
        let mut attachments: HashMap<u64, Vec<String>> = HashMap::new();
        for attachment in mappings.attachments.snapshot().into_values() {
            if let Some(owner) = &attachment.attached_to
                && owner.entity_type == "case"
            {
                attachments
                    .entry(owner.entity_id)
                    .or_default()
                    .push(attachment.hash.clone());
            }
        }

        Self {
            mappings,
            code,
            fields: mappings.fields.snapshot().into_values().collect(),
            attachments,
        }
    }

    fn rewrite(&self, text: &str) -> String {
        rewrite_attachment_links(text, |id| {
            self.mappings.attachments.get(&id).and_then(|a| a.url)
        })
    }

    fn lookup(&self, table: &IdTable<ProjectKey, u64>, id: Option<u64>) -> Option<u64> {
        id.and_then(|id| table.get(&project_key(self.code, id)))
    }

    fn steps(&self, record: &EntityRecord) -> Vec<Value> {
        let separated = record
            .get("custom_steps_separated")
            .and_then(Value::as_array);

        let mut steps: Vec<Value> = match separated {
            Some(items) => items
                .iter()
                .map(|step| {
                    let shared = step
                        .get("shared_step_id")
                        .and_then(Value::as_u64)
                        .and_then(|id| self.mappings.shared_steps.get(&project_key(self.code, id)));
                    match shared {
                        Some(hash) => json!({ "shared": hash }),
                        None => {
                            let mut entry = step_entry(step);
                            entry["action"] = json!(self.rewrite(step_text(step, "content")));
                            entry["expected_result"] =
                                json!(self.rewrite(step_text(step, "expected")));
                            entry
                        }
                    }
                })
                .collect(),
            None => record
                .str("custom_steps")
                .map(|action| {
                    vec![json!({
                        "action": self.rewrite(action),
                        "expected_result": self.rewrite(record.str("custom_expected").unwrap_or_default()),
                    })]
                })
                .unwrap_or_default(),
        };

        for (position, step) in steps.iter_mut().enumerate() {
            if step.get("shared").is_none() {
                step["position"] = json!(position + 1);
            }
        }
        steps
    }

    fn payload(&self, record: &EntityRecord) -> Value {
        let mut payload = json!({
            "title": record.title(),
            "priority": priority(record.u64("priority_id")),
            "author_id": self.mappings.user_or_default(record.u64("created_by")),
            "steps": self.steps(record),
        });

        if let Some(text) = record.str("custom_preconds") {
            payload["preconditions"] = json!(self.rewrite(text));
        }
        if let Some(text) = record.str("custom_description") {
            payload["description"] = json!(self.rewrite(text));
        }
        if let Some(suite) = self.lookup(&self.mappings.suites, record.u64("section_id")) {
            payload["suite_id"] = json!(suite);
        }
        if let Some(milestone) = self.lookup(&self.mappings.milestones, record.u64("milestone_id")) {
            payload["milestone_id"] = json!(milestone);
        }

        let custom: Map<String, Value> = self
            .fields
            .iter()
            .filter_map(|field| {
                let value = field_value(record.get(&field.system_name)?)?;
                Some((field.id.to_string(), json!(self.rewrite(&value))))
            })
            .collect();
        if !custom.is_empty() {
            payload["custom_field"] = Value::Object(custom);
        }

        if let Some(hashes) = self.attachments.get(&record.id) {
            payload["attachments"] = json!(hashes);
        }

        payload
    }
}

#[async_trait]
impl Stage for CaseStage {
    fn kind(&self) -> StageKind {
        StageKind::Cases
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
                stage: StageKind::Cases,
            });
        };
        let code = project.code.as_str();
        let stats = Arc::clone(&mappings.stats);

        let cases = fetch_all(
            ctx,
            pools,
            StageKind::Cases,
            EntityKind::Case,
            ListFilter::project(project.source_id).with_suite(project.suite_id),
        )
        .await?;

        ctx.emit(MigrationProgress::EntitiesDiscovered {
            stage: StageKind::Cases,
            kind: EntityKind::Case,
            project: Some(code.to_string()),
            total: cases.len(),
        });

        let payloads = CasePayloads::new(&mappings, code);
        let mut jobs = Vec::new();
        for case in &cases {
            if mappings.cases.contains(&project_key(code, case.id)) {
                skip(ctx, &stats, EntityKind::Case, case.id, Some(code));
            } else {
                jobs.push(CreateJob::new(case.id, payloads.payload(case)));
            }
        }

        let destination = Arc::clone(ctx.destination());
        let target = code.to_string();
        let table = mappings.cases.clone();
        let key_code = code.to_string();
        create_all(
            ctx,
            pools,
            &stats,
            EntityKind::Case,
            Some(code),
            jobs,
            move |payload: Value| {
                let destination = Arc::clone(&destination);
                let target = target.clone();
                async move {
                    destination
                        .create_entity(EntityKind::Case, Some(&target), &payload)
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
    use crate::service::{AttachedTo, AttachmentRef};
    use crate::stage::test_support::{FakeDestination, FakeSource, harness, project};

    fn resolve(id: u64) -> Option<String> {
        (id == 12).then(|| "https://dest.example/a/12.png".to_string())
    }

    #[test]
    fn rewrites_relative_and_absolute_links() {
        assert_eq!(
            rewrite_attachment_links("See ![](index.php?/attachments/get/12) here", resolve),
            "See ![](https://dest.example/a/12.png) here"
        );
        assert_eq!(
            rewrite_attachment_links(
                "Shot: https://tr.example.com/index.php?/attachments/get/12",
                resolve
            ),
            "Shot: https://dest.example/a/12.png"
        );
    }

    #[test]
    fn leaves_unknown_and_malformed_links_alone() {
        let text = "a index.php?/attachments/get/99 b index.php?/attachments/get/ c";
        assert_eq!(rewrite_attachment_links(text, resolve), text);
        assert_eq!(rewrite_attachment_links("plain text", resolve), "plain text");
    }

    #[test]
    fn rewrites_every_link_in_text() {
        let text = "(index.php?/attachments/get/12)(index.php?/attachments/get/12)";
        assert_eq!(
            rewrite_attachment_links(text, resolve),
            "(https://dest.example/a/12.png)(https://dest.example/a/12.png)"
        );
    }

    #[test]
    fn priorities_map_to_destination_scale() {
        assert_eq!(priority(Some(1)), 3);
        assert_eq!(priority(Some(2)), 2);
        assert_eq!(priority(Some(4)), 1);
        assert_eq!(priority(None), 0);
    }

    #[tokio::test]
    async fn builds_payload_from_mapped_references() {
        let source = FakeSource::new().with(
            EntityKind::Case,
            ListFilter::project(10),
            vec![json!({
                "id": 100,
                "title": "Login works",
                "section_id": 1,
                "milestone_id": 2,
                "priority_id": 4,
                "created_by": 5,
                "custom_env": "staging",
                "custom_tags": [1, 3],
                "custom_preconds": "Look at index.php?/attachments/get/9",
                "custom_steps_separated": [
                    {"content": "Open", "expected": "Shown"},
                    {"shared_step_id": 3},
                ],
            })],
        );
        let destination = FakeDestination::new();
        let (ctx, pools, mappings) = harness(source, destination.clone(), |_| {});
        mappings.suites.insert_new(project_key("DEMO", 1), 500);
        mappings.milestones.insert_new(project_key("DEMO", 2), 600);
        mappings
            .shared_steps
            .insert_new(project_key("DEMO", 3), "shared-hash".to_string());
        mappings.fields.insert_new(
            1,
            FieldMapping {
                id: 77,
                system_name: "custom_env".to_string(),
            },
        );
        mappings.fields.insert_new(
            2,
            FieldMapping {
                id: 78,
                system_name: "custom_tags".to_string(),
            },
        );
        mappings.attachments.insert_new(
            9,
            AttachmentRef {
                hash: "att-9".to_string(),
                url: Some("https://dest.example/att-9.png".to_string()),
                filename: None,
                attached_to: Some(AttachedTo {
                    entity_type: "case".to_string(),
                    entity_id: 100,
                }),
            },
        );
        mappings.map_user(5, 50);
        let demo = project("DEMO", 10);

        let mappings = CaseStage
            .run(&ctx, &pools, mappings, Some(&demo))
            .await
            .unwrap();

        assert!(mappings.cases.contains(&project_key("DEMO", 100)));
        let created = destination.created(EntityKind::Case);
        let payload = &created[0].1;
        assert_eq!(payload["suite_id"], 500);
        assert_eq!(payload["milestone_id"], 600);
        assert_eq!(payload["author_id"], 50);
        assert_eq!(payload["priority"], 1);
        assert_eq!(payload["custom_field"]["77"], "staging");
        assert_eq!(payload["custom_field"]["78"], "1,3");
        assert_eq!(payload["preconditions"], "Look at https://dest.example/att-9.png");
        assert_eq!(payload["attachments"], json!(["att-9"]));
        assert_eq!(
            payload["steps"],
            json!([
                {"action": "Open", "expected_result": "Shown", "data": "", "position": 1},
                {"shared": "shared-hash"},
            ])
        );
    }

    #[tokio::test]
    async fn failed_cases_are_counted_and_others_created() {
        let source = FakeSource::new().with(
            EntityKind::Case,
            ListFilter::project(10),
            vec![
                json!({"id": 1, "title": "Good one"}),
                json!({"id": 2, "title": "Bad"}),
                json!({"id": 3, "title": "Good two"}),
            ],
        );
        let destination = FakeDestination::new().failing_title("Bad");
        let (ctx, pools, mappings) = harness(source, destination, |_| {});
        let demo = project("DEMO", 10);

        let mappings = CaseStage
            .run(&ctx, &pools, mappings, Some(&demo))
            .await
            .unwrap();

        let stats = mappings.stats.entity(EntityKind::Case);
        assert_eq!(stats.attempted, 3);
        assert_eq!(stats.succeeded, 2);
        assert_eq!(stats.failed, 1);
        assert_eq!(mappings.counts().cases, 2);
        assert_eq!(mappings.stats.snapshot().failures[0].source_id, 2);
    }
}
