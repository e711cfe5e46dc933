use std::collections::HashSet;
use std::sync::Arc;

use async_trait::async_trait;
use serde_json::Value;

use crate::mapping::{Mappings, ProjectMapping};
use crate::migrate::{MigrationContext, MigrationProgress};
use crate::pool::Pools;
use crate::service::{
    AttachedTo, AttachmentData, AttachmentRef, EntityKind, EntityRecord, ListFilter,
    ServiceError, short_error_message,
};

use super::create::{CreateJob, create_all, fail, skip};
use super::fetch::fetch_all;
use super::{Stage, StageError, StageKind};

/// Attachments held in memory at once.
const BATCH_SIZE: usize = 32;

/// Copies attachment content into the destination.
///
/// Runs before any project-scoped stage so cases can reference uploaded
/// files by hash. Each source project's attachments go into the first
/// destination project built from it.
pub struct AttachmentStage;

fn id_value(value: &Value) -> Option<u64> {
    value
        .as_u64()
        .or_else(|| value.as_str().and_then(|s| s.trim().parse().ok()))
}

/// Which source entity the attachment belongs to.
fn attached_to(record: &EntityRecord) -> Option<AttachedTo> {
    let entity_type = record.str("entity_type");
    let entity_id = record.get("entity_id").and_then(id_value);
    match (entity_type, entity_id) {
        (Some(entity_type), Some(entity_id)) => Some(AttachedTo {
            entity_type: entity_type.to_ascii_lowercase(),
            entity_id,
        }),
        _ => record
            .get("case_id")
            .and_then(id_value)
            .map(|entity_id| AttachedTo {
                entity_type: "case".to_string(),
                entity_id,
            }),
    }
}

#[async_trait]
impl Stage for AttachmentStage {
    fn kind(&self) -> StageKind {
        StageKind::Attachments
    }

    async fn run(
        &self,
        ctx: &MigrationContext,
        pools: &Pools,
        mappings: Mappings,
        _project: Option<&ProjectMapping>,
    ) -> Result<Mappings, StageError> {
        let stats = Arc::clone(&mappings.stats);
        let mut seen = HashSet::new();
        let targets: Vec<(u64, String)> = mappings
            .projects
            .iter()
            .filter(|p| seen.insert(p.source_id))
            .map(|p| (p.source_id, p.code.clone()))
            .collect();

        for (source_project, code) in targets {
            let records = fetch_all(
                ctx,
                pools,
                StageKind::Attachments,
                EntityKind::Attachment,
                ListFilter::project(source_project),
            )
            .await?;

            ctx.emit(MigrationProgress::EntitiesDiscovered {
                stage: StageKind::Attachments,
                kind: EntityKind::Attachment,
                project: Some(code.clone()),
                total: records.len(),
            });

            let mut pending = Vec::new();
            for record in records {
                if mappings.attachments.contains(&record.id) {
                    skip(ctx, &stats, EntityKind::Attachment, record.id, Some(&code));
                } else {
                    pending.push(record);
                }
            }

            for batch in pending.chunks(BATCH_SIZE) {
                let mut downloads = Vec::with_capacity(batch.len());
                for record in batch {
                    let source = Arc::clone(ctx.source());
                    let id = record.id;
                    let handle = pools
                        .source()
                        .submit(async move { source.fetch_attachment(id).await })
                        .await?;
                    downloads.push((record, handle));
                }

                let mut jobs: Vec<CreateJob<(AttachmentData, Option<AttachedTo>)>> =
                    Vec::with_capacity(downloads.len());
                for (record, handle) in downloads {
                    match handle.await {
                        Ok(Ok(data)) => {
                            jobs.push(CreateJob::new(record.id, (data, attached_to(record))));
                        }
                        Ok(Err(e)) => fail(
                            ctx,
                            &stats,
                            EntityKind::Attachment,
                            record.id,
                            Some(&code),
                            format!("download failed: {}", short_error_message(&e)),
                        ),
                        Err(e) => fail(
                            ctx,
                            &stats,
                            EntityKind::Attachment,
                            record.id,
                            Some(&code),
                            e.to_string(),
                        ),
                    }
                }

                let destination = Arc::clone(ctx.destination());
                let upload_code = code.clone();
                let table = mappings.attachments.clone();
                create_all(
                    ctx,
                    pools,
                    &stats,
                    EntityKind::Attachment,
                    Some(&code),
                    jobs,
                    move |(data, owner): (AttachmentData, Option<AttachedTo>)| {
                        let destination = Arc::clone(&destination);
                        let code = upload_code.clone();
                        async move {
                            let mut uploaded = destination.upload_attachment(&code, data).await?;
                            uploaded.attached_to = owner;
                            Ok::<_, ServiceError>(uploaded)
                        }
                    },
                    move |source_id, uploaded: &AttachmentRef| {
                        table.insert_new(source_id, uploaded.clone());
                    },
                )
                .await?;
            }
        }

        Ok(mappings)
    }
}
