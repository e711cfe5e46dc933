use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;
use serde_json::json;

use crate::mapping::{Mappings, ProjectMapping};
use crate::migrate::{MigrationContext, MigrationProgress};
use crate::pool::Pools;
use crate::service::{EntityKind, ListFilter};

use super::create::{CreateJob, create_all, skip};
use super::fetch::fetch_all;
use super::{Stage, StageError, StageKind};

/// Maps source users to destination users by email.
///
/// Unmatched users are provisioned when enabled, otherwise they fall back to
/// the configured default user.
pub struct UserStage;

fn fallback(ctx: &MigrationContext, mappings: &Mappings, source_id: u64, email: Option<String>) {
    if mappings.map_user_default(source_id) {
        tracing::debug!(source_id, email = ?email, "No destination user, using default");
        ctx.emit(MigrationProgress::UserFallback {
            source_id,
            email,
            default_user: mappings.default_user,
        });
    }
}

#[async_trait]
impl Stage for UserStage {
    fn kind(&self) -> StageKind {
        StageKind::Users
    }

    async fn run(
        &self,
        ctx: &MigrationContext,
        pools: &Pools,
        mappings: Mappings,
        _project: Option<&ProjectMapping>,
    ) -> Result<Mappings, StageError> {
        let users = fetch_all(
            ctx,
            pools,
            StageKind::Users,
            EntityKind::User,
            ListFilter::default(),
        )
        .await?;

        ctx.emit(MigrationProgress::EntitiesDiscovered {
            stage: StageKind::Users,
            kind: EntityKind::User,
            project: None,
            total: users.len(),
        });

        let destination = Arc::clone(ctx.destination());
        let existing = pools
            .destination()
            .run(async move { destination.list_users().await })
            .await?
            .map_err(|source| StageError::Destination {
                stage: StageKind::Users,
                source,
            })?;

        let by_email: HashMap<String, u64> = existing
            .into_iter()
            .filter_map(|u| u.email.map(|email| (email.to_lowercase(), u.id)))
            .collect();

        let provision = ctx.options().create_missing_users && ctx.provisioner().is_enabled();
        let stats = Arc::clone(&mappings.stats);
        let mut jobs = Vec::new();
        let mut pending_emails = Vec::new();

        for user in users {
            if mappings.users.get(&user.id).is_some_and(|m| m.confirmed) {
                skip(ctx, &stats, EntityKind::User, user.id, None);
                continue;
            }

            let email = user.str("email").map(str::to_lowercase);
            if let Some(&id) = email.as_ref().and_then(|e| by_email.get(e)) {
                mappings.map_user(user.id, id);
                skip(ctx, &stats, EntityKind::User, user.id, None);
                continue;
            }

            let active = user.bool("is_active").unwrap_or(true);
            match email {
                Some(email) if provision && active => {
                    jobs.push(CreateJob::new(
                        user.id,
                        json!({ "email": email, "name": user.title() }),
                    ));
                    pending_emails.push(Some(email));
                }
                email => {
                    stats.record_skip(EntityKind::User);
                    fallback(ctx, &mappings, user.id, email);
                }
            }
        }

        let source_ids: Vec<u64> = jobs.iter().map(|job| job.source_id).collect();
        let provisioner = Arc::clone(ctx.provisioner());
        let users_table = mappings.users.clone();

        let results = create_all(
            ctx,
            pools,
            &stats,
            EntityKind::User,
            None,
            jobs,
            move |payload| {
                let provisioner = Arc::clone(&provisioner);
                async move { provisioner.create_user(&payload).await }
            },
            move |source_id, created: &Option<u64>| {
                if let Some(id) = created {
                    users_table.confirm(source_id, *id);
                }
            },
        )
        .await?;

        for ((source_id, email), result) in source_ids.into_iter().zip(pending_emails).zip(results) {
            if !matches!(result, Some(Some(_))) {
                fallback(ctx, &mappings, source_id, email);
            }
        }

        Ok(mappings)
    }
}
