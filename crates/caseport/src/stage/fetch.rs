use std::sync::Arc;

use crate::migrate::{MigrationContext, MigrationProgress};
use crate::pool::Pools;
use crate::service::{EntityKind, EntityRecord, ListFilter, ServiceError, SourceService};

use super::{StageError, StageKind};

/// Walk every page of a source listing.
///
/// Pages are requested one after another, each through the source pool,
/// since the next offset is only known once a page arrives.
pub(super) async fn fetch_all(
    ctx: &MigrationContext,
    pools: &Pools,
    stage: StageKind,
    kind: EntityKind,
    filter: ListFilter,
) -> Result<Vec<EntityRecord>, StageError> {
    let mut items = Vec::new();
    let mut offset = 0;
    let mut page_number = 0u32;

    loop {
        let source = Arc::clone(ctx.source());
        let page_filter = filter.clone();
        let page = pools
            .source()
            .run(async move { source.list_page(kind, &page_filter, offset).await })
            .await?
            .map_err(|source| StageError::Source { stage, source })?;

        page_number += 1;
        let count = page.items.len();
        items.extend(page.items);

        ctx.emit(MigrationProgress::FetchedPage {
            kind,
            page: page_number,
            count,
            total_so_far: items.len(),
        });

        match page.next_offset {
            Some(next) if next > offset && count > 0 => offset = next,
            _ => break,
        }
    }

    tracing::debug!(
        kind = %kind,
        pages = page_number,
        total = items.len(),
        "Fetched source listing"
    );

    Ok(items)
}

/// Walk every page of a listing directly, for use inside a worker task that
/// already holds a source slot.
pub(super) async fn list_all(
    source: &dyn SourceService,
    kind: EntityKind,
    filter: &ListFilter,
) -> Result<Vec<EntityRecord>, ServiceError> {
    let mut items = Vec::new();
    let mut offset = 0;

    loop {
        let page = source.list_page(kind, filter, offset).await?;
        let count = page.items.len();
        items.extend(page.items);

        match page.next_offset {
            Some(next) if next > offset && count > 0 => offset = next,
            _ => return Ok(items),
        }
    }
}
