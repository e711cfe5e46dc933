//! Migration context builder.
//!
//! Bundles the collaborators every stage needs so stage signatures stay
//! short.
//!
//! # Example
//!
//! ```ignore
//! use caseport::migrate::{MigrationContext, MigrationOptions};
//!
//! let ctx = MigrationContext::builder()
//!     .source(testrail)
//!     .destination(qase)
//!     .options(MigrationOptions::default())
//!     .progress(callback)
//!     .build()?;
//! ```

use std::sync::Arc;

use crate::service::{DestinationService, DisabledProvisioner, SourceService, UserProvisioner};

use super::progress::{MigrationProgress, ProgressCallback, emit};
use super::types::MigrationOptions;

/// Error type for context construction.
#[derive(Debug, thiserror::Error)]
pub enum ContextError {
    /// Missing required field in builder.
    #[error("Missing required field: {field}")]
    MissingField { field: &'static str },
}

/// Builder for [`MigrationContext`].
#[derive(Default)]
pub struct MigrationContextBuilder {
    source: Option<Arc<dyn SourceService>>,
    destination: Option<Arc<dyn DestinationService>>,
    provisioner: Option<Arc<dyn UserProvisioner>>,
    options: Option<MigrationOptions>,
    progress: Option<Arc<ProgressCallback>>,
}

impl MigrationContextBuilder {
    pub fn new() -> Self {
        Self::default()
    }

    /// Set the source platform service.
    pub fn source(mut self, source: impl SourceService + 'static) -> Self {
        self.source = Some(Arc::new(source));
        self
    }

    /// Set an already shared source service.
    pub fn source_arc(mut self, source: Arc<dyn SourceService>) -> Self {
        self.source = Some(source);
        self
    }

    /// Set the destination platform service.
    pub fn destination(mut self, destination: impl DestinationService + 'static) -> Self {
        self.destination = Some(Arc::new(destination));
        self
    }

    /// Set an already shared destination service.
    pub fn destination_arc(mut self, destination: Arc<dyn DestinationService>) -> Self {
        self.destination = Some(destination);
        self
    }

    /// Set the user provisioner. Defaults to [`DisabledProvisioner`].
    pub fn provisioner(mut self, provisioner: impl UserProvisioner + 'static) -> Self {
        self.provisioner = Some(Arc::new(provisioner));
        self
    }

    pub fn provisioner_arc(mut self, provisioner: Arc<dyn UserProvisioner>) -> Self {
        self.provisioner = Some(provisioner);
        self
    }

    pub fn options(mut self, options: MigrationOptions) -> Self {
        self.options = Some(options);
        self
    }

    /// Set the progress callback.
    pub fn progress(mut self, callback: Arc<ProgressCallback>) -> Self {
        self.progress = Some(callback);
        self
    }

    /// Build the context.
    ///
    /// # Errors
    ///
    /// Returns `ContextError::MissingField` if a service is not set.
    pub fn build(self) -> Result<MigrationContext, ContextError> {
        let source = self
            .source
            .ok_or(ContextError::MissingField { field: "source" })?;
        let destination = self.destination.ok_or(ContextError::MissingField {
            field: "destination",
        })?;

        Ok(MigrationContext {
            source,
            destination,
            provisioner: self
                .provisioner
                .unwrap_or_else(|| Arc::new(DisabledProvisioner)),
            options: self.options.unwrap_or_default(),
            progress: self.progress,
        })
    }
}

/// Services, options and progress observer shared by all stages.
pub struct MigrationContext {
    source: Arc<dyn SourceService>,
    destination: Arc<dyn DestinationService>,
    provisioner: Arc<dyn UserProvisioner>,
    options: MigrationOptions,
    progress: Option<Arc<ProgressCallback>>,
}

impl MigrationContext {
    pub fn builder() -> MigrationContextBuilder {
        MigrationContextBuilder::new()
    }

    pub fn source(&self) -> &Arc<dyn SourceService> {
        &self.source
    }

    pub fn destination(&self) -> &Arc<dyn DestinationService> {
        &self.destination
    }

    pub fn provisioner(&self) -> &Arc<dyn UserProvisioner> {
        &self.provisioner
    }

    pub fn options(&self) -> &MigrationOptions {
        &self.options
    }

    pub fn progress(&self) -> Option<&ProgressCallback> {
        self.progress.as_deref()
    }

    /// Shared handle to the callback, for worker tasks.
    pub fn progress_handle(&self) -> Option<Arc<ProgressCallback>> {
        self.progress.clone()
    }

    #[inline]
    pub fn emit(&self, event: MigrationProgress) {
        emit(self.progress(), event);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use async_trait::async_trait;
    use serde_json::Value;

    use crate::service::{
        AttachmentData, AttachmentRef, DestinationField, DestinationUser, EntityKind, ListFilter,
        Page, Result as ServiceResult, ServiceError,
    };

    struct NullSource;

    #[async_trait]
    impl SourceService for NullSource {
        async fn list_page(&self, _: EntityKind, _: &ListFilter, _: usize) -> ServiceResult<Page> {
            Ok(Page::default())
        }

        async fn fetch_attachment(&self, _: u64) -> ServiceResult<AttachmentData> {
            Err(ServiceError::not_found("attachment"))
        }
    }

    struct NullDestination;

    #[async_trait]
    impl DestinationService for NullDestination {
        async fn list_users(&self) -> ServiceResult<Vec<DestinationUser>> {
            Ok(Vec::new())
        }

        async fn list_project_codes(&self) -> ServiceResult<Vec<String>> {
            Ok(Vec::new())
        }

        async fn list_custom_fields(&self) -> ServiceResult<Vec<DestinationField>> {
            Ok(Vec::new())
        }

        async fn create_project(&self, _: &Value) -> ServiceResult<String> {
            Err(ServiceError::unsupported("create_project"))
        }

        async fn create_entity(&self, _: EntityKind, _: Option<&str>, _: &Value) -> ServiceResult<u64> {
            Err(ServiceError::unsupported("create_entity"))
        }

        async fn create_shared_step(&self, _: &str, _: &Value) -> ServiceResult<String> {
            Err(ServiceError::unsupported("create_shared_step"))
        }

        async fn upload_attachment(&self, _: &str, _: AttachmentData) -> ServiceResult<AttachmentRef> {
            Err(ServiceError::unsupported("upload_attachment"))
        }
    }

    #[test]
    fn build_requires_source_and_destination() {
        let err = MigrationContext::builder()
            .destination(NullDestination)
            .build()
            .err()
            .unwrap();
        assert!(matches!(err, ContextError::MissingField { field: "source" }));

        let err = MigrationContext::builder()
            .source(NullSource)
            .build()
            .err()
            .unwrap();
        assert!(matches!(
            err,
            ContextError::MissingField {
                field: "destination"
            }
        ));
    }

    #[test]
    fn build_defaults_provisioner_and_options() {
        let ctx = MigrationContext::builder()
            .source(NullSource)
            .destination(NullDestination)
            .build()
            .unwrap();

        assert!(!ctx.provisioner().is_enabled());
        assert!(ctx.options().stages.users);
        assert!(ctx.progress().is_none());
        ctx.emit(MigrationProgress::Warning {
            message: "dropped".to_string(),
        });
    }
}
