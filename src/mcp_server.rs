use rmcp::{
    ErrorData as McpError, ServerHandler,
    handler::server::{router::tool::ToolRouter, wrapper::Parameters},
    model::{CallToolResult, ServerCapabilities, ServerInfo},
    tool, tool_handler, tool_router,
};

use crate::pipeline::MediaPipeline;
use crate::tools::{
    CleanupOrphansRequest, ExportAssetBundleRequest, ExportMediaManifestRequest, GetDisplayImageRequest,
    ImportMediaManifestRequest, PreviewCleanupRequest, RegistryUsageStatsRequest, RepairRegistryRequest,
    ValidateMediaManifestRequest,
};

#[derive(Clone)]
pub struct MediaServer {
    tool_router: ToolRouter<Self>,
    pipeline: MediaPipeline,
}

impl MediaServer {
    pub fn new(pipeline: MediaPipeline) -> Self {
        Self {
            tool_router: Self::tool_router(),
            pipeline,
        }
    }
}

#[tool_router]
impl MediaServer {
    #[tool(
        description = "Render an original at the requested size (width/height in pixels, crop fill|fit|scale, gravity). Returns the derivative image and its cache key. Never upscales."
    )]
    async fn get_display_image(
        &self,
        Parameters(request): Parameters<GetDisplayImageRequest>,
    ) -> Result<CallToolResult, McpError> {
        crate::tools::get_display_image(&self.pipeline, Parameters(request)).await
    }

    #[tool(description = "List originals and derivatives that cleanup would remove, without deleting anything")]
    async fn preview_cleanup(
        &self,
        Parameters(request): Parameters<PreviewCleanupRequest>,
    ) -> Result<CallToolResult, McpError> {
        crate::tools::preview_cleanup(&self.pipeline, Parameters(request)).await
    }

    #[tool(
        description = "Delete originals no content references, and every derivative without a live original. Run preview_cleanup first."
    )]
    async fn cleanup_orphans(
        &self,
        Parameters(request): Parameters<CleanupOrphansRequest>,
    ) -> Result<CallToolResult, McpError> {
        crate::tools::cleanup_orphans(&self.pipeline, Parameters(request)).await
    }

    #[tool(description = "Generate the site's media.json manifest")]
    async fn export_media_manifest(
        &self,
        Parameters(request): Parameters<ExportMediaManifestRequest>,
    ) -> Result<CallToolResult, McpError> {
        crate::tools::export_media_manifest(&self.pipeline, Parameters(request)).await
    }

    #[tool(description = "Summarize the originals and derivatives an export of the site would contain, with SHA-256 digests")]
    async fn export_asset_bundle(
        &self,
        Parameters(request): Parameters<ExportAssetBundleRequest>,
    ) -> Result<CallToolResult, McpError> {
        crate::tools::export_asset_bundle(&self.pipeline, Parameters(request)).await
    }

    #[tool(description = "Check a media.json document for structural errors and warnings")]
    async fn validate_media_manifest(
        &self,
        Parameters(request): Parameters<ValidateMediaManifestRequest>,
    ) -> Result<CallToolResult, McpError> {
        crate::tools::validate_media_manifest(&self.pipeline, Parameters(request)).await
    }

    #[tool(
        description = "Import a media.json document into a site's registry, optionally remapping paths for another image service"
    )]
    async fn import_media_manifest(
        &self,
        Parameters(request): Parameters<ImportMediaManifestRequest>,
    ) -> Result<CallToolResult, McpError> {
        crate::tools::import_media_manifest(&self.pipeline, Parameters(request)).await
    }

    #[tool(description = "Image, reference and derivative counts for a site")]
    async fn registry_usage_stats(
        &self,
        Parameters(request): Parameters<RegistryUsageStatsRequest>,
    ) -> Result<CallToolResult, McpError> {
        crate::tools::registry_usage_stats(&self.pipeline, Parameters(request)).await
    }

    #[tool(description = "Reconcile the registry with stored originals and content references, reporting every change")]
    async fn repair_registry(
        &self,
        Parameters(request): Parameters<RepairRegistryRequest>,
    ) -> Result<CallToolResult, McpError> {
        crate::tools::repair_registry(&self.pipeline, Parameters(request)).await
    }
}

#[tool_handler]
impl ServerHandler for MediaServer {
    fn get_info(&self) -> ServerInfo {
        ServerInfo {
            capabilities: ServerCapabilities::builder().enable_tools().build(),
            instructions: Some(
                "Derivative images, orphan cleanup and media.json export/import for content sites.".into(),
            ),
            ..Default::default()
        }
    }
}
