use anyhow::{Context, Result};
use std::sync::Arc;
use tokio::sync::Semaphore;

use crate::backend::{proxy, ContainerCli, ImageBackend};
use crate::pipeline::context::DescriptorTemplate;
use crate::pipeline::{Pipeline, PipelineConfig};
use crate::server::settings::Settings;

/// Read-only state shared by every request
#[derive(Clone)]
pub struct AppState {
    pub settings: Arc<Settings>,
    pub pipeline: Pipeline,
    pub backend: Arc<dyn ImageBackend>,
    /// Present when `pipeline.max_concurrent_builds` is non-zero
    pub build_slots: Option<Arc<Semaphore>>,
}

impl AppState {
    /// Build state for the HTTP server, checking that the container CLI works
    pub async fn new_for_server(settings: &Settings) -> Result<Self> {
        let mut cli = ContainerCli::new(settings.backend.container_cli.clone())
            .with_platform(settings.backend.platform.clone());
        if settings.backend.forward_proxy {
            let build_args = proxy::proxy_build_args();
            if !build_args.is_empty() {
                tracing::info!("Injecting {} proxy variables into builds", build_args.len());
            }
            cli = cli.with_build_args(build_args);
        }

        cli.check_available().await.with_context(|| {
            format!(
                "{} CLI not usable. Please install Docker or Podman.",
                cli.program()
            )
        })?;

        let tmp_dir = settings.pipeline.tmp_dir();
        tokio::fs::create_dir_all(&tmp_dir)
            .await
            .with_context(|| format!("Failed to create temp dir {}", tmp_dir.display()))?;

        Ok(Self::with_backend(settings.clone(), Arc::new(cli)))
    }

    /// Assemble state around an already constructed backend
    pub fn with_backend(settings: Settings, backend: Arc<dyn ImageBackend>) -> Self {
        let pipeline = Pipeline::new(
            PipelineConfig {
                tmp_dir: settings.pipeline.tmp_dir(),
                registry_base: settings.registry.url.clone(),
                max_extracted_bytes: settings.pipeline.max_extracted_bytes,
                stage_timeout: settings.pipeline.stage_timeout(),
                descriptor: DescriptorTemplate {
                    base_image: settings.backend.base_image.clone(),
                    exposed_port: settings.backend.exposed_port,
                },
            },
            backend.clone(),
        );

        let build_slots = match settings.pipeline.max_concurrent_builds {
            0 => None,
            n => Some(Arc::new(Semaphore::new(n))),
        };

        Self {
            settings: Arc::new(settings),
            pipeline,
            backend,
            build_slots,
        }
    }
}
