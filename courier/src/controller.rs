use std::{
    path::{Path, PathBuf},
    sync::Arc,
};

use anyhow::Context;
use courier_common::{internal, logging};
use courier_delivery::{
    DeliveryConfig, MailService, MessageDefaults, TemplateConfig, TemplateRenderer,
    TransportConfig,
};
use courier_spool::SpoolConfig;
use serde::Deserialize;

/// Root of the configuration file
///
/// ```ron
/// #![enable(unwrap_variant_newtypes)]
/// Courier (
///     delivery: (
///         workers: 8,
///         retry: (max_attempts: 5, base_delay_ms: 2000),
///     ),
///     transport: Smtp(host: "smtp.example.com"),
///     defaults: (default_from: "Example <no-reply@example.com>"),
///     templates: (source: Directory("/etc/courier/templates")),
///     spool: File(path: "/var/spool/courier/failed"),
/// )
/// ```
#[derive(Debug, Default, Deserialize)]
pub struct Courier {
    #[serde(default)]
    pub delivery: DeliveryConfig,
    #[serde(default)]
    pub transport: TransportConfig,
    #[serde(default)]
    pub defaults: MessageDefaults,
    #[serde(default)]
    pub templates: TemplateConfig,
    #[serde(default)]
    pub spool: SpoolConfig,
}

impl Courier {
    /// # Errors
    /// If the file cannot be read or is not a valid configuration
    pub fn from_file(path: &Path) -> anyhow::Result<Self> {
        let content = std::fs::read_to_string(path)
            .with_context(|| format!("Failed to read config from {}", path.display()))?;
        ron::from_str(&content)
            .with_context(|| format!("Invalid configuration in {}", path.display()))
    }

    /// Load from `path`, or from the first default location that exists
    ///
    /// # Errors
    /// If no configuration file is found or it cannot be parsed
    pub fn load(path: Option<&Path>) -> anyhow::Result<Self> {
        match path {
            Some(path) => Self::from_file(path),
            None => Self::from_file(&find_config_file()?),
        }
    }

    /// Assemble the mail service from this configuration
    ///
    /// # Errors
    /// If the failure store cannot be initialised
    pub fn build(self) -> anyhow::Result<MailService> {
        let spool = self
            .spool
            .into_spool()
            .context("Failed to initialise the failure store")?;
        let transport = self.transport.build(self.defaults);
        let renderer = Arc::new(TemplateRenderer::new(self.templates));

        Ok(MailService::new(self.delivery, transport, spool, renderer))
    }

    /// Run the service until SIGINT or SIGTERM, then shut it down
    ///
    /// A second CTRL+C during shutdown abandons the drain.
    ///
    /// # Errors
    /// If the service cannot be built or signal handlers cannot be installed
    pub async fn run(self) -> anyhow::Result<()> {
        logging::init();

        let service = self.build()?;
        service.start();
        internal!(level = INFO, "Courier running");

        shutdown_requested().await?;

        tokio::select! {
            report = service.shutdown() => {
                internal!(
                    level = INFO,
                    drained = report.drained,
                    spilled = report.spilled,
                    "Courier stopped"
                );
            }
            _ = tokio::signal::ctrl_c() => {
                internal!(level = WARN, "Forced shutdown, queued jobs were not stored");
            }
        }

        Ok(())
    }
}

async fn shutdown_requested() -> anyhow::Result<()> {
    let mut terminate =
        tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate())?;

    tokio::select! {
        _ = tokio::signal::ctrl_c() => {
            internal!(level = INFO, "CTRL+C entered -- Enter it again to force shutdown");
        }
        _ = terminate.recv() => {
            internal!(level = INFO, "Terminate Signal received, shutting down");
        }
    };

    Ok(())
}

/// Find the configuration file using the following precedence:
/// 1. `COURIER_CONFIG` environment variable
/// 2. ./courier.config.ron (current working directory)
/// 3. /etc/courier/courier.config.ron (system-wide config)
///
/// # Errors
/// If `COURIER_CONFIG` names a missing file or no default location exists
pub fn find_config_file() -> anyhow::Result<PathBuf> {
    if let Ok(env_path) = std::env::var("COURIER_CONFIG") {
        let path = PathBuf::from(env_path);
        if path.exists() {
            return Ok(path);
        }
        anyhow::bail!(
            "COURIER_CONFIG points to non-existent file: {}",
            path.display()
        );
    }

    let default_paths = [
        PathBuf::from("./courier.config.ron"),
        PathBuf::from("/etc/courier/courier.config.ron"),
    ];

    if let Some(path) = default_paths.iter().find(|path| path.exists()) {
        return Ok(path.clone());
    }

    let paths_tried = default_paths
        .iter()
        .map(|p| format!("  - {}", p.display()))
        .collect::<Vec<_>>()
        .join("\n");

    anyhow::bail!(
        "No configuration file found. Tried:\n  - COURIER_CONFIG environment variable\n{paths_tried}"
    )
}
