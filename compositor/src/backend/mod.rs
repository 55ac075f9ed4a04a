//! Backend — the event loop that drives the immersive session.

pub mod headless;

use std::path::PathBuf;
use std::time::Duration;

use crate::vr::immersion::ControllerConfig;
use crate::vr::layer_config::CapabilityQuery;
use crate::vr::render_config::RenderConfiguration;

/// IPC socket configuration.
#[derive(Debug, Clone, Default)]
pub struct IpcConfig {
    /// Socket path; `None` uses `$XDG_RUNTIME_DIR/immersive-ipc.sock`.
    pub socket_path: Option<PathBuf>,
    /// Log every message in both directions.
    pub trace: bool,
}

/// Session and render-loop tuning.
#[derive(Debug, Clone)]
pub struct SessionConfig {
    pub frame_rate: u32,
    /// Latency of the headless open/dismiss service.
    pub open_latency: Duration,
    pub controller: ControllerConfig,
    pub initial_render: RenderConfiguration,
    /// Exit after this long (CI).
    pub exit_after: Option<Duration>,
    pub poll_interval: Duration,
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            frame_rate: 90,
            open_latency: Duration::from_millis(250),
            controller: ControllerConfig::default(),
            initial_render: RenderConfiguration::default(),
            exit_after: None,
            poll_interval: Duration::from_millis(50),
        }
    }
}

/// Run the compositor until shutdown.
pub fn run(
    capabilities: Box<dyn CapabilityQuery>,
    ipc_config: IpcConfig,
    config: SessionConfig,
) -> anyhow::Result<()> {
    headless::run(capabilities, ipc_config, config)
}
