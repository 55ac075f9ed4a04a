//! Immersive compositor - layer negotiation and immersive session control
//! for a head-mounted display.
//!
//! UI toggles arrive over IPC; the render thread reads a lock-free snapshot
//! of the immersion style and portal cutoff angle every frame.

mod backend;
pub mod ipc;
mod render;
mod state;
pub mod vr;

use std::path::PathBuf;
use std::time::Duration;

use clap::Parser;
use tracing::{info, warn};

use crate::vr::immersion::{ControllerConfig, TogglePolicy};
use crate::vr::layer_config::{CapabilityQuery, DeviceCapabilities, LayerLayout};
use crate::vr::render_config::{RenderConfiguration, DEFAULT_CUTOFF_ANGLE};
use crate::vr::OpenXrCapabilityProbe;

#[derive(Parser, Debug)]
#[command(name = "immersive-compositor", about = "Immersive space compositor for head-mounted displays")]
struct Cli {
    /// IPC socket path (default: $XDG_RUNTIME_DIR/immersive-ipc.sock)
    #[arg(long)]
    ipc_socket: Option<String>,

    /// Log all IPC messages to stderr
    #[arg(long)]
    ipc_trace: bool,

    /// Exit after N seconds (CI testing)
    #[arg(long)]
    exit_after: Option<u64>,

    /// Render loop rate in Hz
    #[arg(long, default_value_t = 90)]
    frame_rate: u32,

    /// Device supports foveated rendering
    #[arg(long)]
    supports_foveation: bool,

    /// Comma-separated layouts the device offers: dedicated, layered, shared
    #[arg(long, default_value = "dedicated,layered")]
    layouts: String,

    /// Simulated latency of open/dismiss requests
    #[arg(long, default_value_t = 250)]
    open_latency_ms: u64,

    /// Revert a pending open/dismiss after this long (0 disables)
    #[arg(long, default_value_t = 10_000)]
    transition_timeout_ms: u64,

    /// Toggles during a pending transition: coalesce or reject
    #[arg(long, default_value = "coalesce")]
    toggle_policy: String,

    /// Initial portal cutoff angle in degrees (0-180)
    #[arg(long, default_value_t = DEFAULT_CUTOFF_ANGLE)]
    initial_cutoff_angle: f64,

    /// Capability source: cli or openxr
    #[arg(long, default_value = "cli")]
    capabilities: String,

    /// Show version and exit
    #[arg(long)]
    version: bool,
}

fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    if cli.version {
        println!("immersive-compositor {}", env!("CARGO_PKG_VERSION"));
        return Ok(());
    }

    // Initialize tracing
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "immersive_compositor=info".into()),
        )
        .init();

    info!("immersive-compositor v{} starting", env!("CARGO_PKG_VERSION"));

    let Some(toggle_policy) = TogglePolicy::from_str(&cli.toggle_policy) else {
        anyhow::bail!(
            "unknown toggle policy: {}. Use: coalesce or reject",
            cli.toggle_policy
        );
    };

    let Some(layouts) = LayerLayout::parse_list(&cli.layouts) else {
        anyhow::bail!(
            "invalid --layouts: {}. Use a comma-separated list of dedicated, layered, shared",
            cli.layouts
        );
    };
    let configured = DeviceCapabilities {
        supports_foveation: cli.supports_foveation,
        supported_layouts: layouts,
    };

    let capabilities: Box<dyn CapabilityQuery> = match cli.capabilities.as_str() {
        "cli" => Box::new(configured),
        "openxr" => match OpenXrCapabilityProbe::probe() {
            Ok(Some(probed)) => {
                info!(
                    "using OpenXR capabilities (foveation {})",
                    probed.supports_foveation
                );
                Box::new(probed)
            }
            Ok(None) => {
                warn!("OpenXR runtime unavailable, using configured capabilities");
                Box::new(configured)
            }
            Err(e) => {
                warn!("OpenXR probe failed: {e:#}, using configured capabilities");
                Box::new(configured)
            }
        },
        other => anyhow::bail!("unknown capability source: {other}. Use: cli or openxr"),
    };

    let session = backend::SessionConfig {
        frame_rate: cli.frame_rate.max(1),
        open_latency: Duration::from_millis(cli.open_latency_ms),
        controller: ControllerConfig {
            toggle_policy,
            transition_timeout: (cli.transition_timeout_ms > 0)
                .then(|| Duration::from_millis(cli.transition_timeout_ms)),
        },
        initial_render: RenderConfiguration {
            portal_cutoff_angle: cli.initial_cutoff_angle,
            ..RenderConfiguration::default()
        },
        exit_after: cli.exit_after.map(Duration::from_secs),
        ..backend::SessionConfig::default()
    };

    let ipc = backend::IpcConfig {
        socket_path: cli.ipc_socket.map(PathBuf::from),
        trace: cli.ipc_trace,
    };

    backend::run(capabilities, ipc, session)
}
