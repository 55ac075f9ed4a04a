//! Headless backend — the calloop loop that owns the session.
//!
//! Space request completions arrive from helper threads over a calloop
//! channel, transition timeouts are checked from a repeating timer, and
//! IPC clients are polled once per iteration. SIGTERM/SIGINT exit cleanly.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use calloop::channel::{self, Event};
use calloop::timer::{TimeoutAction, Timer};
use calloop::EventLoop;
use tracing::{info, warn};

use super::{IpcConfig, SessionConfig};
use crate::ipc::IpcServer;
use crate::state::ImmersiveState;
use crate::vr::immersion::{ImmersionController, SpaceCompletion};
use crate::vr::layer_config::CapabilityQuery;
use crate::vr::render_config::SharedRenderConfiguration;
use crate::vr::space_manager::HeadlessSpaceManager;

/// Global flag set by SIGTERM/SIGINT handlers.
static SHUTDOWN_REQUESTED: AtomicBool = AtomicBool::new(false);

/// How often pending transitions are checked for a timeout.
const TICK_INTERVAL: Duration = Duration::from_millis(100);

/// Install signal handlers for graceful shutdown (SIGTERM, SIGINT).
fn install_signal_handlers() {
    unsafe {
        libc::signal(libc::SIGTERM, signal_handler as libc::sighandler_t);
        libc::signal(libc::SIGINT, signal_handler as libc::sighandler_t);
    }
}

extern "C" fn signal_handler(_sig: libc::c_int) {
    SHUTDOWN_REQUESTED.store(true, Ordering::SeqCst);
}

pub fn run(
    capabilities: Box<dyn CapabilityQuery>,
    ipc_config: IpcConfig,
    config: SessionConfig,
) -> anyhow::Result<()> {
    let mut event_loop = EventLoop::<ImmersiveState>::try_new()?;
    let handle = event_loop.handle();

    // Completions: helper threads -> event loop
    let (completion_tx, completion_rx) = channel::channel::<SpaceCompletion>();
    let space_manager = HeadlessSpaceManager::new(config.open_latency, move |completion| {
        if completion_tx.send(completion).is_err() {
            warn!("event loop gone, dropping space completion");
        }
    });
    handle
        .insert_source(completion_rx, |event, _, state| {
            if let Event::Msg(completion) = event {
                state.handle_completion(completion);
            }
        })
        .map_err(|e| anyhow::anyhow!("failed to register completion channel: {}", e.error))?;

    handle
        .insert_source(Timer::from_duration(TICK_INTERVAL), |_, _, state| {
            state.tick();
            TimeoutAction::ToDuration(TICK_INTERVAL)
        })
        .map_err(|e| anyhow::anyhow!("failed to register tick timer: {}", e.error))?;

    let controller = ImmersionController::new(
        config.controller.clone(),
        Arc::new(SharedRenderConfiguration::new(config.initial_render)),
        Box::new(space_manager),
    );

    let socket_path = ipc_config
        .socket_path
        .unwrap_or_else(IpcServer::default_socket_path);
    let mut ipc_server = IpcServer::new(socket_path.clone());
    ipc_server.ipc_trace = ipc_config.trace;
    IpcServer::bind(&socket_path, &handle)?;

    let mut state = ImmersiveState::new(controller, capabilities, config.frame_rate, ipc_server);

    install_signal_handlers();

    let start_time = Instant::now();
    let mut last_status_log = Instant::now();
    let status_interval = Duration::from_secs(60);

    info!(
        "event loop running (poll interval {}ms, policy {})",
        config.poll_interval.as_millis(),
        config.controller.toggle_policy.as_str()
    );

    while state.running {
        if SHUTDOWN_REQUESTED.load(Ordering::SeqCst) {
            info!("Shutdown signal received, exiting");
            break;
        }

        if let Some(dur) = config.exit_after {
            if start_time.elapsed() >= dur {
                info!("exit timer fired after {}s", dur.as_secs());
                break;
            }
        }

        if last_status_log.elapsed() >= status_interval {
            let frames = state
                .render_session
                .as_ref()
                .map(|s| s.stats().frames.load(Ordering::Relaxed))
                .unwrap_or(0);
            info!(
                "status: session {}, {} frame(s), {} IPC client(s)",
                state.controller.phase().as_str(),
                frames,
                state.ipc_server.clients.len()
            );
            last_status_log = Instant::now();
        }

        IpcServer::poll_clients(&mut state);

        event_loop.dispatch(Some(config.poll_interval), &mut state)?;
        state.ipc_server.flush_all();
    }

    state.shutdown();
    state.ipc_server.cleanup();
    info!(
        "headless backend shut down ({} IPC client(s))",
        state.ipc_server.clients.len()
    );
    Ok(())
}
