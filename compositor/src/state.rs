//! Compositor state — the central struct the event loop hands to every
//! callback.
//!
//! Single `ImmersiveState` struct owns the controller, the running render
//! session and the IPC server, passed as `&mut self` to all handlers.

use std::time::Instant;
use tracing::{error, info};

use crate::ipc::{dispatch::format_event, IpcServer};
use crate::render::{HeadlessRenderer, RenderSession};
use crate::vr::immersion::{ControllerEvent, ImmersionController, SessionPhase, SpaceCompletion};
use crate::vr::layer_config::CapabilityQuery;

/// Central compositor state.
pub struct ImmersiveState {
    // Session control
    pub controller: ImmersionController,
    pub capabilities: Box<dyn CapabilityQuery>,
    pub render_session: Option<RenderSession>,
    pub frame_rate: u32,

    // IPC
    pub ipc_server: IpcServer,

    // Shutdown flag
    pub running: bool,
}

impl ImmersiveState {
    pub fn new(
        controller: ImmersionController,
        capabilities: Box<dyn CapabilityQuery>,
        frame_rate: u32,
        ipc_server: IpcServer,
    ) -> Self {
        info!("ImmersiveState initialized (frame rate {} Hz)", frame_rate);
        Self {
            controller,
            capabilities,
            render_session: None,
            frame_rate,
            ipc_server,
            running: true,
        }
    }

    /// Feed an asynchronous request completion into the controller.
    pub fn handle_completion(&mut self, completion: SpaceCompletion) {
        self.controller.on_request_completed(completion, Instant::now());
        self.process_controller_events();
    }

    /// Periodic housekeeping: transition timeouts.
    pub fn tick(&mut self) {
        self.controller.tick(Instant::now());
        self.process_controller_events();
    }

    /// React to queued controller events: start or stop the render session
    /// and forward every event to IPC clients.
    pub fn process_controller_events(&mut self) {
        for event in self.controller.drain_events() {
            if let ControllerEvent::PhaseChanged { to, .. } = event {
                match to {
                    SessionPhase::Active => self.start_render_session(),
                    SessionPhase::Idle => self.stop_render_session(),
                    _ => {}
                }
            }
            self.ipc_server.broadcast_event(&event.to_sexp());
        }
    }

    fn start_render_session(&mut self) {
        if self.render_session.is_some() {
            return;
        }
        match RenderSession::start(
            self.capabilities.as_ref(),
            self.controller.shared_render_config(),
            HeadlessRenderer::new(self.frame_rate),
        ) {
            Ok(session) => {
                let layer = session.layer().to_sexp();
                self.render_session = Some(session);
                self.ipc_server
                    .broadcast_event(&format_event("layer-negotiated", &[("layer", &layer)]));
            }
            Err(e) => error!("failed to start render session: {}", e),
        }
    }

    fn stop_render_session(&mut self) {
        if let Some(mut session) = self.render_session.take() {
            session.stop();
        }
    }

    /// Stop rendering before exit.
    pub fn shutdown(&mut self) {
        info!("shutting down (session {})", self.controller.phase().as_str());
        self.stop_render_session();
        self.running = false;
    }
}
