//! Immersion controller — reacts to UI toggles, drives the immersive space
//! session state machine and writes the shared render configuration.
//!
//! Session phases:
//!
//! ```text
//! idle --toggle on--> requesting-open --completed--> active
//! active --toggle off--> requesting-close --completed--> idle
//! ```
//!
//! A failed or timed-out request reverts to the phase it started from.
//! Immersion style and cutoff angle are orthogonal to the session phase and
//! are accepted at any time.
//!
//! The controller never blocks: open and dismiss requests are handed to a
//! `SpaceRequester` and their completions come back later through
//! `on_request_completed`. Observers read the `ControllerEvent` queue.

use std::collections::VecDeque;
use std::sync::Arc;
use std::time::{Duration, Instant};
use thiserror::Error;
use tracing::{debug, info, warn};

use super::render_config::{ImmersionStyle, RenderConfiguration, SharedRenderConfiguration};

// ── SessionPhase ────────────────────────────────────────────

/// Lifecycle of the immersive space as seen by the controller.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionPhase {
    Idle,
    RequestingOpen,
    Active,
    RequestingClose,
}

impl SessionPhase {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Idle => "idle",
            Self::RequestingOpen => "requesting-open",
            Self::Active => "active",
            Self::RequestingClose => "requesting-close",
        }
    }

    /// Whether a request is outstanding.
    pub fn is_transitioning(&self) -> bool {
        matches!(self, Self::RequestingOpen | Self::RequestingClose)
    }
}

// ── Requests ────────────────────────────────────────────────

/// Identifies one open or dismiss request.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct RequestId(pub u64);

/// Kind of immersive space request.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SpaceRequest {
    Open,
    Dismiss,
}

impl SpaceRequest {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Open => "open",
            Self::Dismiss => "dismiss",
        }
    }
}

/// How an asynchronous request ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TransitionOutcome {
    Completed,
    Failed,
}

/// Completion notice for a request previously handed to a `SpaceRequester`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SpaceCompletion {
    pub id: RequestId,
    pub request: SpaceRequest,
    pub outcome: TransitionOutcome,
}

/// Fire-and-forget access to the platform's immersive space manager.
///
/// Implementations must return immediately and report the result later
/// as a `SpaceCompletion` carrying the same `RequestId`.
pub trait SpaceRequester {
    fn request_open(&mut self, id: RequestId);
    fn request_dismiss(&mut self, id: RequestId);
}

// ── Policy and errors ───────────────────────────────────────

/// What to do with a session toggle that arrives while a request is pending.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum TogglePolicy {
    /// Remember the latest wish and act on it once the pending request settles.
    #[default]
    Coalesce,
    /// Refuse the toggle.
    Reject,
}

impl TogglePolicy {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Coalesce => "coalesce",
            Self::Reject => "reject",
        }
    }

    pub fn from_str(s: &str) -> Option<Self> {
        match s {
            "coalesce" => Some(Self::Coalesce),
            "reject" => Some(Self::Reject),
            _ => None,
        }
    }
}

#[derive(Debug, Error, PartialEq, Eq)]
pub enum TransitionError {
    #[error("session transition pending ({phase})")]
    TransitionPending { phase: &'static str },
}

/// Controller tuning.
#[derive(Debug, Clone)]
pub struct ControllerConfig {
    pub toggle_policy: TogglePolicy,
    /// Revert a request that has not completed after this long.
    pub transition_timeout: Option<Duration>,
}

impl Default for ControllerConfig {
    fn default() -> Self {
        Self {
            toggle_policy: TogglePolicy::Coalesce,
            transition_timeout: Some(Duration::from_secs(10)),
        }
    }
}

// ── ControllerEvent ─────────────────────────────────────────

/// Notifications for the presentation layer and other observers.
#[derive(Debug, Clone, PartialEq)]
pub enum ControllerEvent {
    PhaseChanged {
        from: SessionPhase,
        to: SessionPhase,
    },
    /// The presentation-level immersion style should now be `style`.
    PresentationStyle(ImmersionStyle),
    /// The effective (clamped) cutoff angle after a slider change.
    CutoffAngle(f64),
}

impl ControllerEvent {
    /// Convert the event to an IPC s-expression.
    pub fn to_sexp(&self) -> String {
        match self {
            Self::PhaseChanged { from, to } => format!(
                "(:type :event :event :immersion-phase :from :{} :to :{})",
                from.as_str(),
                to.as_str(),
            ),
            Self::PresentationStyle(style) => format!(
                "(:type :event :event :immersion-style :style :{})",
                style.as_str(),
            ),
            Self::CutoffAngle(angle) => format!(
                "(:type :event :event :cutoff-angle :angle {:.1})",
                angle,
            ),
        }
    }
}

// ── ImmersionController ─────────────────────────────────────

#[derive(Debug, Clone, Copy)]
struct PendingRequest {
    id: RequestId,
    request: SpaceRequest,
    issued_at: Instant,
}

/// Owns the session state machine and the authoritative render configuration.
pub struct ImmersionController {
    phase: SessionPhase,
    config: ControllerConfig,
    render_config: Arc<SharedRenderConfiguration>,
    requester: Box<dyn SpaceRequester>,
    pending: Option<PendingRequest>,
    /// Latest session toggle position requested by the user.
    desired_open: bool,
    /// Dismiss reverted by timeout; if it still completes the space is gone.
    abandoned_dismiss: Option<RequestId>,
    next_request_id: u64,
    events: VecDeque<ControllerEvent>,
}

impl ImmersionController {
    pub fn new(
        config: ControllerConfig,
        render_config: Arc<SharedRenderConfiguration>,
        requester: Box<dyn SpaceRequester>,
    ) -> Self {
        info!(
            "Immersion controller initialized (policy={}, timeout={:?})",
            config.toggle_policy.as_str(),
            config.transition_timeout,
        );
        Self {
            phase: SessionPhase::Idle,
            config,
            render_config,
            requester,
            pending: None,
            desired_open: false,
            abandoned_dismiss: None,
            next_request_id: 1,
            events: VecDeque::new(),
        }
    }

    pub fn phase(&self) -> SessionPhase {
        self.phase
    }

    /// Handle to the shared configuration for the render thread.
    pub fn shared_render_config(&self) -> Arc<SharedRenderConfiguration> {
        Arc::clone(&self.render_config)
    }

    pub fn render_configuration(&self) -> RenderConfiguration {
        self.render_config.snapshot()
    }

    /// Immersion style the presentation layer should display.
    pub fn presentation_style(&self) -> ImmersionStyle {
        self.render_config.snapshot().immersion_style
    }

    /// Take all queued observer events, oldest first.
    pub fn drain_events(&mut self) -> Vec<ControllerEvent> {
        self.events.drain(..).collect()
    }

    // ── UI events ───────────────────────────────────────────

    /// The immersive-session switch was flipped.
    pub fn on_session_toggled(&mut self, enabled: bool, now: Instant) -> Result<(), TransitionError> {
        if self.phase.is_transitioning() {
            let in_flight_matches = match self.phase {
                SessionPhase::RequestingOpen => enabled,
                _ => !enabled,
            };
            if in_flight_matches {
                self.desired_open = enabled;
                return Ok(());
            }
            return match self.config.toggle_policy {
                TogglePolicy::Reject => {
                    warn!(
                        "session toggle {} rejected while {}",
                        if enabled { "on" } else { "off" },
                        self.phase.as_str()
                    );
                    Err(TransitionError::TransitionPending {
                        phase: self.phase.as_str(),
                    })
                }
                TogglePolicy::Coalesce => {
                    debug!(
                        "session toggle {} deferred until {} settles",
                        if enabled { "on" } else { "off" },
                        self.phase.as_str()
                    );
                    self.desired_open = enabled;
                    Ok(())
                }
            };
        }

        self.desired_open = enabled;
        self.reconcile(now);
        Ok(())
    }

    /// The immersion style toggle changed.
    pub fn on_immersion_style_changed(&mut self, style: ImmersionStyle) {
        self.render_config.set_immersion_style(style);
        self.events.push_back(ControllerEvent::PresentationStyle(style));
        info!("immersion style -> {}", style.as_str());
    }

    /// The passthrough cutoff slider moved.
    pub fn on_cutoff_angle_changed(&mut self, angle: f64) {
        self.render_config.set_portal_cutoff_angle(angle);
        let effective = self.render_config.snapshot().portal_cutoff_angle;
        self.events.push_back(ControllerEvent::CutoffAngle(effective));
    }

    // ── Request lifecycle ───────────────────────────────────

    /// An open or dismiss request finished.
    pub fn on_request_completed(&mut self, completion: SpaceCompletion, now: Instant) {
        let pending = match self.pending {
            Some(p) if p.id == completion.id => p,
            _ => {
                self.handle_stale_completion(completion);
                return;
            }
        };
        self.pending = None;

        let next = match (pending.request, completion.outcome) {
            (SpaceRequest::Open, TransitionOutcome::Completed) => SessionPhase::Active,
            (SpaceRequest::Open, TransitionOutcome::Failed) => {
                warn!(request_id = completion.id.0, "open request failed");
                self.desired_open = false;
                SessionPhase::Idle
            }
            (SpaceRequest::Dismiss, TransitionOutcome::Completed) => SessionPhase::Idle,
            (SpaceRequest::Dismiss, TransitionOutcome::Failed) => {
                warn!(request_id = completion.id.0, "dismiss request failed");
                self.desired_open = true;
                SessionPhase::Active
            }
        };
        self.set_phase(next);
        self.reconcile(now);
    }

    /// Check the outstanding request against the transition timeout.
    pub fn tick(&mut self, now: Instant) {
        let (Some(pending), Some(timeout)) = (self.pending, self.config.transition_timeout) else {
            return;
        };
        if now.saturating_duration_since(pending.issued_at) < timeout {
            return;
        }

        warn!(
            request_id = pending.id.0,
            "{} request timed out after {:?}, reverting",
            pending.request.as_str(),
            timeout
        );
        self.pending = None;
        let revert = match pending.request {
            SpaceRequest::Open => {
                self.desired_open = false;
                SessionPhase::Idle
            }
            SpaceRequest::Dismiss => {
                self.desired_open = true;
                self.abandoned_dismiss = Some(pending.id);
                SessionPhase::Active
            }
        };
        self.set_phase(revert);
    }

    fn handle_stale_completion(&mut self, completion: SpaceCompletion) {
        debug!(
            request_id = completion.id.0,
            "ignoring stale {} completion ({:?})",
            completion.request.as_str(),
            completion.outcome
        );
        // A reverted open that eventually succeeded left a space nobody owns.
        if completion.request == SpaceRequest::Open
            && completion.outcome == TransitionOutcome::Completed
            && self.phase == SessionPhase::Idle
        {
            let id = self.allocate_id();
            warn!(
                request_id = id.0,
                "late open completion while idle, dismissing orphaned space"
            );
            self.requester.request_dismiss(id);
        }

        // A reverted dismiss that eventually succeeded closed the space anyway.
        if completion.request == SpaceRequest::Dismiss
            && completion.outcome == TransitionOutcome::Completed
            && self.abandoned_dismiss == Some(completion.id)
        {
            self.abandoned_dismiss = None;
            if self.phase == SessionPhase::Active && self.pending.is_none() {
                warn!(
                    request_id = completion.id.0,
                    "late dismiss completion, space already closed"
                );
                self.desired_open = false;
                self.set_phase(SessionPhase::Idle);
            }
        }
    }

    /// Issue whatever request moves the session toward `desired_open`.
    fn reconcile(&mut self, now: Instant) {
        if self.pending.is_some() {
            return;
        }
        match (self.phase, self.desired_open) {
            (SessionPhase::Idle, true) => self.issue(SpaceRequest::Open, now),
            (SessionPhase::Active, false) => self.issue(SpaceRequest::Dismiss, now),
            _ => {}
        }
    }

    fn issue(&mut self, request: SpaceRequest, now: Instant) {
        let id = self.allocate_id();
        self.pending = Some(PendingRequest {
            id,
            request,
            issued_at: now,
        });
        let next = match request {
            SpaceRequest::Open => SessionPhase::RequestingOpen,
            SpaceRequest::Dismiss => SessionPhase::RequestingClose,
        };
        self.set_phase(next);
        debug!(request_id = id.0, "issuing {} request", request.as_str());
        match request {
            SpaceRequest::Open => self.requester.request_open(id),
            SpaceRequest::Dismiss => self.requester.request_dismiss(id),
        }
    }

    fn allocate_id(&mut self) -> RequestId {
        let id = RequestId(self.next_request_id);
        self.next_request_id += 1;
        id
    }

    fn set_phase(&mut self, to: SessionPhase) {
        let from = self.phase;
        if from == to {
            return;
        }
        self.phase = to;
        info!("immersive session: {} -> {}", from.as_str(), to.as_str());
        self.events.push_back(ControllerEvent::PhaseChanged { from, to });
    }

    /// Generate IPC status s-expression.
    pub fn status_sexp(&self) -> String {
        let pending = self
            .pending
            .map(|p| format!("(:id {} :request :{})", p.id.0, p.request.as_str()))
            .unwrap_or_else(|| "nil".to_string());
        format!(
            "(:phase :{} :desired-open {} :pending {} :policy :{} :render {})",
            self.phase.as_str(),
            if self.desired_open { "t" } else { "nil" },
            pending,
            self.config.toggle_policy.as_str(),
            self.render_config.snapshot().to_sexp(),
        )
    }
}

// ── Tests ───────────────────────────────────────────────────
