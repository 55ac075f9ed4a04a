//! Render entry point -- per-session render thread and per-frame decisions.
//!
//! A [`RenderSession`] is started when the immersive space opens. It
//! negotiates the layer configuration once, then hands it together with
//! the shared render configuration to a [`RenderEntryPoint`] running on
//! its own thread. The renderer polls the shared configuration once per
//! frame and must tolerate changes between any two frames.

use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};
use tracing::{debug, info, warn};

use crate::vr::frame_timing::{FrameTiming, FrameTimingStats};
use crate::vr::layer_config::{negotiate, CapabilityQuery, LayerConfiguration, LayerLayout};
use crate::vr::render_config::{ImmersionStyle, RenderConfiguration, SharedRenderConfiguration};

// ---------------------------------------------------------------------------
// Frame plan
// ---------------------------------------------------------------------------

/// How the background of a frame is produced.
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum Backdrop {
    /// Draw the surrounding environment; nothing of the real world shows.
    Environment,
    /// Show passthrough video beyond `cutoff_angle` degrees from the view axis.
    Portal { cutoff_angle: f64 },
}

/// Decisions the renderer makes for a single frame.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct FramePlan {
    /// Render passes per frame: one per eye for dedicated layouts, a
    /// single amplified pass otherwise.
    pub passes: u32,
    /// Whether the foveation rate map is bound.
    pub foveated: bool,
    pub backdrop: Backdrop,
}

impl FramePlan {
    pub fn build(layer: &LayerConfiguration, config: &RenderConfiguration) -> Self {
        let passes = match layer.layout() {
            LayerLayout::Dedicated => 2,
            LayerLayout::Layered | LayerLayout::Shared => 1,
        };
        let backdrop = match config.active_cutoff_angle() {
            Some(cutoff_angle) => Backdrop::Portal { cutoff_angle },
            None => Backdrop::Environment,
        };
        Self {
            passes,
            foveated: layer.foveation_enabled(),
            backdrop,
        }
    }
}

// ---------------------------------------------------------------------------
// Render entry point
// ---------------------------------------------------------------------------

/// Counters a renderer publishes for the UI context. Written by the render
/// thread without blocking, read by IPC handlers.
#[derive(Debug, Default)]
pub struct RenderStats {
    pub frames: AtomicU64,
    timing: Mutex<FrameTimingStats>,
}

impl RenderStats {
    /// Publish timing stats; skipped if a reader holds the lock.
    pub fn publish(&self, stats: FrameTimingStats) {
        if let Ok(mut slot) = self.timing.try_lock() {
            *slot = stats;
        }
    }

    pub fn timing(&self) -> FrameTimingStats {
        self.timing
            .lock()
            .map(|s| s.clone())
            .unwrap_or_default()
    }
}

/// The per-session render loop.
pub trait RenderEntryPoint: Send + 'static {
    /// Run until `stop` is set. Called once per session on the render thread.
    fn run(
        &mut self,
        layer: LayerConfiguration,
        config: Arc<SharedRenderConfiguration>,
        stats: Arc<RenderStats>,
        stop: Arc<AtomicBool>,
    );
}

/// Paced render loop with no GPU work: builds the frame plan from the
/// latest configuration snapshot and records frame timing.
pub struct HeadlessRenderer {
    pub frame_rate: u32,
}

impl HeadlessRenderer {
    pub fn new(frame_rate: u32) -> Self {
        Self {
            frame_rate: frame_rate.max(1),
        }
    }
}

impl RenderEntryPoint for HeadlessRenderer {
    fn run(
        &mut self,
        layer: LayerConfiguration,
        config: Arc<SharedRenderConfiguration>,
        stats: Arc<RenderStats>,
        stop: Arc<AtomicBool>,
    ) {
        let frame_duration = Duration::from_secs_f64(1.0 / self.frame_rate as f64);
        let mut timing = FrameTiming::for_rate(self.frame_rate, 1000);
        let mut last_plan: Option<FramePlan> = None;
        let mut last_start: Option<Instant> = None;
        info!(
            "headless renderer: {} Hz, layer {}",
            self.frame_rate,
            layer.to_sexp()
        );

        while !stop.load(Ordering::Acquire) {
            let start = Instant::now();
            let plan = FramePlan::build(&layer, &config.snapshot());
            if last_plan != Some(plan) {
                debug!("frame plan: {}", describe_plan(&plan));
                last_plan = Some(plan);
            }

            let cpu_ms = start.elapsed().as_secs_f64() * 1000.0;
            let interval_ms = last_start.map(|t| start.duration_since(t).as_secs_f64() * 1000.0);
            timing.record_frame(cpu_ms, interval_ms);
            last_start = Some(start);

            let frames = stats.frames.fetch_add(1, Ordering::Relaxed) + 1;
            if frames % u64::from(self.frame_rate) == 0 {
                stats.publish(timing.stats());
            }

            // `RenderSession::stop` unparks us early.
            let deadline = start + frame_duration;
            loop {
                let now = Instant::now();
                if now >= deadline || stop.load(Ordering::Acquire) {
                    break;
                }
                thread::park_timeout(deadline - now);
            }
        }
        stats.publish(timing.stats());
        info!("headless renderer stopped after {} frames", timing.total_frames);
    }
}

// ---------------------------------------------------------------------------
// Render session
// ---------------------------------------------------------------------------

/// One immersive session's render thread and its negotiated layer.
pub struct RenderSession {
    layer: LayerConfiguration,
    stats: Arc<RenderStats>,
    stop: Arc<AtomicBool>,
    handle: Option<JoinHandle<()>>,
}

impl RenderSession {
    /// Negotiate the layer configuration and start the renderer.
    pub fn start<C, R>(
        capabilities: &C,
        config: Arc<SharedRenderConfiguration>,
        mut renderer: R,
    ) -> std::io::Result<Self>
    where
        C: CapabilityQuery + ?Sized,
        R: RenderEntryPoint,
    {
        let layer = negotiate(capabilities);
        let stats = Arc::new(RenderStats::default());
        let stop = Arc::new(AtomicBool::new(false));

        let handle = {
            let stats = Arc::clone(&stats);
            let stop = Arc::clone(&stop);
            thread::Builder::new()
                .name("immersive-render".into())
                .spawn(move || renderer.run(layer, config, stats, stop))?
        };
        info!("render session started");

        Ok(Self {
            layer,
            stats,
            stop,
            handle: Some(handle),
        })
    }

    pub fn layer(&self) -> &LayerConfiguration {
        &self.layer
    }

    pub fn stats(&self) -> &RenderStats {
        &self.stats
    }

    /// Signal the renderer and wait for its thread to exit.
    pub fn stop(&mut self) {
        self.stop.store(true, Ordering::Release);
        if let Some(handle) = self.handle.take() {
            handle.thread().unpark();
            if handle.join().is_err() {
                warn!("render thread panicked");
            }
            info!(
                "render session stopped ({} frames)",
                self.stats.frames.load(Ordering::Relaxed)
            );
        }
    }

    /// Format session info as an s-expression for IPC.
    pub fn status_sexp(&self) -> String {
        format!(
            "(:layer {} :frames {} :timing {})",
            self.layer.to_sexp(),
            self.stats.frames.load(Ordering::Relaxed),
            self.stats.timing().to_sexp(),
        )
    }
}

impl Drop for RenderSession {
    fn drop(&mut self) {
        self.stop();
    }
}

/// Human-readable summary of a frame plan, for logging.
pub fn describe_plan(plan: &FramePlan) -> String {
    let backdrop = match plan.backdrop {
        Backdrop::Environment => ImmersionStyle::Full.as_str().to_string(),
        Backdrop::Portal { cutoff_angle } => {
            format!("{} (cutoff {:.0}°)", ImmersionStyle::Mixed.as_str(), cutoff_angle)
        }
    };
    format!(
        "{} pass(es), foveation {}, {}",
        plan.passes,
        if plan.foveated { "on" } else { "off" },
        backdrop
    )
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::vr::layer_config::DeviceCapabilities;

    fn layer(foveation: bool, layouts: &[LayerLayout]) -> LayerConfiguration {
        negotiate(&DeviceCapabilities::new(foveation, layouts))
    }

    #[test]
    fn test_plan_full_immersion_ignores_cutoff() {
        let config = RenderConfiguration {
            immersion_style: ImmersionStyle::Full,
            portal_cutoff_angle: 90.0,
        };
        let plan = FramePlan::build(&layer(true, &[LayerLayout::Layered]), &config);
        assert_eq!(plan.backdrop, Backdrop::Environment);
        assert_eq!(plan.passes, 1);
        assert!(plan.foveated);
    }

    #[test]
    fn test_plan_mixed_uses_portal() {
        let config = RenderConfiguration {
            immersion_style: ImmersionStyle::Mixed,
            portal_cutoff_angle: 45.0,
        };
        let plan = FramePlan::build(&layer(false, &[LayerLayout::Dedicated]), &config);
        assert_eq!(plan.backdrop, Backdrop::Portal { cutoff_angle: 45.0 });
        assert_eq!(plan.passes, 2);
        assert!(!plan.foveated);
        assert_eq!(describe_plan(&plan), "2 pass(es), foveation off, mixed (cutoff 45°)");
    }

    /// Renderer that records every snapshot it saw, one per frame.
    struct ProbeRenderer {
        seen: Arc<Mutex<Vec<RenderConfiguration>>>,
    }

    impl RenderEntryPoint for ProbeRenderer {
        fn run(
            &mut self,
            _layer: LayerConfiguration,
            config: Arc<SharedRenderConfiguration>,
            stats: Arc<RenderStats>,
            stop: Arc<AtomicBool>,
        ) {
            while !stop.load(Ordering::Acquire) {
                self.seen.lock().unwrap().push(config.snapshot());
                stats.frames.fetch_add(1, Ordering::Relaxed);
                thread::sleep(Duration::from_millis(1));
            }
        }
    }

    #[test]
    fn test_session_renderer_observes_config_changes() {
        let shared = Arc::new(SharedRenderConfiguration::default());
        let seen = Arc::new(Mutex::new(Vec::new()));
        let caps = DeviceCapabilities::new(true, &[LayerLayout::Dedicated, LayerLayout::Layered]);
        let mut session = RenderSession::start(
            &caps,
            Arc::clone(&shared),
            ProbeRenderer {
                seen: Arc::clone(&seen),
            },
        )
        .unwrap();
        assert_eq!(session.layer().layout(), LayerLayout::Layered);

        shared.set_immersion_style(ImmersionStyle::Mixed);
        shared.set_portal_cutoff_angle(120.0);
        let deadline = Instant::now() + Duration::from_secs(5);
        loop {
            let latest = seen.lock().unwrap().last().copied();
            if latest.map(|c| c.portal_cutoff_angle) == Some(120.0) || Instant::now() > deadline {
                break;
            }
            thread::sleep(Duration::from_millis(2));
        }
        session.stop();

        let seen = seen.lock().unwrap();
        let last = *seen.last().expect("renderer produced no frames");
        assert_eq!(last.immersion_style, ImmersionStyle::Mixed);
        assert_eq!(last.portal_cutoff_angle, 120.0);
        assert_eq!(session.stats().frames.load(Ordering::Relaxed), seen.len() as u64);
    }

    #[test]
    fn test_stop_wakes_slow_renderer() {
        let shared = Arc::new(SharedRenderConfiguration::default());
        let caps = DeviceCapabilities::default();
        // One frame per second: a full-frame sleep would hold stop() for ~1s.
        let mut session = RenderSession::start(&caps, shared, HeadlessRenderer::new(1)).unwrap();
        let deadline = Instant::now() + Duration::from_secs(5);
        while session.stats().frames.load(Ordering::Relaxed) < 1 && Instant::now() < deadline {
            thread::sleep(Duration::from_millis(5));
        }
        let start = Instant::now();
        session.stop();
        assert!(
            start.elapsed() < Duration::from_millis(500),
            "stop blocked for {:?}",
            start.elapsed()
        );
    }

    #[test]
    fn test_headless_renderer_counts_frames_and_stops() {
        let shared = Arc::new(SharedRenderConfiguration::default());
        let caps = DeviceCapabilities::default();
        let mut session =
            RenderSession::start(&caps, shared, HeadlessRenderer::new(500)).unwrap();
        let deadline = Instant::now() + Duration::from_secs(5);
        while session.stats().frames.load(Ordering::Relaxed) < 3 && Instant::now() < deadline {
            thread::sleep(Duration::from_millis(5));
        }
        session.stop();
        let frames = session.stats().frames.load(Ordering::Relaxed);
        assert!(frames >= 3);
        // Final stats are published on exit.
        assert_eq!(session.stats().timing().total_frames, frames);
        assert!(session.status_sexp().contains(":layout :dedicated"));
    }
}
