//! Render configuration shared between the UI context and the render thread.
//!
//! The UI context is the only writer, the render thread the only reader.
//! Each field lives in its own atomic so neither side ever blocks: a
//! snapshot sees the latest value of every field, but two fields written by
//! separate calls may be observed from different updates.

use std::sync::atomic::{AtomicU64, AtomicU8, Ordering};
use tracing::{debug, warn};

/// Lower bound of the passthrough cutoff angle, in degrees.
pub const CUTOFF_ANGLE_MIN: f64 = 0.0;
/// Upper bound of the passthrough cutoff angle, in degrees.
pub const CUTOFF_ANGLE_MAX: f64 = 180.0;
/// Cutoff angle used until the user moves the slider.
pub const DEFAULT_CUTOFF_ANGLE: f64 = 60.0;

// ── ImmersionStyle ──────────────────────────────────────────

/// Whether rendered content fully replaces the surroundings or blends with
/// passthrough video.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum ImmersionStyle {
    #[default]
    Full,
    Mixed,
}

impl ImmersionStyle {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Full => "full",
            Self::Mixed => "mixed",
        }
    }

    pub fn from_str(s: &str) -> Option<Self> {
        match s {
            "full" => Some(Self::Full),
            "mixed" => Some(Self::Mixed),
            _ => None,
        }
    }

    fn to_bits(self) -> u8 {
        match self {
            Self::Full => 0,
            Self::Mixed => 1,
        }
    }

    fn from_bits(bits: u8) -> Self {
        match bits {
            1 => Self::Mixed,
            _ => Self::Full,
        }
    }
}

/// Clamp a cutoff angle into `[0, 180]` degrees.
pub fn clamp_cutoff_angle(angle: f64) -> f64 {
    angle.clamp(CUTOFF_ANGLE_MIN, CUTOFF_ANGLE_MAX)
}

// ── RenderConfiguration ─────────────────────────────────────

/// A point-in-time copy of the shared render configuration.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct RenderConfiguration {
    pub immersion_style: ImmersionStyle,
    /// Degrees; only meaningful while `immersion_style` is `Mixed`.
    pub portal_cutoff_angle: f64,
}

impl RenderConfiguration {
    /// The cutoff angle the renderer should honor, if any.
    pub fn active_cutoff_angle(&self) -> Option<f64> {
        match self.immersion_style {
            ImmersionStyle::Mixed => Some(self.portal_cutoff_angle),
            ImmersionStyle::Full => None,
        }
    }

    /// Format as an s-expression for IPC.
    pub fn to_sexp(&self) -> String {
        format!(
            "(:immersion-style :{} :cutoff-angle {:.1})",
            self.immersion_style.as_str(),
            self.portal_cutoff_angle,
        )
    }
}

impl Default for RenderConfiguration {
    fn default() -> Self {
        Self {
            immersion_style: ImmersionStyle::Full,
            portal_cutoff_angle: DEFAULT_CUTOFF_ANGLE,
        }
    }
}

// ── SharedRenderConfiguration ───────────────────────────────

/// Lock-free render configuration record, shared behind an `Arc`.
#[derive(Debug)]
pub struct SharedRenderConfiguration {
    immersion_style: AtomicU8,
    /// `f64` bit pattern of the cutoff angle.
    portal_cutoff_angle: AtomicU64,
}

impl SharedRenderConfiguration {
    pub fn new(initial: RenderConfiguration) -> Self {
        Self {
            immersion_style: AtomicU8::new(initial.immersion_style.to_bits()),
            portal_cutoff_angle: AtomicU64::new(
                clamp_cutoff_angle(initial.portal_cutoff_angle).to_bits(),
            ),
        }
    }

    /// Set the immersion style. UI context only.
    pub fn set_immersion_style(&self, style: ImmersionStyle) {
        self.immersion_style.store(style.to_bits(), Ordering::Release);
        debug!("render config: immersion style -> {}", style.as_str());
    }

    /// Set the passthrough cutoff angle, clamped to `[0, 180]`. UI context only.
    ///
    /// Non-finite input is ignored and the previous angle is kept.
    pub fn set_portal_cutoff_angle(&self, angle: f64) {
        if !angle.is_finite() {
            warn!("render config: ignoring non-finite cutoff angle {}", angle);
            return;
        }
        let clamped = clamp_cutoff_angle(angle);
        if clamped != angle {
            debug!("render config: cutoff angle {} clamped to {}", angle, clamped);
        }
        self.portal_cutoff_angle
            .store(clamped.to_bits(), Ordering::Release);
    }

    /// Copy the current configuration. Never blocks; render thread may call
    /// this once per frame.
    pub fn snapshot(&self) -> RenderConfiguration {
        RenderConfiguration {
            immersion_style: ImmersionStyle::from_bits(
                self.immersion_style.load(Ordering::Acquire),
            ),
            portal_cutoff_angle: f64::from_bits(self.portal_cutoff_angle.load(Ordering::Acquire)),
        }
    }
}

impl Default for SharedRenderConfiguration {
    fn default() -> Self {
        Self::new(RenderConfiguration::default())
    }
}

// ── Tests ───────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicBool;
    use std::sync::Arc;
    use std::thread;

    #[test]
    fn test_defaults() {
        let shared = SharedRenderConfiguration::default();
        let snap = shared.snapshot();
        assert_eq!(snap.immersion_style, ImmersionStyle::Full);
        assert_eq!(snap.portal_cutoff_angle, DEFAULT_CUTOFF_ANGLE);
        assert_eq!(snap.active_cutoff_angle(), None);
    }

    #[test]
    fn test_mixed_then_oversized_angle_clamps() {
        let shared = SharedRenderConfiguration::default();
        shared.set_immersion_style(ImmersionStyle::Mixed);
        shared.set_portal_cutoff_angle(200.0);
        let snap = shared.snapshot();
        assert_eq!(snap.immersion_style, ImmersionStyle::Mixed);
        assert_eq!(snap.portal_cutoff_angle, 180.0);
        assert_eq!(snap.active_cutoff_angle(), Some(180.0));
    }

    #[test]
    fn test_angle_clamping() {
        let shared = SharedRenderConfiguration::default();
        for (input, expected) in [
            (-15.0, 0.0),
            (0.0, 0.0),
            (42.5, 42.5),
            (180.0, 180.0),
            (180.01, 180.0),
        ] {
            shared.set_portal_cutoff_angle(input);
            assert_eq!(shared.snapshot().portal_cutoff_angle, expected, "input {}", input);
        }
    }

    #[test]
    fn test_non_finite_angle_keeps_previous() {
        let shared = SharedRenderConfiguration::default();
        shared.set_portal_cutoff_angle(90.0);
        shared.set_portal_cutoff_angle(f64::NAN);
        assert_eq!(shared.snapshot().portal_cutoff_angle, 90.0);
        shared.set_portal_cutoff_angle(f64::INFINITY);
        assert_eq!(shared.snapshot().portal_cutoff_angle, 90.0);
    }

    #[test]
    fn test_latest_write_per_field_wins() {
        let shared = SharedRenderConfiguration::default();
        shared.set_portal_cutoff_angle(10.0);
        shared.set_immersion_style(ImmersionStyle::Mixed);
        shared.set_portal_cutoff_angle(20.0);
        shared.set_immersion_style(ImmersionStyle::Full);
        shared.set_portal_cutoff_angle(30.0);
        let snap = shared.snapshot();
        assert_eq!(snap.immersion_style, ImmersionStyle::Full);
        assert_eq!(snap.portal_cutoff_angle, 30.0);
        // Angle is ignored while in full immersion.
        assert_eq!(snap.active_cutoff_angle(), None);
    }

    #[test]
    fn test_initial_angle_is_clamped() {
        let shared = SharedRenderConfiguration::new(RenderConfiguration {
            immersion_style: ImmersionStyle::Mixed,
            portal_cutoff_angle: 500.0,
        });
        assert_eq!(shared.snapshot().portal_cutoff_angle, 180.0);
    }

    #[test]
    fn test_concurrent_snapshots_never_tear() {
        // Writer only ever stores whole degrees; a torn f64 would almost
        // certainly be fractional or out of range.
        let shared = Arc::new(SharedRenderConfiguration::default());
        let done = Arc::new(AtomicBool::new(false));

        let writer = {
            let shared = Arc::clone(&shared);
            let done = Arc::clone(&done);
            thread::spawn(move || {
                for i in 0..20_000u32 {
                    shared.set_portal_cutoff_angle((i % 181) as f64);
                    let style = if i % 2 == 0 {
                        ImmersionStyle::Mixed
                    } else {
                        ImmersionStyle::Full
                    };
                    shared.set_immersion_style(style);
                }
                done.store(true, Ordering::SeqCst);
            })
        };

        let mut reads = 0u64;
        while !done.load(Ordering::SeqCst) || reads == 0 {
            let snap = shared.snapshot();
            let angle = snap.portal_cutoff_angle;
            assert!((CUTOFF_ANGLE_MIN..=CUTOFF_ANGLE_MAX).contains(&angle));
            assert_eq!(angle.fract(), 0.0, "torn angle {}", angle);
            reads += 1;
        }
        writer.join().unwrap();

        let last = shared.snapshot();
        assert_eq!(last.portal_cutoff_angle, (19_999 % 181) as f64);
        assert_eq!(last.immersion_style, ImmersionStyle::Full);
    }

    #[test]
    fn test_style_roundtrip_and_sexp() {
        assert_eq!(ImmersionStyle::from_str("mixed"), Some(ImmersionStyle::Mixed));
        assert_eq!(ImmersionStyle::from_str("full"), Some(ImmersionStyle::Full));
        assert_eq!(ImmersionStyle::from_str("progressive"), None);

        let sexp = RenderConfiguration::default().to_sexp();
        assert_eq!(sexp, "(:immersion-style :full :cutoff-angle 60.0)");
        assert!(lexpr::from_str(&sexp).is_ok());
    }
}
