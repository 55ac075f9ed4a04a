//! Compositor layer negotiation — picks the stereo layer layout, foveation
//! setting and color format from a device's advertised capabilities.
//!
//! Runs once per immersive session activation. The result is immutable for
//! the lifetime of the session.

use std::collections::HashSet;
use tracing::{debug, info};

// ── LayerLayout ─────────────────────────────────────────────

/// How the stereo eye buffers are organized.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum LayerLayout {
    /// One separate texture per eye.
    Dedicated,
    /// A single texture array, one slice per eye.
    Layered,
    /// One texture shared by both eyes.
    Shared,
}

impl LayerLayout {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Dedicated => "dedicated",
            Self::Layered => "layered",
            Self::Shared => "shared",
        }
    }

    pub fn from_str(s: &str) -> Option<Self> {
        match s {
            "dedicated" => Some(Self::Dedicated),
            "layered" => Some(Self::Layered),
            "shared" => Some(Self::Shared),
            _ => None,
        }
    }

    /// Parse a comma-separated layout list such as `"dedicated,layered"`.
    pub fn parse_list(s: &str) -> Option<HashSet<Self>> {
        s.split(',')
            .map(str::trim)
            .filter(|part| !part.is_empty())
            .map(Self::from_str)
            .collect()
    }
}

// ── ColorFormat ─────────────────────────────────────────────

/// Pixel format of the layer's color textures.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ColorFormat {
    /// Four 16-bit floating point channels.
    Rgba16Float,
}

impl ColorFormat {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Rgba16Float => "rgba16-float",
        }
    }
}

/// The color format every negotiated layer uses.
pub const LAYER_COLOR_FORMAT: ColorFormat = ColorFormat::Rgba16Float;

// ── Capability query ────────────────────────────────────────

/// Options passed along with a supported-layouts query.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct LayoutQueryOptions {
    /// Ask for layouts that remain valid with foveated rendering enabled.
    pub foveation: bool,
}

/// Read-only view of what the display device can do.
///
/// `supported_layouts` must only be called with `foveation: true` on a
/// device that reported `supports_foveation() == true`.
pub trait CapabilityQuery {
    fn supports_foveation(&self) -> bool;
    fn supported_layouts(&self, options: LayoutQueryOptions) -> HashSet<LayerLayout>;
}

/// Statically configured device capabilities.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DeviceCapabilities {
    pub supports_foveation: bool,
    pub supported_layouts: HashSet<LayerLayout>,
}

impl DeviceCapabilities {
    pub fn new(supports_foveation: bool, layouts: &[LayerLayout]) -> Self {
        Self {
            supports_foveation,
            supported_layouts: layouts.iter().copied().collect(),
        }
    }
}

impl Default for DeviceCapabilities {
    fn default() -> Self {
        Self::new(false, &[LayerLayout::Dedicated])
    }
}

impl CapabilityQuery for DeviceCapabilities {
    fn supports_foveation(&self) -> bool {
        self.supports_foveation
    }

    fn supported_layouts(&self, _options: LayoutQueryOptions) -> HashSet<LayerLayout> {
        self.supported_layouts.clone()
    }
}

// ── LayerConfiguration ──────────────────────────────────────

/// Negotiated layer setup for one immersive session.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct LayerConfiguration {
    layout: LayerLayout,
    foveation_enabled: bool,
    color_format: ColorFormat,
}

impl LayerConfiguration {
    pub fn layout(&self) -> LayerLayout {
        self.layout
    }

    pub fn foveation_enabled(&self) -> bool {
        self.foveation_enabled
    }

    pub fn color_format(&self) -> ColorFormat {
        self.color_format
    }

    /// Format as an s-expression for IPC.
    pub fn to_sexp(&self) -> String {
        format!(
            "(:layout :{} :foveation {} :color-format :{})",
            self.layout.as_str(),
            if self.foveation_enabled { "t" } else { "nil" },
            self.color_format.as_str(),
        )
    }
}

/// Choose the layer configuration for a device.
///
/// `layered` wins whenever the device offers it, otherwise `dedicated`.
/// `shared` is never chosen: the renderer draws both eyes with vertex
/// amplification, which does not work with shared-layout rendering on
/// simulated devices. Foveation follows device support.
pub fn negotiate<C: CapabilityQuery + ?Sized>(capabilities: &C) -> LayerConfiguration {
    let supports_foveation = capabilities.supports_foveation();
    let options = LayoutQueryOptions {
        foveation: supports_foveation,
    };
    let supported = capabilities.supported_layouts(options);
    debug!(
        supports_foveation,
        layouts = ?supported,
        "layer negotiation: device capabilities"
    );

    let layout = if supported.contains(&LayerLayout::Layered) {
        LayerLayout::Layered
    } else {
        LayerLayout::Dedicated
    };

    let config = LayerConfiguration {
        layout,
        foveation_enabled: supports_foveation,
        color_format: LAYER_COLOR_FORMAT,
    };
    info!(
        "layer negotiated: layout={} foveation={} color={}",
        config.layout.as_str(),
        config.foveation_enabled,
        config.color_format.as_str(),
    );
    config
}

// ── Tests ───────────────────────────────────────────────────
