//! OpenXR capability probe — asks the installed OpenXR runtime what the
//! connected headset supports.
//!
//! Foveation is reported when the runtime offers `XR_FB_foveation`. A
//! physical HMD exposes dedicated and layered layouts; a headless or
//! simulated runtime exposes dedicated and shared.

use openxrs as xr;
use tracing::{info, warn};

use super::layer_config::{DeviceCapabilities, LayerLayout};

/// Layouts advertised by a physical headset.
const DEVICE_LAYOUTS: &[LayerLayout] = &[LayerLayout::Dedicated, LayerLayout::Layered];
/// Layouts advertised by a simulated or headless runtime.
const SIMULATOR_LAYOUTS: &[LayerLayout] = &[LayerLayout::Dedicated, LayerLayout::Shared];

pub struct OpenXrCapabilityProbe;

impl OpenXrCapabilityProbe {
    /// Query the runtime. Returns `Ok(None)` when no OpenXR runtime is
    /// available so the caller can fall back to configured capabilities.
    pub fn probe() -> anyhow::Result<Option<DeviceCapabilities>> {
        info!("OpenXR: loading runtime for capability probe...");
        let entry = match unsafe { xr::Entry::load() } {
            Ok(e) => e,
            Err(e) => {
                warn!("OpenXR: loader not available: {}", e);
                return Ok(None);
            }
        };

        let available = entry.enumerate_extensions()?;
        let app_info = xr::ApplicationInfo {
            application_name: "immersive-compositor",
            application_version: 1,
            engine_name: "immersive-compositor",
            engine_version: 1,
            api_version: xr::Version::new(1, 0, 0),
        };
        let instance = match entry.create_instance(&app_info, &xr::ExtensionSet::default(), &[]) {
            Ok(inst) => inst,
            Err(e) => {
                warn!("OpenXR: failed to create instance: {}", e);
                return Ok(None);
            }
        };

        let forced_headless = std::env::var("XRT_COMPOSITOR_FORCE_HEADLESS").is_ok();
        let simulated = match instance.system(xr::FormFactor::HEAD_MOUNTED_DISPLAY) {
            Ok(system_id) => {
                let props = instance.system_properties(system_id)?;
                info!(
                    "OpenXR: HMD {} (vendor {})",
                    props.system_name, props.vendor_id
                );
                forced_headless
            }
            Err(xr::sys::Result::ERROR_FORM_FACTOR_UNAVAILABLE) => {
                warn!("OpenXR: no HMD connected, reporting simulator capabilities");
                true
            }
            Err(e) => {
                warn!("OpenXR: system discovery failed: {}", e);
                return Ok(None);
            }
        };

        let caps = if simulated {
            DeviceCapabilities::new(false, SIMULATOR_LAYOUTS)
        } else {
            DeviceCapabilities::new(available.fb_foveation, DEVICE_LAYOUTS)
        };
        info!(
            "OpenXR: capabilities foveation={} layouts={:?}",
            caps.supports_foveation, caps.supported_layouts
        );
        Ok(Some(caps))
    }
}
