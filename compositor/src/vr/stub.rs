//! OpenXR stub — used when the `openxr` feature is not enabled.
//!
//! Lets the compositor build without an OpenXR loader; the probe always
//! reports that no runtime is available.

use tracing::info;

use super::layer_config::DeviceCapabilities;

pub struct OpenXrCapabilityProbe;

impl OpenXrCapabilityProbe {
    pub fn probe() -> anyhow::Result<Option<DeviceCapabilities>> {
        info!("OpenXR probe disabled (compiled without 'openxr' feature)");
        Ok(None)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_stub_reports_no_runtime() {
        assert!(OpenXrCapabilityProbe::probe().unwrap().is_none());
    }
}
