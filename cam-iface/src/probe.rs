//! Device discovery.
//!
//! Probing is strictly sequential with a fixed inter-probe delay:
//! probing USB cameras in parallel causes intermittent enumeration
//! failures from bus contention. This is never used on the hot path.

use std::time::Duration;

use tracing::{debug, warn};

use crate::{CameraModule, Result};

/// Delay between successive device probes.
pub const INTER_PROBE_DELAY: Duration = Duration::from_millis(100);

/// Upper bound for a single device open.
pub const OPEN_TIMEOUT: Duration = Duration::from_secs(3);

/// Names of cameras that enumerate *and* open successfully.
pub fn probe_devices<M: CameraModule>(module: &mut M) -> Result<Vec<String>> {
    let infos = module.camera_infos()?;
    let mut available = Vec::new();
    for (i, info) in infos.iter().enumerate() {
        if i > 0 {
            std::thread::sleep(INTER_PROBE_DELAY);
        }
        let name = info.name().to_string();
        match module.camera(&name) {
            Ok(_cam) => {
                debug!("probe: camera \"{}\" ({})", name, info.model());
                available.push(name);
            }
            Err(e) => {
                warn!("probe: camera \"{}\" failed to open: {}", name, e);
            }
        }
    }
    Ok(available)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::sim::{SimCameraModule, SimScript};

    #[test]
    fn probe_lists_openable_cameras_and_skips_broken_ones() {
        let mut module = SimCameraModule::new()
            .with_camera("good", SimScript::default())
            .with_camera("broken", SimScript::default().fail_opens(u32::MAX));
        let names = probe_devices(&mut module).unwrap();
        assert_eq!(names, vec!["good".to_string()]);
    }
}
