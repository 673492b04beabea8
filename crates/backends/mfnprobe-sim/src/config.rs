use std::fs::File;
use std::io::Read;
use std::path::Path;

use serde::{Deserialize, Serialize};

use crate::SimError;

/// Parameters of a simulated guest.
///
/// Missing JSON fields fall back to [`SimConfig::default`].
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct SimConfig {
    /// Number of guest page frames
    pub guest_frames: usize,
    /// Number of machine frames of the host
    pub machine_frames: usize,
    /// First guest page frame number
    pub base_pfn: usize,
    /// Probability that a guest frame starts a new machine run
    pub fragmentation: f64,
    /// Share of the machine frames not given to the guest that belong to other tenants
    pub foreign_fraction: f64,
    /// Probability that an allocation request fails
    pub allocation_failure_rate: f64,
    /// Seed of the simulation
    pub seed: u64,
}

impl Default for SimConfig {
    fn default() -> Self {
        Self {
            guest_frames: 4096,
            machine_frames: 1 << 16,
            base_pfn: 0x100,
            fragmentation: 0.25,
            foreign_fraction: 0.5,
            allocation_failure_rate: 0.0,
            seed: 0x5eed,
        }
    }
}

impl SimConfig {
    /// Checks the parameters for consistency.
    ///
    /// # Errors
    ///
    /// Returns [`SimError::InvalidConfig`] if the guest is empty, does not fit
    /// into the machine, or a probability is outside of `[0, 1]`.
    pub fn validate(&self) -> Result<(), SimError> {
        if self.guest_frames == 0 {
            return Err(SimError::InvalidConfig(
                "guest_frames must be greater than 0".into(),
            ));
        }
        if self.machine_frames < self.guest_frames {
            return Err(SimError::InvalidConfig(format!(
                "{} guest frames do not fit into {} machine frames",
                self.guest_frames, self.machine_frames
            )));
        }
        for (name, p) in [
            ("fragmentation", self.fragmentation),
            ("foreign_fraction", self.foreign_fraction),
            ("allocation_failure_rate", self.allocation_failure_rate),
        ] {
            if !(0.0..=1.0).contains(&p) {
                return Err(SimError::InvalidConfig(format!(
                    "{} = {} is not a probability",
                    name, p
                )));
            }
        }
        Ok(())
    }

    /// Loads a configuration from a JSON file.
    ///
    /// # Errors
    ///
    /// Returns error if the file cannot be read or parsed
    pub fn from_jsonfile<P: AsRef<Path>>(filepath: P) -> Result<SimConfig, SimError> {
        let mut file = File::open(filepath)?;
        let mut contents = String::new();
        file.read_to_string(&mut contents)?;
        let config: SimConfig = serde_json::from_str(&contents)?;
        Ok(config)
    }
}
