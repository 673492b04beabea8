use mfnprobe_core::util::Order;
use thiserror::Error;

/// Errors of the simulated guest.
#[derive(Debug, Error)]
pub enum SimError {
    /// The page arena could not be mapped
    #[error("Failed to map page arena: {0}")]
    ArenaMap(std::io::Error),
    /// No naturally aligned free block of the requested order is left
    #[error("Out of memory: no free block of {0}")]
    OutOfMemory(Order),
    /// The request was failed on purpose
    #[error("Injected allocation failure")]
    Injected,
    /// The requested order exceeds the allocator contract or the guest
    #[error("{0} exceeds the guest")]
    OrderTooLarge(Order),
    /// An explicit frame layout is inconsistent
    #[error("Invalid layout: {0}")]
    InvalidLayout(String),
    /// The simulation parameters are inconsistent
    #[error("Invalid simulation config: {0}")]
    InvalidConfig(String),
    /// The config file could not be read
    #[error(transparent)]
    IoError(#[from] std::io::Error),
    /// The config file could not be parsed
    #[error(transparent)]
    JsonError(#[from] serde_json::Error),
}
