//! Job execution driver discovery.

use tracing::debug;

/// Drivers every agent must be able to load
pub const BUILTIN_DRIVERS: &[&str] = &["mysql", "kafka"];

/// Driver errors
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum DriverError {
    /// No driver with that name
    #[error("Driver {0} not found")]
    NotFound(String),

    /// Driver exists but failed to load
    #[error("Failed to load driver {name}: {reason}")]
    Load {
        /// Driver name
        name: String,
        /// Loader message
        reason: String,
    },
}

/// Loaded driver
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DriverInfo {
    /// Driver name
    pub name: String,
}

/// Source of job execution drivers
pub trait DriverCatalog: Send + Sync {
    /// Names of the drivers that must be available
    fn names(&self) -> Vec<String>;

    /// Load a driver by name
    ///
    /// # Errors
    ///
    /// Returns error if the driver cannot be loaded
    fn discover(&self, name: &str) -> Result<DriverInfo, DriverError>;
}

/// Built-in drivers
#[derive(Debug, Clone, Copy, Default)]
pub struct BuiltinDrivers;

impl BuiltinDrivers {
    /// Create the catalog
    #[must_use]
    pub fn new() -> Self {
        Self
    }
}

impl DriverCatalog for BuiltinDrivers {
    fn names(&self) -> Vec<String> {
        BUILTIN_DRIVERS.iter().map(|name| (*name).to_string()).collect()
    }

    fn discover(&self, name: &str) -> Result<DriverInfo, DriverError> {
        if !BUILTIN_DRIVERS.contains(&name) {
            return Err(DriverError::NotFound(name.to_string()));
        }
        Ok(DriverInfo {
            name: name.to_string(),
        })
    }
}

/// Discover every driver of `catalog`, failing on the first that cannot load
///
/// # Errors
///
/// Returns the first discovery error
pub fn discover_all(catalog: &dyn DriverCatalog) -> Result<Vec<DriverInfo>, DriverError> {
    let drivers = catalog
        .names()
        .iter()
        .map(|name| catalog.discover(name))
        .collect::<Result<Vec<_>, _>>()?;
    debug!(
        drivers = ?drivers.iter().map(|d| d.name.as_str()).collect::<Vec<_>>(),
        "Available drivers"
    );
    Ok(drivers)
}
