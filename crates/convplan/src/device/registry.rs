//! Runtime driver registry.
//!
//! Drivers register a constructor under a name, either explicitly through
//! [`register_driver`] or at link time by adding a function to
//! [`DRIVER_REGISTRARS`]. Registrars run once, the first time the registry is
//! touched.

use std::collections::HashMap;
use std::sync::{Arc, OnceLock, PoisonError, RwLock};

use super::DeviceDriver;
use crate::error::{ConvError, ConvResult};

/// Factory that opens a driver. Opening may fail when the runtime library is
/// missing on this machine.
pub type DriverConstructor = Box<dyn Fn() -> ConvResult<Arc<dyn DeviceDriver>> + Send + Sync>;

/// Link-time registrars contributed by driver crates.
#[linkme::distributed_slice]
pub static DRIVER_REGISTRARS: [fn()] = [..];

struct DriverRegistry {
    drivers: RwLock<HashMap<String, DriverConstructor>>,
}

impl DriverRegistry {
    fn new() -> Self {
        Self {
            drivers: RwLock::new(HashMap::new()),
        }
    }

    fn register(&self, name: String, constructor: DriverConstructor) {
        self.drivers
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .insert(name, constructor);
    }

    fn create(&self, name: &str) -> Option<ConvResult<Arc<dyn DeviceDriver>>> {
        let drivers = self.drivers.read().unwrap_or_else(PoisonError::into_inner);
        let constructor = drivers.get(name)?;
        Some(constructor())
    }

    fn list(&self) -> Vec<String> {
        let mut names: Vec<String> = self
            .drivers
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .keys()
            .cloned()
            .collect();
        names.sort();
        names
    }

    fn contains(&self, name: &str) -> bool {
        self.drivers
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .contains_key(name)
    }
}

static GLOBAL_REGISTRY: OnceLock<DriverRegistry> = OnceLock::new();
static REGISTRARS_RAN: OnceLock<()> = OnceLock::new();

fn global_registry() -> &'static DriverRegistry {
    GLOBAL_REGISTRY.get_or_init(DriverRegistry::new)
}

/// Registry with every link-time registrar applied. Registrars call
/// [`register_driver`], which only touches [`global_registry`].
fn populated_registry() -> &'static DriverRegistry {
    REGISTRARS_RAN.get_or_init(|| {
        for registrar in DRIVER_REGISTRARS {
            registrar();
        }
    });
    global_registry()
}

/// Register a driver constructor under `name`, replacing any previous entry.
pub fn register_driver<F>(name: impl Into<String>, constructor: F)
where
    F: Fn() -> ConvResult<Arc<dyn DeviceDriver>> + Send + Sync + 'static,
{
    let name = name.into();
    log::debug!("registering device driver `{name}`");
    global_registry().register(name, Box::new(constructor));
}

/// Open the driver registered under `name`.
pub fn create_driver(name: &str) -> ConvResult<Arc<dyn DeviceDriver>> {
    populated_registry()
        .create(name)
        .unwrap_or_else(|| {
            Err(ConvError::driver_unavailable(
                name,
                format!("no driver registered (known: {:?})", list_drivers()),
            ))
        })
}

/// Names of all registered drivers, sorted.
pub fn list_drivers() -> Vec<String> {
    populated_registry().list()
}

pub fn has_driver(name: &str) -> bool {
    populated_registry().contains(name)
}
