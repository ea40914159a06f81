use std::fmt;
use std::sync::Arc;

use super::{DeviceDriver, DevicePtr};

/// Device allocation freed through its driver on drop.
pub struct DeviceBuffer {
    driver: Arc<dyn DeviceDriver>,
    ptr: DevicePtr,
    bytes: usize,
}

impl DeviceBuffer {
    pub(crate) fn new(driver: Arc<dyn DeviceDriver>, ptr: DevicePtr, bytes: usize) -> Self {
        Self { driver, ptr, bytes }
    }

    pub fn bytes(&self) -> usize {
        self.bytes
    }

    pub fn device_ptr(&self) -> DevicePtr {
        self.ptr
    }

    pub(crate) fn belongs_to(&self, driver: &Arc<dyn DeviceDriver>) -> bool {
        Arc::ptr_eq(&self.driver, driver)
    }
}

impl fmt::Debug for DeviceBuffer {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("DeviceBuffer")
            .field("driver", &self.driver.driver_name())
            .field("ptr", &format_args!("{:#x}", self.ptr.0))
            .field("bytes", &self.bytes)
            .finish()
    }
}

impl Drop for DeviceBuffer {
    fn drop(&mut self) {
        self.driver.free(self.ptr);
    }
}
