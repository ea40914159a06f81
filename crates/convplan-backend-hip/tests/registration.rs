use convplan::device::registry::{create_driver, has_driver};
use convplan::ConvError;
use convplan_backend_hip::{register_hip_driver, DRIVER_NAME};

#[test]
fn hip_driver_registers_without_a_runtime() {
    let _ = env_logger::builder().is_test(true).try_init();
    register_hip_driver();
    assert!(has_driver(DRIVER_NAME));

    // Opening needs ROCm; without it the failure must say so.
    match create_driver(DRIVER_NAME) {
        Ok(driver) => assert_eq!(driver.driver_name(), "hip"),
        Err(err) => assert!(
            matches!(
                err,
                ConvError::DriverUnavailable { .. } | ConvError::Device { .. }
            ),
            "{err}"
        ),
    }
}
