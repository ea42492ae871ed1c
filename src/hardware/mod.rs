//! Hardware abstraction layer.
//!
//! The rest of the server never talks to a GPIO pin or a USB spectrometer
//! directly; it goes through the small driver traits defined here. Real
//! drivers live out of tree and plug in through a [`SpectrometerOpener`];
//! serial numbers prefixed `dummy_` resolve to the simulated devices in
//! [`dummy`], which behave like slow linear detectors and are good enough to
//! exercise the whole acquisition pipeline.

pub mod dummy;

use crate::error::{PiccoloError, Result};

/// Serial-number prefix selecting a simulated device.
pub const DUMMY_PREFIX: &str = "dummy_";

/// Duration of the drive pulse applied when toggling a shutter.
pub const SHUTTER_PULSE_MS: u64 = 5;

/// Static description a spectrometer reports about itself, merged into the
/// metadata of every spectrum it produces.
#[derive(Clone, Debug)]
pub struct DeviceInfo {
    pub serial_number: String,
    /// Wavelength calibration polynomial, ascending coefficients.
    pub wavelength_calibration_coefficients: Vec<f64>,
    /// Indices of electrically dark pixels.
    pub dark_pixels: Vec<usize>,
    pub nonlinearity_correction_coefficients: Vec<f64>,
    pub saturation_level: f64,
}

/// A shutter actuator. Implementations pulse the underlying drive line for
/// [`SHUTTER_PULSE_MS`] and honour the configured polarity themselves.
pub trait ShutterDriver: Send {
    fn set_open(&mut self, open: bool) -> Result<()>;
}

/// Thermo-electric cooler feature of a spectrometer, where present.
pub trait TecDriver {
    fn enable(&mut self, on: bool) -> Result<()>;
    fn set_setpoint(&mut self, deg_c: f64) -> Result<()>;
    fn temperature(&mut self) -> Result<f64>;
}

/// A spectrometer device handle, owned exclusively by its worker thread.
/// All calls may block.
pub trait SpectrometerDriver: Send {
    fn serial(&self) -> &str;

    /// Whether the underlying handle is still attached. A `false` here puts
    /// the worker back into its reconnect loop.
    fn is_open(&self) -> bool;

    /// Smallest integration time the device supports, milliseconds.
    fn min_integration_time_ms(&self) -> f64;

    fn set_integration_time_ms(&mut self, ms: f64) -> Result<()>;

    /// Acquire one frame at the configured integration time. Blocks for at
    /// least the integration time.
    fn read_pixels(&mut self) -> Result<Vec<f64>>;

    fn info(&self) -> DeviceInfo;

    /// The TEC feature, if the device has one.
    fn tec(&mut self) -> Option<&mut dyn TecDriver>;
}

/// Factory resolving a serial number to a device handle. Workers call this
/// from their reconnect loop, so it must be cheap to fail.
pub type SpectrometerOpener =
    dyn Fn(&str) -> Result<Box<dyn SpectrometerDriver>> + Send + Sync;

/// The default opener: simulated devices for `dummy_` serials, otherwise no
/// driver is available in this build.
pub fn open_spectrometer(serial: &str) -> Result<Box<dyn SpectrometerDriver>> {
    if serial.starts_with(DUMMY_PREFIX) {
        Ok(Box::new(dummy::DummySpectrometer::new(serial)))
    } else {
        Err(PiccoloError::Device(format!(
            "no driver available for spectrometer {serial}"
        )))
    }
}

/// A shutter drive that only keeps state, used when no GPIO is configured.
#[derive(Debug, Default)]
pub struct DummyShutter {
    open: bool,
}

impl ShutterDriver for DummyShutter {
    fn set_open(&mut self, open: bool) -> Result<()> {
        std::thread::sleep(std::time::Duration::from_millis(SHUTTER_PULSE_MS));
        self.open = open;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_opener_resolves_dummies() {
        let dev = open_spectrometer("dummy_QEP001").unwrap();
        assert_eq!(dev.serial(), "dummy_QEP001");
        assert!(dev.is_open());
        assert!(open_spectrometer("QEP001").is_err());
    }
}
