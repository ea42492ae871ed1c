//! Simulated spectrometer.
//!
//! `DummySpectrometer` models a linear detector: the peak intensity of the
//! synthetic spectrum grows proportionally with integration time until it
//! clips at the saturation level. A readout blocks for the configured
//! integration time (scaled by `time_scale`, which tests set to zero), so
//! the timing behaviour of the acquisition pipeline is realistic too.

use super::{DeviceInfo, SpectrometerDriver, TecDriver};
use crate::error::{PiccoloError, Result};
use rand::Rng;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

const PIXELS: usize = 1000;
const PEAK_CENTRE: f64 = 500.0;
const PEAK_SIGMA: f64 = 40.0;

pub struct DummySpectrometer {
    serial: String,
    integration_ms: f64,
    min_integration_ms: f64,
    saturation: f64,
    /// Peak counts produced per millisecond of integration.
    counts_per_ms: f64,
    /// Scale factor applied to the readout sleep; 0.0 disables sleeping.
    time_scale: f64,
    attached: Arc<AtomicBool>,
    tec: Option<DummyTec>,
}

impl DummySpectrometer {
    pub fn new(serial: impl Into<String>) -> Self {
        Self {
            serial: serial.into(),
            integration_ms: 1.0,
            min_integration_ms: 1.0,
            saturation: 200_000.0,
            counts_per_ms: 50.0,
            time_scale: 1.0,
            attached: Arc::new(AtomicBool::new(true)),
            tec: None,
        }
    }

    /// Set the detector response in peak counts per millisecond.
    pub fn with_response(mut self, counts_per_ms: f64) -> Self {
        self.counts_per_ms = counts_per_ms;
        self
    }

    pub fn with_saturation(mut self, saturation: f64) -> Self {
        self.saturation = saturation;
        self
    }

    /// Scale readout sleeps; tests pass 0.0 to run at full speed.
    pub fn with_time_scale(mut self, scale: f64) -> Self {
        self.time_scale = scale;
        self
    }

    pub fn with_min_integration(mut self, ms: f64) -> Self {
        self.min_integration_ms = ms;
        self
    }

    /// Fit the device with a simulated thermo-electric cooler.
    pub fn with_tec(mut self) -> Self {
        self.tec = Some(DummyTec::default());
        self
    }

    /// Handle that makes the device report itself as detached, simulating a
    /// pulled USB cable.
    pub fn detach_handle(&self) -> Arc<AtomicBool> {
        self.attached.clone()
    }

    fn check_attached(&self) -> Result<()> {
        if self.attached.load(Ordering::SeqCst) {
            Ok(())
        } else {
            Err(PiccoloError::Device(format!(
                "spectrometer {} disappeared",
                self.serial
            )))
        }
    }
}

impl SpectrometerDriver for DummySpectrometer {
    fn serial(&self) -> &str {
        &self.serial
    }

    fn is_open(&self) -> bool {
        self.attached.load(Ordering::SeqCst)
    }

    fn min_integration_time_ms(&self) -> f64 {
        self.min_integration_ms
    }

    fn set_integration_time_ms(&mut self, ms: f64) -> Result<()> {
        self.check_attached()?;
        self.integration_ms = ms;
        Ok(())
    }

    fn read_pixels(&mut self) -> Result<Vec<f64>> {
        self.check_attached()?;
        if self.time_scale > 0.0 {
            std::thread::sleep(Duration::from_secs_f64(
                self.integration_ms / 1000.0 * self.time_scale,
            ));
        }
        let amplitude = self.counts_per_ms * self.integration_ms;
        let mut rng = rand::thread_rng();
        let pixels = (0..PIXELS)
            .map(|i| {
                let x = (i as f64 - PEAK_CENTRE) / PEAK_SIGMA;
                let line = amplitude * (-0.5 * x * x).exp();
                let noise: f64 = rng.gen_range(0.0..2.0);
                (line + noise).min(self.saturation)
            })
            .collect();
        Ok(pixels)
    }

    fn info(&self) -> DeviceInfo {
        DeviceInfo {
            serial_number: self.serial.clone(),
            wavelength_calibration_coefficients: vec![0.0, 1.0, 0.0, 0.0],
            dark_pixels: Vec::new(),
            nonlinearity_correction_coefficients: vec![0.0, 1.0],
            saturation_level: self.saturation,
        }
    }

    fn tec(&mut self) -> Option<&mut dyn TecDriver> {
        self.tec.as_mut().map(|t| t as &mut dyn TecDriver)
    }
}

#[derive(Debug)]
pub struct DummyTec {
    enabled: bool,
    setpoint: f64,
}

impl Default for DummyTec {
    fn default() -> Self {
        Self {
            enabled: false,
            setpoint: -10.0,
        }
    }
}

impl TecDriver for DummyTec {
    fn enable(&mut self, on: bool) -> Result<()> {
        self.enabled = on;
        Ok(())
    }

    fn set_setpoint(&mut self, deg_c: f64) -> Result<()> {
        self.setpoint = deg_c;
        Ok(())
    }

    fn temperature(&mut self) -> Result<f64> {
        // The cooler holds its setpoint when enabled, ambient otherwise.
        Ok(if self.enabled { self.setpoint } else { 21.0 })
    }
}
