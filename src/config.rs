//! Server and instrument configuration.
//!
//! Two separate files configure the system:
//!
//! - the **server configuration** (where the data directory lives, network
//!   bind address, logging) read at startup before anything else;
//! - the **instrument configuration** (channels, spectrometers, calibration,
//!   output policy) which usually lives inside the data directory so that it
//!   travels with the instrument.
//!
//! Both are TOML, parsed through the `config` crate so defaults, file values
//! and CLI overrides layer in the usual way.

use crate::error::{PiccoloError, Result};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::path::Path;

// ============================================================================
// Instrument configuration
// ============================================================================

/// One optical channel: a shutter-gated light path.
#[derive(Clone, Debug, Deserialize, Serialize)]
pub struct ChannelConfig {
    /// Direction name, e.g. "upwelling" or "downwelling".
    pub direction: String,
    /// Whether the polarity of the shutter connection is reversed.
    #[serde(default)]
    pub reverse: bool,
    /// Diameter of the optical fibre in micrometres.
    #[serde(default = "default_fibre_diameter")]
    pub fibre_diameter: f64,
}

fn default_fibre_diameter() -> f64 {
    600.0
}

/// Per-channel calibration overrides.
#[derive(Clone, Debug, Default, Deserialize, Serialize)]
pub struct CalibrationConfig {
    #[serde(default)]
    pub wavelength_calibration_coefficients_piccolo: Option<Vec<f64>>,
}

/// One spectrometer, keyed by serial number in the config file.
#[derive(Clone, Debug, Deserialize, Serialize)]
pub struct SpectrometerConfig {
    /// Detector set point for TEC-capable devices, degrees Celsius.
    #[serde(default = "default_set_temperature")]
    pub detector_set_temperature: f64,
    /// Whether to enable the cooler fan/TEC at startup.
    #[serde(default = "default_true")]
    pub fan: bool,
    /// GPIO pin used for the power switch, -1 when absent.
    #[serde(default = "default_power_switch")]
    pub power_switch: i32,
    /// Minimum integration time in milliseconds.
    #[serde(default = "default_min_integration")]
    pub min_integration_time: f64,
    /// Maximum integration time in milliseconds.
    #[serde(default = "default_max_integration")]
    pub max_integration_time: f64,
    /// Per-channel calibration, keyed by direction name.
    #[serde(default)]
    pub calibration: BTreeMap<String, CalibrationConfig>,
}

fn default_set_temperature() -> f64 {
    -10.0
}
fn default_true() -> bool {
    true
}
fn default_power_switch() -> i32 {
    -1
}
fn default_min_integration() -> f64 {
    1000.0
}
fn default_max_integration() -> f64 {
    65_535_000.0
}

/// Output policy for written spectra.
#[derive(Clone, Debug, Deserialize, Serialize)]
pub struct OutputConfig {
    /// Overwrite existing output files when set.
    #[serde(default)]
    pub clobber: bool,
    /// Write separate dark/light files when set.
    #[serde(default = "default_true")]
    pub split: bool,
}

impl Default for OutputConfig {
    fn default() -> Self {
        Self {
            clobber: false,
            split: true,
        }
    }
}

/// The instrument configuration file.
#[derive(Clone, Debug, Deserialize, Serialize)]
pub struct InstrumentConfig {
    #[serde(default)]
    pub channels: BTreeMap<String, ChannelConfig>,
    #[serde(default)]
    pub spectrometers: BTreeMap<String, SpectrometerConfig>,
    #[serde(default)]
    pub output: OutputConfig,
}

impl InstrumentConfig {
    /// Load the instrument configuration from a TOML file.
    pub fn from_file(path: &Path) -> Result<Self> {
        if !path.is_file() {
            return Err(PiccoloError::Configuration(format!(
                "no such configuration file {}",
                path.display()
            )));
        }
        let cfg = config::Config::builder()
            .add_source(config::File::from(path))
            .build()?;
        Ok(cfg.try_deserialize()?)
    }

    /// Direction names of all configured channels, sorted.
    pub fn directions(&self) -> Vec<String> {
        let mut d: Vec<String> = self.channels.values().map(|c| c.direction.clone()).collect();
        d.sort();
        d
    }
}

// ============================================================================
// Server configuration
// ============================================================================

#[derive(Clone, Debug, Deserialize, Serialize)]
pub struct DataDirConfig {
    /// The data directory. Relative paths are resolved against the mount
    /// point when `mount` is set, the working directory otherwise.
    pub datadir: String,
    /// Block device to mount when `mount` is set.
    pub device: String,
    /// Mount point for the block device.
    pub mntpnt: String,
    /// Whether the device should be mounted at startup.
    pub mount: bool,
}

#[derive(Clone, Debug, Deserialize, Serialize)]
pub struct BindConfig {
    pub address: String,
    pub port: u16,
}

#[derive(Clone, Debug, Deserialize, Serialize)]
pub struct LoggingConfig {
    /// Optional log file; stdout when absent.
    pub logfile: Option<String>,
    /// Lower the log filter to debug.
    pub debug: bool,
}

/// The server configuration file plus defaults.
#[derive(Clone, Debug, Deserialize, Serialize)]
pub struct ServerConfig {
    pub datadir: DataDirConfig,
    pub coap: BindConfig,
    pub logging: LoggingConfig,
    /// Instrument configuration file, resolved relative to the data
    /// directory when not absolute.
    pub config: String,
}

impl ServerConfig {
    /// Load the server configuration, layering an optional file over the
    /// built-in defaults.
    pub fn new(path: Option<&Path>) -> Result<Self> {
        let mut builder = config::Config::builder()
            .set_default("datadir.datadir", "piccolo_data")?
            .set_default("datadir.device", "/dev/sda1")?
            .set_default("datadir.mntpnt", "/mnt")?
            .set_default("datadir.mount", false)?
            .set_default("coap.address", "0.0.0.0")?
            .set_default("coap.port", 5683)?
            .set_default("logging.debug", false)?
            .set_default("config", "piccolo.config")?;
        if let Some(p) = path {
            builder = builder.add_source(config::File::from(p));
        }
        Ok(builder.build()?.try_deserialize()?)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    #[test]
    fn test_server_defaults() {
        let cfg = ServerConfig::new(None).unwrap();
        assert_eq!(cfg.datadir.datadir, "piccolo_data");
        assert!(!cfg.datadir.mount);
        assert_eq!(cfg.coap.port, 5683);
        assert!(!cfg.logging.debug);
    }

    #[test]
    fn test_instrument_config_parse() {
        let mut f = tempfile::Builder::new()
            .suffix(".toml")
            .tempfile()
            .unwrap();
        writeln!(
            f,
            r#"
[channels.shutter_1]
direction = "upwelling"
reverse = true

[channels.shutter_2]
direction = "downwelling"
fibre_diameter = 400.0

[spectrometers.dummy_QEP001]
min_integration_time = 1.0
max_integration_time = 10000.0

[spectrometers.dummy_QEP001.calibration.upwelling]
wavelength_calibration_coefficients_piccolo = [0.0, 1.0, 0.0, 0.0]
"#
        )
        .unwrap();
        let cfg = InstrumentConfig::from_file(f.path()).unwrap();
        assert_eq!(cfg.directions(), vec!["downwelling", "upwelling"]);
        assert!(cfg.channels["shutter_1"].reverse);
        assert_eq!(cfg.channels["shutter_1"].fibre_diameter, 600.0);
        let spec = &cfg.spectrometers["dummy_QEP001"];
        assert_eq!(spec.min_integration_time, 1.0);
        assert!(spec.fan);
        assert_eq!(
            spec.calibration["upwelling"]
                .wavelength_calibration_coefficients_piccolo
                .as_deref(),
            Some(&[0.0, 1.0, 0.0, 0.0][..])
        );
    }

    #[test]
    fn test_missing_instrument_config_is_an_error() {
        let err = InstrumentConfig::from_file(Path::new("/nonexistent/piccolo.config"));
        assert!(err.is_err());
    }
}
