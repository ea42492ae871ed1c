//! Spectrum data model.
//!
//! A [`Spectrum`] is one detector readout plus its acquisition metadata; a
//! [`SpectraList`] collects the simultaneous readouts of one sequence under
//! a single `(run, batch, sequence)` tag and knows its output file name.
//! The on-disk representation is JSON with the conventional capitalised
//! metadata keys, so files round-trip losslessly through serde.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::path::PathBuf;

/// Acquisition metadata attached to every spectrum.
///
/// Field names serialize to the instrument's established key spelling
/// (`SerialNumber`, `WavelengthCalibrationCoefficients`, ...).
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "PascalCase")]
pub struct SpectrumMeta {
    pub serial_number: String,
    /// Wavelength calibration polynomial, coefficients in ascending order.
    pub wavelength_calibration_coefficients: Vec<f64>,
    /// Per-channel calibration override, when configured.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub wavelength_calibration_coefficients_piccolo: Option<Vec<f64>>,
    /// Indices of electrically dark pixels.
    pub dark_pixels: Vec<usize>,
    pub nonlinearity_correction_coefficients: Vec<f64>,
    pub saturation_level: f64,
    /// Integration time in `IntegrationTimeUnits`.
    pub integration_time: f64,
    pub integration_time_units: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub temperature: Option<f64>,
    pub temperature_units: String,
    /// The channel this spectrum was recorded through.
    pub direction: String,
    /// Dark frame (shutters closed) vs light frame.
    pub dark: bool,
    /// UTC timestamp of the acquisition.
    pub timestamp: DateTime<Utc>,
}

/// One recorded spectrum: pixel intensities plus metadata.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct Spectrum {
    #[serde(flatten)]
    pub meta: SpectrumMeta,
    #[serde(rename = "Pixels")]
    pub pixels: Vec<f64>,
}

impl Spectrum {
    /// A spectrum is saturated when any pixel reaches the saturation level.
    pub fn is_saturated(&self) -> bool {
        let sat = self.meta.saturation_level;
        self.pixels.iter().any(|&p| p >= sat)
    }

    /// Largest raw pixel value, 0.0 for an empty readout.
    pub fn max_pixel(&self) -> f64 {
        self.pixels.iter().cloned().fold(0.0, f64::max)
    }
}

/// An ordered collection of spectra recorded together, tagged by
/// `(run, batch, sequence)`.
#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(rename_all = "PascalCase")]
pub struct SpectraList {
    pub run: String,
    pub batch: i64,
    pub sequence: i64,
    pub spectra: Vec<Spectrum>,
}

impl SpectraList {
    pub fn new(run: impl Into<String>, batch: i64, sequence: i64) -> Self {
        Self {
            run: run.into(),
            batch,
            sequence,
            spectra: Vec::new(),
        }
    }

    pub fn push(&mut self, spectrum: Spectrum) {
        self.spectra.push(spectrum);
    }

    pub fn len(&self) -> usize {
        self.spectra.len()
    }

    pub fn is_empty(&self) -> bool {
        self.spectra.is_empty()
    }

    /// Output file name derived from the tag, e.g. `b0000_s00003.pico`.
    pub fn out_name(&self) -> String {
        format!("b{:04}_s{:05}.pico", self.batch, self.sequence)
    }

    /// Full output path below the data root.
    pub fn out_path(&self, datadir: &std::path::Path) -> PathBuf {
        datadir.join(&self.run).join(self.out_name())
    }

    /// Serialise to the run directory. Fails if the file already exists,
    /// unless `clobber` is set.
    pub fn write(&self, datadir: &std::path::Path, clobber: bool) -> crate::error::Result<()> {
        self.write_to(&self.out_path(datadir), clobber)
    }

    /// Serialise honouring the output policy: with `split`, dark and light
    /// spectra land in separate `_dark`/`_light` files so a batch can hold
    /// both frames under one `(batch, sequence)` tag.
    pub fn write_policy(
        &self,
        datadir: &std::path::Path,
        clobber: bool,
        split: bool,
    ) -> crate::error::Result<()> {
        if !split {
            return self.write(datadir, clobber);
        }
        for (suffix, want_dark) in [("dark", true), ("light", false)] {
            let spectra: Vec<Spectrum> = self
                .spectra
                .iter()
                .filter(|s| s.meta.dark == want_dark)
                .cloned()
                .collect();
            if spectra.is_empty() {
                continue;
            }
            let part = SpectraList {
                run: self.run.clone(),
                batch: self.batch,
                sequence: self.sequence,
                spectra,
            };
            let name = format!("b{:04}_s{:05}_{suffix}.pico", self.batch, self.sequence);
            part.write_to(&datadir.join(&self.run).join(name), clobber)?;
        }
        Ok(())
    }

    fn write_to(&self, path: &std::path::Path, clobber: bool) -> crate::error::Result<()> {
        if !clobber && path.exists() {
            return Err(crate::error::PiccoloError::Io(std::io::Error::new(
                std::io::ErrorKind::AlreadyExists,
                format!("{} already exists", path.display()),
            )));
        }
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        let data = serde_json::to_vec_pretty(self)?;
        std::fs::write(path, data)?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    pub(crate) fn sample_meta() -> SpectrumMeta {
        SpectrumMeta {
            serial_number: "dummy_QEP001".into(),
            wavelength_calibration_coefficients: vec![0.0, 1.0, 0.0, 0.0],
            wavelength_calibration_coefficients_piccolo: None,
            dark_pixels: vec![0, 1, 2],
            nonlinearity_correction_coefficients: vec![0.0, 1.0],
            saturation_level: 200_000.0,
            integration_time: 100.0,
            integration_time_units: "milliseconds".into(),
            temperature: Some(-9.8),
            temperature_units: "degrees Celsius".into(),
            direction: "upwelling".into(),
            dark: false,
            timestamp: Utc::now(),
        }
    }

    #[test]
    fn test_metadata_key_spelling() {
        let s = Spectrum {
            meta: sample_meta(),
            pixels: vec![1.0, 2.0],
        };
        let v = serde_json::to_value(&s).unwrap();
        for key in [
            "SerialNumber",
            "WavelengthCalibrationCoefficients",
            "DarkPixels",
            "NonlinearityCorrectionCoefficients",
            "SaturationLevel",
            "IntegrationTime",
            "IntegrationTimeUnits",
            "Temperature",
            "TemperatureUnits",
            "Direction",
            "Dark",
            "Pixels",
        ] {
            assert!(v.get(key).is_some(), "missing key {key}");
        }
        // The override key only appears when configured.
        assert!(v.get("WavelengthCalibrationCoefficientsPiccolo").is_none());
    }

    #[test]
    fn test_spectrum_roundtrip() {
        let mut meta = sample_meta();
        meta.wavelength_calibration_coefficients_piccolo = Some(vec![0.5, 0.9]);
        let s = Spectrum {
            meta,
            pixels: vec![0.0, 13.5, 199_999.0],
        };
        let text = serde_json::to_string(&s).unwrap();
        let back: Spectrum = serde_json::from_str(&text).unwrap();
        assert_eq!(back, s);
    }

    #[test]
    fn test_saturation() {
        let mut s = Spectrum {
            meta: sample_meta(),
            pixels: vec![10.0, 199_999.9],
        };
        assert!(!s.is_saturated());
        s.pixels.push(200_000.0);
        assert!(s.is_saturated());
    }

    #[test]
    fn test_out_name_encodes_tag() {
        let list = SpectraList::new("R1", 3, 12);
        assert_eq!(list.out_name(), "b0003_s00012.pico");
        let list = SpectraList::new("R1", 0, 0);
        assert_eq!(list.out_name(), "b0000_s00000.pico");
    }

    #[test]
    fn test_write_respects_clobber() {
        let dir = tempfile::tempdir().unwrap();
        let mut list = SpectraList::new("R1", 0, 0);
        list.push(Spectrum {
            meta: sample_meta(),
            pixels: vec![1.0],
        });
        list.write(dir.path(), false).unwrap();
        assert!(dir.path().join("R1").join("b0000_s00000.pico").is_file());
        assert!(list.write(dir.path(), false).is_err());
        list.write(dir.path(), true).unwrap();
    }

    #[test]
    fn test_split_write_separates_dark_and_light() {
        let dir = tempfile::tempdir().unwrap();
        let mut list = SpectraList::new("R1", 0, 0);
        let mut dark = sample_meta();
        dark.dark = true;
        list.push(Spectrum {
            meta: dark,
            pixels: vec![0.1],
        });
        list.push(Spectrum {
            meta: sample_meta(),
            pixels: vec![1.0],
        });
        list.write_policy(dir.path(), false, true).unwrap();
        let run = dir.path().join("R1");
        let dark_file = run.join("b0000_s00000_dark.pico");
        let light_file = run.join("b0000_s00000_light.pico");
        assert!(dark_file.is_file());
        assert!(light_file.is_file());
        let back: SpectraList =
            serde_json::from_str(&std::fs::read_to_string(dark_file).unwrap()).unwrap();
        assert_eq!(back.len(), 1);
        assert!(back.spectra[0].meta.dark);
    }
}
