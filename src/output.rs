//! Spectra output writer.
//!
//! A single long-running thread drains the queue of completed
//! [`SpectraList`]s and serialises each one into its run directory. A write
//! failure is logged and the loop carries on; only the shutdown sentinel
//! (or the queue going away) stops the writer.

use crate::error::Result;
use crate::spectrum::SpectraList;
use std::path::PathBuf;
use std::sync::mpsc;
use std::thread::JoinHandle;
use tracing::{error, info};

pub(crate) enum WriterMsg {
    Write(SpectraList),
    Shutdown,
}

/// Spawn the output thread. The returned sender is the spectra queue.
pub(crate) fn spawn(
    datadir: PathBuf,
    clobber: bool,
    split: bool,
) -> Result<(mpsc::Sender<WriterMsg>, JoinHandle<()>)> {
    let (tx, rx) = mpsc::channel();
    let handle = std::thread::Builder::new()
        .name("piccolo_output".to_string())
        .spawn(move || run(datadir, clobber, split, &rx))?;
    Ok((tx, handle))
}

fn run(datadir: PathBuf, clobber: bool, split: bool, rx: &mpsc::Receiver<WriterMsg>) {
    loop {
        match rx.recv() {
            Ok(WriterMsg::Write(spectra)) => {
                info!(name = %spectra.out_name(), run = %spectra.run, "writing spectra");
                if let Err(e) = spectra.write_policy(&datadir, clobber, split) {
                    error!("{e}");
                }
            }
            Ok(WriterMsg::Shutdown) | Err(_) => {
                info!("stopped output thread");
                return;
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::spectrum::{Spectrum, SpectrumMeta};
    use chrono::Utc;

    fn meta() -> SpectrumMeta {
        SpectrumMeta {
            serial_number: "dummy_QEP001".into(),
            wavelength_calibration_coefficients: vec![0.0, 1.0],
            wavelength_calibration_coefficients_piccolo: None,
            dark_pixels: vec![],
            nonlinearity_correction_coefficients: vec![0.0, 1.0],
            saturation_level: 200_000.0,
            integration_time: 10.0,
            integration_time_units: "milliseconds".into(),
            temperature: None,
            temperature_units: "degrees Celsius".into(),
            direction: "upwelling".into(),
            dark: false,
            timestamp: Utc::now(),
        }
    }

    #[test]
    fn test_writer_persists_and_survives_failures() {
        let dir = tempfile::tempdir().unwrap();
        let (tx, handle) = spawn(dir.path().to_path_buf(), false, false).unwrap();

        let mut list = SpectraList::new("R1", 0, 0);
        list.push(Spectrum {
            meta: meta(),
            pixels: vec![1.0, 2.0],
        });
        tx.send(WriterMsg::Write(list.clone())).unwrap();
        // A duplicate write fails (clobber off) but must not kill the loop.
        tx.send(WriterMsg::Write(list)).unwrap();

        let mut second = SpectraList::new("R1", 0, 1);
        second.push(Spectrum {
            meta: meta(),
            pixels: vec![3.0],
        });
        tx.send(WriterMsg::Write(second)).unwrap();
        tx.send(WriterMsg::Shutdown).unwrap();
        handle.join().unwrap();

        assert!(dir.path().join("R1/b0000_s00000.pico").is_file());
        assert!(dir.path().join("R1/b0000_s00001.pico").is_file());
    }
}
