//! Spectrometer worker thread.
//!
//! One worker owns one device handle and is the only code that touches it.
//! Commands arrive on a task queue with a reply channel each; state changes
//! (status, integration times, auto flags, finished spectra) are published
//! on the event channel and mirrored into the frontend's cache by the info
//! fan-out task.
//!
//! Status transitions:
//!
//! ```text
//! DISCONNECTED -> CONNECTING -> IDLE        (connect succeeded)
//!                            -> DISCONNECTED (retry every 5 s)
//! IDLE -> RECORDING -> IDLE
//! IDLE -> AUTOINTEGRATING -> IDLE
//! any  -> DISCONNECTED                       (device vanished)
//! ```

use super::autointegrate::{self, SearchParams};
use super::{AutoStatus, SpectrometerStatus};
use crate::error::{PiccoloError, Result};
use crate::hardware::{DeviceInfo, SpectrometerDriver, SpectrometerOpener};
use crate::spectrum::{Spectrum, SpectrumMeta};
use chrono::Utc;
use std::collections::BTreeMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{mpsc, Arc};
use std::time::Duration;
use tokio::sync::oneshot;
use tracing::{debug, error, info, warn};
use uuid::Uuid;

/// Interval between connection attempts.
pub(crate) const CONNECT_RETRY: Duration = Duration::from_secs(5);

pub(crate) type Reply<T> = oneshot::Sender<Result<T>>;

/// Commands understood by the worker.
pub(crate) enum Task {
    Connect,
    Disconnect,
    SetMin { ms: f64, reply: Reply<()> },
    SetMax { ms: f64, reply: Reply<()> },
    SetCurrent { channel: String, ms: f64, reply: Reply<()> },
    HaveTec { reply: Reply<bool> },
    ReadTemperature { reply: Reply<f64> },
    EnableTec { on: bool, reply: Reply<()> },
    SetTargetTemperature { deg_c: f64, reply: Reply<()> },
    StartAcquisition { channel: String, dark: bool, task_id: Uuid, reply: Reply<()> },
    Autointegrate { channel: String, target: f64, reply: Reply<()> },
    Shutdown,
}

/// State changes published to the frontend.
pub(crate) enum Event {
    Status(SpectrometerStatus),
    Min(f64),
    Max(f64),
    Current { channel: String, ms: f64 },
    Auto { channel: String, status: AutoStatus },
    Spectrum { task_id: Uuid, spectrum: Option<Box<Spectrum>> },
}

pub(crate) struct Worker {
    serial: String,
    channels: Vec<String>,
    calibration: BTreeMap<String, Vec<f64>>,
    opener: Arc<SpectrometerOpener>,
    driver: Option<Box<dyn SpectrometerDriver>>,
    info: Option<DeviceInfo>,
    status: SpectrometerStatus,
    min_ms: f64,
    max_ms: f64,
    current: BTreeMap<String, f64>,
    auto: BTreeMap<String, AutoStatus>,
    busy: Arc<AtomicBool>,
    tasks: mpsc::Receiver<Task>,
    self_tx: mpsc::Sender<Task>,
    events: tokio::sync::mpsc::UnboundedSender<Event>,
}

impl Worker {
    #[allow(clippy::too_many_arguments)]
    pub(crate) fn new(
        serial: String,
        channels: Vec<String>,
        calibration: BTreeMap<String, Vec<f64>>,
        min_ms: f64,
        max_ms: f64,
        opener: Arc<SpectrometerOpener>,
        busy: Arc<AtomicBool>,
        tasks: mpsc::Receiver<Task>,
        self_tx: mpsc::Sender<Task>,
        events: tokio::sync::mpsc::UnboundedSender<Event>,
    ) -> Self {
        let current = channels.iter().map(|c| (c.clone(), min_ms)).collect();
        let auto = channels
            .iter()
            .map(|c| (c.clone(), AutoStatus::NotSet))
            .collect();
        Self {
            serial,
            channels,
            calibration,
            opener,
            driver: None,
            info: None,
            status: SpectrometerStatus::Disconnected,
            min_ms,
            max_ms,
            current,
            auto,
            busy,
            tasks,
            self_tx,
            events,
        }
    }

    pub(crate) fn run(mut self) {
        self.emit_snapshot();
        loop {
            let Ok(task) = self.tasks.recv() else { break };
            if matches!(task, Task::Shutdown) {
                break;
            }
            self.busy.store(true, Ordering::SeqCst);
            self.handle(task);
            self.busy.store(false, Ordering::SeqCst);
        }
        if self.status >= SpectrometerStatus::Idle {
            self.disconnect();
        }
        info!(serial = %self.serial, "stopped worker thread");
    }

    fn handle(&mut self, task: Task) {
        match task {
            Task::Connect => self.connect(),
            Task::Disconnect => self.disconnect(),
            Task::SetMin { ms, reply } => {
                let r = self.apply_min(ms);
                let _ = reply.send(r);
            }
            Task::SetMax { ms, reply } => {
                let r = self.apply_max(ms);
                let _ = reply.send(r);
            }
            Task::SetCurrent { channel, ms, reply } => {
                let r = self.set_current(&channel, ms, true);
                let _ = reply.send(r);
            }
            Task::HaveTec { reply } => {
                let v = self.have_tec();
                let _ = reply.send(Ok(v));
            }
            Task::ReadTemperature { reply } => {
                let r = self.read_temperature();
                let _ = reply.send(r);
            }
            Task::EnableTec { on, reply } => {
                let r = self.with_tec(|tec| tec.enable(on));
                if r.is_ok() {
                    info!(serial = %self.serial, on, "TEC enabled state changed");
                }
                let _ = reply.send(r);
            }
            Task::SetTargetTemperature { deg_c, reply } => {
                let r = self.with_tec(|tec| tec.set_setpoint(deg_c));
                if r.is_ok() {
                    info!(serial = %self.serial, deg_c, "set target temperature");
                }
                let _ = reply.send(r);
            }
            Task::StartAcquisition {
                channel,
                dark,
                task_id,
                reply,
            } => self.start_acquisition(channel, dark, task_id, reply),
            Task::Autointegrate {
                channel,
                target,
                reply,
            } => self.autointegrate(channel, target, reply),
            Task::Shutdown => {}
        }
    }

    // ------------------------------------------------------------------
    // Connection handling
    // ------------------------------------------------------------------

    fn connect(&mut self) {
        if self.status != SpectrometerStatus::Disconnected {
            warn!(serial = %self.serial, "already connected");
            return;
        }
        info!(serial = %self.serial, "trying to connect to spectrometer");
        self.set_status(SpectrometerStatus::Connecting);
        loop {
            match (self.opener)(&self.serial) {
                Ok(driver) => {
                    self.attach(driver);
                    return;
                }
                Err(e) => {
                    debug!(serial = %self.serial, "failed to open spectrometer: {e}");
                }
            }
            // Keep serving shutdown (and failing fast on commands) while
            // waiting for the device to appear.
            match self.tasks.recv_timeout(CONNECT_RETRY) {
                Ok(Task::Shutdown) => {
                    let _ = self.self_tx.send(Task::Shutdown);
                    self.set_status(SpectrometerStatus::Disconnected);
                    return;
                }
                Ok(Task::Disconnect) => {
                    self.set_status(SpectrometerStatus::Disconnected);
                    return;
                }
                Ok(task) => self.reject_not_connected(task),
                Err(mpsc::RecvTimeoutError::Timeout) => continue,
                Err(mpsc::RecvTimeoutError::Disconnected) => {
                    self.set_status(SpectrometerStatus::Disconnected);
                    return;
                }
            }
        }
    }

    fn reject_not_connected(&mut self, task: Task) {
        let err = || PiccoloError::NotConnected(self.serial.clone());
        match task {
            Task::Connect | Task::Disconnect | Task::Shutdown => {}
            Task::SetMin { reply, .. }
            | Task::SetMax { reply, .. }
            | Task::SetCurrent { reply, .. }
            | Task::EnableTec { reply, .. }
            | Task::SetTargetTemperature { reply, .. }
            | Task::StartAcquisition { reply, .. }
            | Task::Autointegrate { reply, .. } => {
                let _ = reply.send(Err(err()));
            }
            Task::HaveTec { reply } => {
                let _ = reply.send(Err(err()));
            }
            Task::ReadTemperature { reply } => {
                let _ = reply.send(Err(err()));
            }
        }
    }

    fn attach(&mut self, driver: Box<dyn SpectrometerDriver>) {
        self.info = Some(driver.info());
        self.driver = Some(driver);
        info!(serial = %self.serial, "connected to spectrometer");
        self.set_status(SpectrometerStatus::Idle);
        // Re-clamp against the minimum the device reports.
        let min = self.min_ms;
        if let Err(e) = self.apply_min(min) {
            warn!(serial = %self.serial, "applying device minimum: {e}");
        }
    }

    fn disconnect(&mut self) {
        if self.status < SpectrometerStatus::Idle {
            warn!(serial = %self.serial, "spectrometer is not connected");
            return;
        }
        info!(serial = %self.serial, "disconnecting spectrometer");
        self.driver = None;
        self.set_status(SpectrometerStatus::Disconnected);
    }

    /// Detect a vanished device. Returns false (and schedules a reconnect)
    /// when the handle is gone.
    fn check_ok(&mut self) -> bool {
        if self.status > SpectrometerStatus::Connecting {
            let open = self.driver.as_ref().map_or(false, |d| d.is_open());
            if !open {
                self.driver = None;
                self.set_status(SpectrometerStatus::Disconnected);
                warn!(serial = %self.serial, "spectrometer disappeared");
                let _ = self.self_tx.send(Task::Connect);
                return false;
            }
        }
        true
    }

    fn check_ready(&mut self) -> Result<()> {
        if !self.check_ok() {
            return Err(PiccoloError::Device(format!(
                "spectrometer {} disappeared",
                self.serial
            )));
        }
        if self.status < SpectrometerStatus::Idle {
            return Err(PiccoloError::NotConnected(self.serial.clone()));
        }
        Ok(())
    }

    // ------------------------------------------------------------------
    // Integration-time invariants
    // ------------------------------------------------------------------

    fn apply_min(&mut self, ms: f64) -> Result<()> {
        let mut t = ms;
        if let Some(d) = &self.driver {
            t = t.max(d.min_integration_time_ms());
        }
        if t == self.min_ms {
            return Ok(());
        }
        self.min_ms = t;
        self.emit(Event::Min(t));
        for channel in self.channels.clone() {
            if self.current.get(&channel).copied().unwrap_or(t) < t {
                self.set_current(&channel, t, true)?;
            }
        }
        Ok(())
    }

    fn apply_max(&mut self, ms: f64) -> Result<()> {
        if ms == self.max_ms {
            return Ok(());
        }
        self.max_ms = ms;
        self.emit(Event::Max(ms));
        for channel in self.channels.clone() {
            if self.current.get(&channel).copied().unwrap_or(ms) > ms {
                self.set_current(&channel, ms, true)?;
            }
        }
        Ok(())
    }

    fn set_current(&mut self, channel: &str, ms: f64, reset_auto: bool) -> Result<()> {
        let cur = *self
            .current
            .get(channel)
            .ok_or_else(|| PiccoloError::UnknownChannel(channel.to_string()))?;
        if ms == cur {
            return Ok(());
        }
        if ms < self.min_ms {
            return Err(PiccoloError::invalid(format!(
                "integration time {ms} is smaller than minimum {}",
                self.min_ms
            )));
        }
        if ms > self.max_ms {
            return Err(PiccoloError::invalid(format!(
                "integration time {ms} is larger than maximum {}",
                self.max_ms
            )));
        }
        self.current.insert(channel.to_string(), ms);
        self.emit(Event::Current {
            channel: channel.to_string(),
            ms,
        });
        if reset_auto {
            self.set_auto(channel, AutoStatus::NotSet);
        }
        Ok(())
    }

    fn set_auto(&mut self, channel: &str, status: AutoStatus) {
        if self.auto.get(channel) == Some(&status) {
            return;
        }
        self.auto.insert(channel.to_string(), status);
        self.emit(Event::Auto {
            channel: channel.to_string(),
            status,
        });
    }

    // ------------------------------------------------------------------
    // Acquisition
    // ------------------------------------------------------------------

    fn start_acquisition(&mut self, channel: String, dark: bool, task_id: Uuid, reply: Reply<()>) {
        if !self.channels.contains(&channel) {
            let _ = reply.send(Err(PiccoloError::UnknownChannel(channel)));
            return;
        }
        if let Err(e) = self.check_ready() {
            let _ = reply.send(Err(e));
            return;
        }
        let _ = reply.send(Ok(()));
        self.set_status(SpectrometerStatus::Recording);
        info!(
            serial = %self.serial,
            %task_id,
            channel = %channel,
            t = ?self.current.get(&channel),
            dark,
            "acquisition"
        );
        match self.acquire(&channel, dark) {
            Ok(s) => self.emit(Event::Spectrum {
                task_id,
                spectrum: Some(Box::new(s)),
            }),
            Err(e) => {
                error!(serial = %self.serial, "during acquisition: {e}");
                self.emit(Event::Spectrum {
                    task_id,
                    spectrum: None,
                });
                self.check_ok();
            }
        }
        if self.status == SpectrometerStatus::Recording {
            self.set_status(SpectrometerStatus::Idle);
        }
    }

    fn acquire(&mut self, channel: &str, dark: bool) -> Result<Spectrum> {
        let t = *self
            .current
            .get(channel)
            .ok_or_else(|| PiccoloError::UnknownChannel(channel.to_string()))?;
        let pixels = self.read_frame(t)?;
        let temperature = self.try_read_temperature();
        let info = self
            .info
            .clone()
            .ok_or_else(|| PiccoloError::NotConnected(self.serial.clone()))?;
        let meta = SpectrumMeta {
            serial_number: info.serial_number,
            wavelength_calibration_coefficients: info.wavelength_calibration_coefficients,
            wavelength_calibration_coefficients_piccolo: self.calibration.get(channel).cloned(),
            dark_pixels: info.dark_pixels,
            nonlinearity_correction_coefficients: info.nonlinearity_correction_coefficients,
            saturation_level: info.saturation_level,
            integration_time: t,
            integration_time_units: "milliseconds".to_string(),
            temperature,
            temperature_units: "degrees Celsius".to_string(),
            direction: channel.to_string(),
            dark,
            timestamp: Utc::now(),
        };
        Ok(Spectrum { meta, pixels })
    }

    /// One readout at `t` ms. The first frame flushes whatever was left in
    /// the device pipeline; the second is the one returned. The device is
    /// parked at the minimum integration time afterwards.
    fn read_frame(&mut self, t: f64) -> Result<Vec<f64>> {
        let t = t.clamp(self.min_ms, self.max_ms);
        let min = self.min_ms;
        let d = self
            .driver
            .as_mut()
            .ok_or_else(|| PiccoloError::NotConnected(self.serial.clone()))?;
        d.set_integration_time_ms(t)?;
        let _stale = d.read_pixels()?;
        let pixels = d.read_pixels()?;
        d.set_integration_time_ms(min)?;
        debug!(
            serial = %self.serial,
            t,
            max = pixels.iter().cloned().fold(0.0, f64::max),
            "recorded spectrum"
        );
        Ok(pixels)
    }

    fn try_read_temperature(&mut self) -> Option<f64> {
        self.driver
            .as_mut()
            .and_then(|d| d.tec())
            .and_then(|tec| tec.temperature().ok())
    }

    // ------------------------------------------------------------------
    // Autointegration
    // ------------------------------------------------------------------

    fn autointegrate(&mut self, channel: String, target: f64, reply: Reply<()>) {
        if !self.channels.contains(&channel) {
            let _ = reply.send(Err(PiccoloError::UnknownChannel(channel)));
            return;
        }
        if !(0.0 < target && target < 100.0) {
            let _ = reply.send(Err(PiccoloError::invalid(format!(
                "target out of range 0<{target}<100"
            ))));
            return;
        }
        if let Err(e) = self.check_ready() {
            let _ = reply.send(Err(e));
            return;
        }
        let _ = reply.send(Ok(()));
        self.set_status(SpectrometerStatus::Autointegrating);
        info!(
            serial = %self.serial,
            channel = %channel,
            target,
            current = ?self.current.get(&channel),
            "start autointegration"
        );
        let params = SearchParams {
            current_ms: self.current.get(&channel).copied().unwrap_or(self.min_ms),
            min_ms: self.min_ms,
            max_ms: self.max_ms,
            saturation: self
                .info
                .as_ref()
                .map_or(200_000.0, |i| i.saturation_level),
            target_pct: target,
        };
        let outcome = autointegrate::search(params, |t| {
            let pixels = self.read_frame(t)?;
            Ok(autointegrate::peak_intensity(&pixels))
        });
        match outcome {
            Ok(Some(t)) => {
                // Deliberately bypasses the auto reset of the ordinary
                // setter path.
                self.set_auto(&channel, AutoStatus::Succeeded);
                if let Err(e) = self.set_current(&channel, t, false) {
                    warn!(serial = %self.serial, "storing autointegration result: {e}");
                }
            }
            Ok(None) => {
                error!(serial = %self.serial, channel = %channel, "failed to autointegrate");
                self.set_auto(&channel, AutoStatus::Failed);
            }
            Err(e) => {
                error!(serial = %self.serial, "during autointegration: {e}");
                self.set_auto(&channel, AutoStatus::Failed);
                self.check_ok();
            }
        }
        // Minimise idle power draw.
        let min = self.min_ms;
        if let Some(d) = self.driver.as_mut() {
            let _ = d.set_integration_time_ms(min);
        }
        if self.status == SpectrometerStatus::Autointegrating {
            self.set_status(SpectrometerStatus::Idle);
        }
        info!(
            serial = %self.serial,
            channel = %channel,
            current = ?self.current.get(&channel),
            "finished autointegration"
        );
    }

    // ------------------------------------------------------------------
    // TEC
    // ------------------------------------------------------------------

    fn have_tec(&mut self) -> bool {
        self.driver.as_mut().is_some_and(|d| d.tec().is_some())
    }

    fn read_temperature(&mut self) -> Result<f64> {
        self.with_tec(|tec| tec.temperature())
    }

    fn with_tec<T>(
        &mut self,
        f: impl FnOnce(&mut dyn crate::hardware::TecDriver) -> Result<T>,
    ) -> Result<T> {
        let d = self
            .driver
            .as_mut()
            .ok_or_else(|| PiccoloError::NotConnected(self.serial.clone()))?;
        let tec = d
            .tec()
            .ok_or_else(|| PiccoloError::invalid("device has no TEC"))?;
        f(tec)
    }

    // ------------------------------------------------------------------
    // Events
    // ------------------------------------------------------------------

    fn set_status(&mut self, status: SpectrometerStatus) {
        self.status = status;
        self.emit(Event::Status(status));
    }

    fn emit(&self, event: Event) {
        let _ = self.events.send(event);
    }

    fn emit_snapshot(&self) {
        self.emit(Event::Status(self.status));
        self.emit(Event::Min(self.min_ms));
        self.emit(Event::Max(self.max_ms));
        for (channel, &ms) in &self.current {
            self.emit(Event::Current {
                channel: channel.clone(),
                ms,
            });
        }
        for (channel, &status) in &self.auto {
            self.emit(Event::Auto {
                channel: channel.clone(),
                status,
            });
        }
    }
}
