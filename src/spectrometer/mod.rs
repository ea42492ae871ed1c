//! Spectrometer frontend and bank.
//!
//! Every spectrometer gets a dedicated worker thread owning the device
//! handle ([`worker`]); this module is the handle the rest of the server
//! holds. The handle keeps a cache of the worker's published state (fed by
//! an info fan-out task), accepts commands on behalf of callers, and
//! brokers finished spectra from the event stream to `get_spectrum`.

pub(crate) mod autointegrate;
pub(crate) mod worker;

use crate::config::SpectrometerConfig;
use crate::error::{PiccoloError, Result};
use crate::hardware::SpectrometerOpener;
use crate::notify::Notifier;
use crate::resource::{Call, Site};
use crate::spectrum::Spectrum;
use parking_lot::{Mutex, RwLock};
use serde::{Deserialize, Serialize};
use serde_json::json;
use std::collections::{BTreeMap, HashMap, VecDeque};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{mpsc, Arc};
use std::time::Duration;
use tracing::{info, warn};
use uuid::Uuid;

use worker::{Reply, Task, Worker};

/// Lifecycle state of a spectrometer. The declaration order is meaningful:
/// readiness tests compare against [`SpectrometerStatus::Idle`].
#[derive(
    Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize,
)]
#[serde(rename_all = "snake_case")]
pub enum SpectrometerStatus {
    NoWorker,
    Disconnected,
    Connecting,
    Idle,
    Recording,
    Autointegrating,
}

impl std::fmt::Display for SpectrometerStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            SpectrometerStatus::NoWorker => "no_worker",
            SpectrometerStatus::Disconnected => "disconnected",
            SpectrometerStatus::Connecting => "connecting",
            SpectrometerStatus::Idle => "idle",
            SpectrometerStatus::Recording => "recording",
            SpectrometerStatus::Autointegrating => "autointegrating",
        };
        f.write_str(s)
    }
}

/// Per-channel autointegration state: not set, succeeded or failed.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum AutoStatus {
    #[serde(rename = "n")]
    NotSet,
    #[serde(rename = "s")]
    Succeeded,
    #[serde(rename = "f")]
    Failed,
}

impl AutoStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            AutoStatus::NotSet => "n",
            AutoStatus::Succeeded => "s",
            AutoStatus::Failed => "f",
        }
    }
}

#[derive(Clone, Debug)]
struct Cached {
    status: SpectrometerStatus,
    min: f64,
    max: f64,
    current: BTreeMap<String, f64>,
    auto: BTreeMap<String, AutoStatus>,
    have_tec: Option<bool>,
    tec_enabled: bool,
    temperature: Option<f64>,
    target_temperature: Option<f64>,
}

#[derive(Clone, Default)]
struct Notifiers {
    status: Notifier,
    min: Notifier,
    max: Notifier,
    current: Notifier,
    auto: Notifier,
    tec_enabled: Notifier,
    target_temperature: Notifier,
}

struct SpecInner {
    name: String,
    serial: String,
    channels: Vec<String>,
    tasks: mpsc::Sender<Task>,
    busy: Arc<AtomicBool>,
    cache: RwLock<Cached>,
    pending: Mutex<VecDeque<Uuid>>,
    spectra: Mutex<HashMap<Uuid, Option<Spectrum>>>,
    worker: Mutex<Option<std::thread::JoinHandle<()>>>,
    notifiers: Notifiers,
}

/// Handle to one spectrometer; clones share the worker.
#[derive(Clone)]
pub struct Spectrometer {
    inner: Arc<SpecInner>,
}

impl Spectrometer {
    /// Start the worker thread and the info fan-out task, then queue the
    /// initial connect. Must be called within a tokio runtime.
    pub fn new(
        serial: &str,
        channels: Vec<String>,
        min_ms: f64,
        max_ms: f64,
        calibration: BTreeMap<String, Vec<f64>>,
        opener: Arc<SpectrometerOpener>,
    ) -> Result<Self> {
        let (task_tx, task_rx) = mpsc::channel();
        let (event_tx, event_rx) = tokio::sync::mpsc::unbounded_channel();
        let busy = Arc::new(AtomicBool::new(false));
        let inner = Arc::new(SpecInner {
            name: format!("S_{serial}"),
            serial: serial.to_string(),
            channels: channels.clone(),
            tasks: task_tx.clone(),
            busy: busy.clone(),
            cache: RwLock::new(Cached {
                status: SpectrometerStatus::NoWorker,
                min: min_ms,
                max: max_ms,
                current: channels.iter().map(|c| (c.clone(), min_ms)).collect(),
                auto: channels
                    .iter()
                    .map(|c| (c.clone(), AutoStatus::NotSet))
                    .collect(),
                have_tec: None,
                tec_enabled: false,
                temperature: None,
                target_temperature: None,
            }),
            pending: Mutex::new(VecDeque::new()),
            spectra: Mutex::new(HashMap::new()),
            worker: Mutex::new(None),
            notifiers: Notifiers::default(),
        });

        let worker = Worker::new(
            serial.to_string(),
            channels,
            calibration,
            min_ms,
            max_ms,
            opener,
            busy,
            task_rx,
            task_tx,
            event_tx,
        );
        let handle = std::thread::Builder::new()
            .name(format!("spectrometer.{serial}"))
            .spawn(move || worker.run())?;
        *inner.worker.lock() = Some(handle);

        spawn_forwarder(inner.clone(), event_rx);

        let spec = Self { inner };
        spec.connect();
        info!(name = %spec.inner.name, "started");
        Ok(spec)
    }

    pub fn name(&self) -> &str {
        &self.inner.name
    }

    pub fn serial(&self) -> &str {
        &self.inner.serial
    }

    pub fn channels(&self) -> &[String] {
        &self.inner.channels
    }

    pub fn connect(&self) {
        let _ = self.inner.tasks.send(Task::Connect);
    }

    pub fn disconnect(&self) {
        let _ = self.inner.tasks.send(Task::Disconnect);
    }

    /// Ask the worker to exit and wait for it.
    pub fn stop(&self) {
        info!(name = %self.inner.name, "shutting down");
        let _ = self.inner.tasks.send(Task::Shutdown);
        if let Some(handle) = self.inner.worker.lock().take() {
            let _ = handle.join();
        }
    }

    // ------------------------------------------------------------------
    // Cached state
    // ------------------------------------------------------------------

    pub fn status(&self) -> SpectrometerStatus {
        let gone = self
            .inner
            .worker
            .lock()
            .as_ref()
            .map_or(true, |h| h.is_finished());
        if gone {
            return SpectrometerStatus::NoWorker;
        }
        self.inner.cache.read().status
    }

    pub fn is_busy(&self) -> bool {
        self.inner.busy.load(Ordering::SeqCst)
    }

    pub fn min_time(&self) -> f64 {
        self.inner.cache.read().min
    }

    pub fn max_time(&self) -> f64 {
        self.inner.cache.read().max
    }

    pub fn current_time(&self, channel: &str) -> Result<f64> {
        self.inner
            .cache
            .read()
            .current
            .get(channel)
            .copied()
            .ok_or_else(|| PiccoloError::UnknownChannel(channel.to_string()))
    }

    pub fn auto_status(&self, channel: &str) -> Result<AutoStatus> {
        self.inner
            .cache
            .read()
            .auto
            .get(channel)
            .copied()
            .ok_or_else(|| PiccoloError::UnknownChannel(channel.to_string()))
    }

    pub fn tec_enabled(&self) -> bool {
        self.inner.cache.read().tec_enabled
    }

    pub fn target_temperature(&self) -> Option<f64> {
        self.inner.cache.read().target_temperature
    }

    fn check_idle(&self) -> Result<()> {
        let status = self.status();
        if status != SpectrometerStatus::Idle {
            return Err(PiccoloError::Busy(
                format!("spectrometer {}", self.inner.name),
                status.to_string(),
            ));
        }
        Ok(())
    }

    /// Like [`Self::check_idle`], but rides out the short lag between the
    /// worker finishing a task and the cache catching up. Only for use off
    /// the async runtime.
    fn check_idle_blocking(&self) -> Result<()> {
        for _ in 0..10 {
            if self.check_idle().is_ok() {
                return Ok(());
            }
            std::thread::sleep(Duration::from_millis(50));
        }
        self.check_idle()
    }

    // ------------------------------------------------------------------
    // Commands
    // ------------------------------------------------------------------

    fn send<T>(&self, make: impl FnOnce(Reply<T>) -> Task) -> tokio::sync::oneshot::Receiver<Result<T>> {
        let (tx, rx) = tokio::sync::oneshot::channel();
        let _ = self.inner.tasks.send(make(tx));
        rx
    }

    async fn call<T>(&self, make: impl FnOnce(Reply<T>) -> Task) -> Result<T> {
        self.send(make)
            .await
            .unwrap_or_else(|_| Err(PiccoloError::WorkerGone(self.inner.name.clone())))
    }

    fn call_blocking<T>(&self, make: impl FnOnce(Reply<T>) -> Task) -> Result<T> {
        self.send(make)
            .blocking_recv()
            .unwrap_or_else(|_| Err(PiccoloError::WorkerGone(self.inner.name.clone())))
    }

    pub async fn set_min_time(&self, ms: f64) -> Result<()> {
        self.check_idle()?;
        self.call(|reply| Task::SetMin { ms, reply }).await
    }

    pub async fn set_max_time(&self, ms: f64) -> Result<()> {
        self.check_idle()?;
        self.call(|reply| Task::SetMax { ms, reply }).await
    }

    pub async fn set_current_time(&self, channel: &str, ms: f64) -> Result<()> {
        self.check_idle()?;
        let channel = channel.to_string();
        self.call(|reply| Task::SetCurrent { channel, ms, reply }).await
    }

    pub async fn have_tec(&self) -> Result<bool> {
        if let Some(v) = self.inner.cache.read().have_tec {
            return Ok(v);
        }
        let v = self.call(|reply| Task::HaveTec { reply }).await?;
        self.inner.cache.write().have_tec = Some(v);
        Ok(v)
    }

    pub async fn set_tec_enabled(&self, on: bool) -> Result<()> {
        if !self.have_tec().await? {
            return Err(PiccoloError::invalid("device has no TEC"));
        }
        if self.inner.cache.read().tec_enabled == on {
            return Ok(());
        }
        self.check_idle()?;
        self.call(|reply| Task::EnableTec { on, reply }).await?;
        self.inner.cache.write().tec_enabled = on;
        self.inner.notifiers.tec_enabled.notify();
        Ok(())
    }

    /// Current detector temperature. When the worker is not idle the last
    /// known value is returned with a warning instead of blocking.
    pub async fn current_temperature(&self) -> Result<Option<f64>> {
        if !self.have_tec().await? {
            return Err(PiccoloError::invalid("device has no TEC"));
        }
        match self.check_idle() {
            Ok(()) => {
                let t = self.call(|reply| Task::ReadTemperature { reply }).await?;
                self.inner.cache.write().temperature = Some(t);
                Ok(Some(t))
            }
            Err(e) => {
                warn!(name = %self.inner.name, "{e}; returning last known temperature");
                Ok(self.inner.cache.read().temperature)
            }
        }
    }

    pub async fn set_target_temperature(&self, deg_c: f64) -> Result<()> {
        if !self.have_tec().await? {
            return Err(PiccoloError::invalid("device has no TEC"));
        }
        let known = self.inner.cache.read().target_temperature;
        if known.is_some_and(|t| (t - deg_c).abs() < 1e-5) {
            return Ok(());
        }
        self.check_idle()?;
        self.call(|reply| Task::SetTargetTemperature { deg_c, reply })
            .await?;
        self.inner.cache.write().target_temperature = Some(deg_c);
        self.inner.notifiers.target_temperature.notify();
        Ok(())
    }

    /// Queue one acquisition. Only valid while idle and with no spectrum
    /// outstanding; the result is collected with [`Self::get_spectrum`].
    pub fn start_acquisition(&self, channel: &str, dark: bool) -> Result<()> {
        self.check_idle_blocking()?;
        if !self.inner.pending.lock().is_empty() {
            return Err(PiccoloError::invalid("spectrum not collected yet"));
        }
        let task_id = Uuid::new_v4();
        self.inner.pending.lock().push_back(task_id);
        let channel = channel.to_string();
        let result = self.call_blocking(|reply| Task::StartAcquisition {
            channel,
            dark,
            task_id,
            reply,
        });
        if result.is_err() {
            self.inner.pending.lock().pop_back();
        }
        result
    }

    /// Block until the pending acquisition delivers. Waits indefinitely
    /// while the worker is busy, then up to 5 s (50 polls of 100 ms).
    pub fn get_spectrum(&self) -> Result<Spectrum> {
        let task_id = self
            .inner
            .pending
            .lock()
            .front()
            .copied()
            .ok_or_else(|| PiccoloError::invalid("no acquisition pending"))?;
        loop {
            if let Some(result) = self.take_spectrum(task_id) {
                return result;
            }
            if self.status() <= SpectrometerStatus::Disconnected {
                self.drop_pending(task_id);
                return Err(PiccoloError::NotConnected(self.inner.name.clone()));
            }
            if !self.is_busy() {
                break;
            }
            std::thread::sleep(Duration::from_millis(100));
        }
        for _ in 0..50 {
            if let Some(result) = self.take_spectrum(task_id) {
                return result;
            }
            std::thread::sleep(Duration::from_millis(100));
        }
        Err(PiccoloError::Device(format!(
            "waited 5s for spectrum {task_id} but did not get it"
        )))
    }

    fn drop_pending(&self, task_id: Uuid) {
        let mut pending = self.inner.pending.lock();
        if pending.front() == Some(&task_id) {
            pending.pop_front();
        }
    }

    fn take_spectrum(&self, task_id: Uuid) -> Option<Result<Spectrum>> {
        let entry = self.inner.spectra.lock().remove(&task_id)?;
        self.drop_pending(task_id);
        match entry {
            Some(spectrum) => {
                info!(name = %self.inner.name, %task_id, "got spectrum");
                if spectrum.is_saturated() {
                    warn!(name = %self.inner.name, %task_id, "spectrum is saturated");
                }
                Some(Ok(spectrum))
            }
            None => Some(Err(PiccoloError::Device(format!(
                "acquisition {task_id} failed"
            )))),
        }
    }

    /// Kick off the integration-time search for one channel; completion is
    /// observed through `status`/`auto_status`.
    pub fn autointegrate(&self, channel: &str, target: f64) -> Result<()> {
        self.check_idle_blocking()?;
        if !(0.0 < target && target < 100.0) {
            return Err(PiccoloError::invalid(format!(
                "target out of range 0<{target}<100"
            )));
        }
        let channel = channel.to_string();
        self.call_blocking(|reply| Task::Autointegrate {
            channel,
            target,
            reply,
        })
    }

    /// Endpoint subtree for this spectrometer.
    fn resources(&self) -> Site {
        let mut site = Site::new();
        let s = self.clone();
        site.at("status")
            .get(move |_| {
                let s = s.clone();
                async move { Ok(json!(s.status().to_string())) }
            })
            .observable(self.inner.notifiers.status.clone())
            .register();
        let s = self.clone();
        let s2 = self.clone();
        site.at("min_time")
            .get(move |_| {
                let s = s.clone();
                async move { Ok(json!(s.min_time())) }
            })
            .put(move |call: Call| {
                let s = s2.clone();
                async move {
                    let t: f64 = call.require(0, "t")?;
                    s.set_min_time(t).await?;
                    Ok(json!(s.min_time()))
                }
            })
            .observable(self.inner.notifiers.min.clone())
            .register();
        let s = self.clone();
        let s2 = self.clone();
        site.at("max_time")
            .get(move |_| {
                let s = s.clone();
                async move { Ok(json!(s.max_time())) }
            })
            .put(move |call: Call| {
                let s = s2.clone();
                async move {
                    let t: f64 = call.require(0, "t")?;
                    s.set_max_time(t).await?;
                    Ok(json!(s.max_time()))
                }
            })
            .observable(self.inner.notifiers.max.clone())
            .register();
        let s = self.clone();
        let s2 = self.clone();
        site.at("current_time")
            .wildcard()
            .get(move |call: Call| {
                let s = s.clone();
                async move {
                    let channel = call.path_arg()?;
                    Ok(json!(s.current_time(&channel)?))
                }
            })
            .put(move |call: Call| {
                let s = s2.clone();
                async move {
                    let channel = call.path_arg()?;
                    let t: f64 = call.require(0, "t")?;
                    s.set_current_time(&channel, t).await?;
                    Ok(json!(s.current_time(&channel)?))
                }
            })
            .observable(self.inner.notifiers.current.clone())
            .register();
        let s = self.clone();
        site.at("autointegration")
            .wildcard()
            .get(move |call: Call| {
                let s = s.clone();
                async move {
                    let channel = call.path_arg()?;
                    Ok(json!(s.auto_status(&channel)?.as_str()))
                }
            })
            .observable(self.inner.notifiers.auto.clone())
            .register();
        let s = self.clone();
        site.at("haveTEC")
            .get(move |_| {
                let s = s.clone();
                async move { Ok(json!(s.have_tec().await?)) }
            })
            .register();
        let s = self.clone();
        let s2 = self.clone();
        site.at("TECenabled")
            .get(move |_| {
                let s = s.clone();
                async move { Ok(json!(s.tec_enabled())) }
            })
            .put(move |call: Call| {
                let s = s2.clone();
                async move {
                    let on: bool = call.require(0, "state")?;
                    s.set_tec_enabled(on).await?;
                    Ok(json!(s.tec_enabled()))
                }
            })
            .observable(self.inner.notifiers.tec_enabled.clone())
            .register();
        let s = self.clone();
        site.at("current_temperature")
            .get(move |_| {
                let s = s.clone();
                async move { Ok(json!(s.current_temperature().await?)) }
            })
            .register();
        let s = self.clone();
        let s2 = self.clone();
        site.at("target_temperature")
            .get(move |_| {
                let s = s.clone();
                async move { Ok(json!(s.target_temperature())) }
            })
            .put(move |call: Call| {
                let s = s2.clone();
                async move {
                    let t: f64 = call.require(0, "t")?;
                    s.set_target_temperature(t).await?;
                    Ok(json!(s.target_temperature()))
                }
            })
            .observable(self.inner.notifiers.target_temperature.clone())
            .register();
        site
    }
}

fn spawn_forwarder(
    inner: Arc<SpecInner>,
    mut events: tokio::sync::mpsc::UnboundedReceiver<worker::Event>,
) {
    tokio::spawn(async move {
        while let Some(event) = events.recv().await {
            match event {
                worker::Event::Status(s) => {
                    inner.cache.write().status = s;
                    inner.notifiers.status.notify();
                }
                worker::Event::Min(t) => {
                    inner.cache.write().min = t;
                    inner.notifiers.min.notify();
                }
                worker::Event::Max(t) => {
                    inner.cache.write().max = t;
                    inner.notifiers.max.notify();
                }
                worker::Event::Current { channel, ms } => {
                    inner.cache.write().current.insert(channel, ms);
                    inner.notifiers.current.notify();
                }
                worker::Event::Auto { channel, status } => {
                    inner.cache.write().auto.insert(channel, status);
                    inner.notifiers.auto.notify();
                }
                worker::Event::Spectrum { task_id, spectrum } => {
                    inner
                        .spectra
                        .lock()
                        .insert(task_id, spectrum.map(|b| *b));
                }
            }
        }
    });
}

/// All spectrometers of the instrument, keyed `S_<serial>`.
#[derive(Clone)]
pub struct SpectrometerBank {
    inner: Arc<BankInner>,
}

struct BankInner {
    specs: BTreeMap<String, Spectrometer>,
    channels: Vec<String>,
}

impl SpectrometerBank {
    /// Build the bank from configuration and apply cooling defaults to
    /// TEC-capable devices.
    pub async fn from_config(
        cfgs: &BTreeMap<String, SpectrometerConfig>,
        channels: Vec<String>,
        opener: Arc<SpectrometerOpener>,
    ) -> Result<Self> {
        let mut specs = BTreeMap::new();
        for (serial, cfg) in cfgs {
            let calibration: BTreeMap<String, Vec<f64>> = cfg
                .calibration
                .iter()
                .filter_map(|(c, cal)| {
                    cal.wavelength_calibration_coefficients_piccolo
                        .clone()
                        .map(|v| (c.clone(), v))
                })
                .collect();
            let spec = Spectrometer::new(
                serial,
                channels.clone(),
                cfg.min_integration_time,
                cfg.max_integration_time,
                calibration,
                opener.clone(),
            )?;
            if spec.have_tec().await.unwrap_or(false) {
                if let Err(e) = spec.set_tec_enabled(cfg.fan).await {
                    warn!(serial = %serial, "enabling TEC: {e}");
                }
                if let Err(e) = spec.set_target_temperature(cfg.detector_set_temperature).await {
                    warn!(serial = %serial, "setting detector temperature: {e}");
                }
            }
            specs.insert(spec.name().to_string(), spec);
        }
        Ok(Self {
            inner: Arc::new(BankInner { specs, channels }),
        })
    }

    /// Build a bank from ready-made spectrometers; used by tests.
    pub fn from_spectrometers(list: Vec<Spectrometer>, channels: Vec<String>) -> Self {
        Self {
            inner: Arc::new(BankInner {
                specs: list
                    .into_iter()
                    .map(|s| (s.name().to_string(), s))
                    .collect(),
                channels,
            }),
        }
    }

    pub fn get(&self, name: &str) -> Result<&Spectrometer> {
        self.inner
            .specs
            .get(name)
            .ok_or_else(|| PiccoloError::invalid(format!("unknown spectrometer {name}")))
    }

    pub fn names(&self) -> Vec<String> {
        self.inner.specs.keys().cloned().collect()
    }

    pub fn channels(&self) -> &[String] {
        &self.inner.channels
    }

    pub fn iter(&self) -> impl Iterator<Item = &Spectrometer> {
        self.inner.specs.values()
    }

    pub fn len(&self) -> usize {
        self.inner.specs.len()
    }

    pub fn is_empty(&self) -> bool {
        self.inner.specs.is_empty()
    }

    pub fn stop_all(&self) {
        for spec in self.iter() {
            spec.stop();
        }
    }

    /// Endpoint tree for the spectrometer component.
    pub fn resources(&self) -> Site {
        let mut site = Site::new();
        let bank = self.clone();
        site.at("spectrometers")
            .get(move |_| {
                let bank = bank.clone();
                async move { Ok(json!(bank.names())) }
            })
            .register();
        let bank = self.clone();
        site.at("channels")
            .get(move |_| {
                let bank = bank.clone();
                async move { Ok(json!(bank.channels())) }
            })
            .register();
        for (name, spec) in &self.inner.specs {
            site.mount(name, spec.resources());
        }
        site
    }
}
