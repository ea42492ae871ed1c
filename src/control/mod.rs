//! Acquisition controller.
//!
//! The controller owns the orchestration worker thread ([`worker`]), the
//! spectra writer, the batch parameters (`numSequences`, `autointegration`,
//! `delay`, `target`) and the scheduler poll loop. Requests either execute
//! immediately (when the instrument is idle) or, given an `at_time`, are
//! stored as scheduler jobs and picked up by the poll loop.

mod worker;

use crate::config::OutputConfig;
use crate::datadir::DataDir;
use crate::error::{PiccoloError, Result};
use crate::notify::Notifier;
use crate::output;
use crate::resource::{Call, Site};
use crate::scheduler::{parse_datetime, JobPayload, Scheduler};
use crate::shutter::ShutterBank;
use crate::spectrometer::SpectrometerBank;
use chrono::Utc;
use parking_lot::{Mutex, RwLock};
use serde_json::{json, Value};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{mpsc, Arc};
use std::time::Duration;
use tokio::sync::oneshot;
use tracing::{error, info};

pub(crate) type Reply = oneshot::Sender<Result<()>>;

pub(crate) enum ControlTask {
    Record {
        run: String,
        nsequence: i64,
        auto: i64,
        delay: f64,
        target: f64,
        reply: Reply,
    },
    Dark {
        run: String,
        reply: Reply,
    },
    Autointegrate {
        target: f64,
        reply: Reply,
    },
    Abort,
    Pause,
    Shutdown,
}

pub(crate) enum ControlEvent {
    Status(String),
    Sequence(i64),
}

struct ControlState {
    status: String,
    current_sequence: i64,
    num_sequences: i64,
    autointegration: i64,
    delay: f64,
    target: f64,
}

#[derive(Clone, Default)]
struct Notifiers {
    status: Notifier,
    current_sequence: Notifier,
    num_sequences: Notifier,
    autointegration: Notifier,
    delay: Notifier,
    target: Notifier,
}

struct ControlInner {
    tasks: mpsc::Sender<ControlTask>,
    busy: Arc<AtomicBool>,
    paused: Arc<AtomicBool>,
    datadir: DataDir,
    scheduler: Scheduler,
    state: RwLock<ControlState>,
    notifiers: Notifiers,
    worker: Mutex<Option<std::thread::JoinHandle<()>>>,
    writer: Mutex<Option<std::thread::JoinHandle<()>>>,
    poll_task: Mutex<Option<tokio::task::JoinHandle<()>>>,
}

/// Handle to the acquisition controller.
#[derive(Clone)]
pub struct Control {
    inner: Arc<ControlInner>,
}

impl Control {
    /// Start the worker and writer threads, the info fan-out task and the
    /// scheduler poll loop. Must be called within a tokio runtime.
    pub fn new(
        datadir: DataDir,
        shutters: ShutterBank,
        spectrometers: SpectrometerBank,
        scheduler: Scheduler,
        output: &OutputConfig,
    ) -> Result<Self> {
        let (task_tx, task_rx) = mpsc::channel();
        let (info_tx, info_rx) = tokio::sync::mpsc::unbounded_channel();
        let busy = Arc::new(AtomicBool::new(false));
        let paused = Arc::new(AtomicBool::new(false));

        let (writer_tx, writer_handle) = output::spawn(
            datadir.datadir().to_path_buf(),
            output.clobber,
            output.split,
        )?;

        let control_worker = worker::ControlWorker::new(
            datadir.clone(),
            shutters,
            spectrometers,
            task_rx,
            busy.clone(),
            paused.clone(),
            info_tx,
            writer_tx,
        );
        let worker_handle = std::thread::Builder::new()
            .name("piccolo_worker".to_string())
            .spawn(move || control_worker.run())?;

        let inner = Arc::new(ControlInner {
            tasks: task_tx,
            busy,
            paused,
            datadir,
            scheduler,
            state: RwLock::new(ControlState {
                status: String::new(),
                current_sequence: -1,
                num_sequences: 1,
                autointegration: -1,
                delay: 0.0,
                target: 80.0,
            }),
            notifiers: Notifiers::default(),
            worker: Mutex::new(Some(worker_handle)),
            writer: Mutex::new(Some(writer_handle)),
            poll_task: Mutex::new(None),
        });

        spawn_info_task(inner.clone(), info_rx);
        let poll = tokio::spawn(scheduler_loop(inner.clone()));
        *inner.poll_task.lock() = Some(poll);

        Ok(Self { inner })
    }

    /// Send the poison pill and wait for the worker (and its writer) to
    /// drain.
    pub fn stop(&self) {
        info!("shutting down");
        let _ = self.inner.tasks.send(ControlTask::Shutdown);
        if let Some(handle) = self.inner.worker.lock().take() {
            let _ = handle.join();
        }
        if let Some(handle) = self.inner.writer.lock().take() {
            let _ = handle.join();
        }
        if let Some(task) = self.inner.poll_task.lock().take() {
            task.abort();
        }
    }

    // ------------------------------------------------------------------
    // Parameters
    // ------------------------------------------------------------------

    pub fn num_sequences(&self) -> i64 {
        self.inner.state.read().num_sequences
    }

    pub fn set_num_sequences(&self, n: i64) -> Result<()> {
        if n < 1 {
            return Err(PiccoloError::invalid(
                "number of sequences must be greater than 0",
            ));
        }
        let mut state = self.inner.state.write();
        if state.num_sequences != n {
            state.num_sequences = n;
            drop(state);
            self.inner.notifiers.num_sequences.notify();
        }
        Ok(())
    }

    pub fn autointegration(&self) -> i64 {
        self.inner.state.read().autointegration
    }

    /// `-1` never, `0` once at the start, `k > 0` before every k-th
    /// sequence.
    pub fn set_autointegration(&self, n: i64) -> Result<()> {
        let n = n.max(-1);
        let mut state = self.inner.state.write();
        if state.autointegration != n {
            state.autointegration = n;
            drop(state);
            self.inner.notifiers.autointegration.notify();
        }
        Ok(())
    }

    pub fn delay(&self) -> f64 {
        self.inner.state.read().delay
    }

    pub fn set_delay(&self, seconds: f64) -> Result<()> {
        if seconds < 0.0 {
            return Err(PiccoloError::invalid("delay must be >= 0"));
        }
        let mut state = self.inner.state.write();
        if (state.delay - seconds).abs() > 1e-5 {
            state.delay = seconds;
            drop(state);
            self.inner.notifiers.delay.notify();
        }
        Ok(())
    }

    pub fn target(&self) -> f64 {
        self.inner.state.read().target
    }

    pub fn set_target(&self, pct: f64) -> Result<()> {
        if !(0.0 < pct && pct < 100.0) {
            return Err(PiccoloError::invalid(format!(
                "target out of range 0<{pct}<100"
            )));
        }
        let mut state = self.inner.state.write();
        if (state.target - pct).abs() > 1e-5 {
            state.target = pct;
            drop(state);
            self.inner.notifiers.target.notify();
        }
        Ok(())
    }

    pub fn current_sequence(&self) -> i64 {
        self.inner.state.read().current_sequence
    }

    /// `idle` when nothing runs, otherwise the worker's progress string.
    pub fn status(&self) -> String {
        if self.inner.busy.load(Ordering::SeqCst) {
            self.inner.state.read().status.clone()
        } else {
            "idle".to_string()
        }
    }

    pub fn is_busy(&self) -> bool {
        self.inner.busy.load(Ordering::SeqCst)
    }

    // ------------------------------------------------------------------
    // Operations
    // ------------------------------------------------------------------

    async fn submit(&self, make: impl FnOnce(Reply) -> ControlTask) -> Result<()> {
        if self.inner.busy.load(Ordering::SeqCst) {
            return Err(PiccoloError::Busy(
                "piccolo system".to_string(),
                self.status(),
            ));
        }
        let (tx, rx) = oneshot::channel();
        self.inner
            .tasks
            .send(make(tx))
            .map_err(|_| PiccoloError::WorkerGone("control".to_string()))?;
        rx.await
            .unwrap_or_else(|_| Err(PiccoloError::WorkerGone("control".to_string())))
    }

    fn select_run(&self, run: Option<&str>) -> Result<String> {
        if let Some(run) = run {
            match self.inner.datadir.set_current_run(run) {
                Ok(_) => {}
                // Re-selecting the current run is fine here.
                Err(e) if e.is_domain() => {}
                Err(e) => return Err(e),
            }
        }
        Ok(self.inner.datadir.current_run())
    }

    /// Start recording a batch, or schedule it when `at_time` is given.
    #[allow(clippy::too_many_arguments)]
    pub async fn record_sequence(
        &self,
        run: Option<String>,
        nsequence: Option<i64>,
        auto: Option<i64>,
        delay: Option<f64>,
        target: Option<f64>,
        at_time: Option<String>,
        interval: Option<f64>,
        end_time: Option<String>,
    ) -> Result<()> {
        if let Some(n) = nsequence {
            self.set_num_sequences(n)?;
        }
        if let Some(a) = auto {
            self.set_autointegration(a)?;
        }
        if let Some(d) = delay {
            self.set_delay(d)?;
        }
        if let Some(t) = target {
            self.set_target(t)?;
        }
        let run = self.select_run(run.as_deref())?;

        if let Some(at) = at_time {
            let start = parse_datetime(&at)?;
            let interval = interval
                .map(|s| chrono::Duration::milliseconds((s * 1000.0).round() as i64));
            let end = end_time.as_deref().map(parse_datetime).transpose()?;
            let payload = JobPayload::Record {
                run,
                nsequence: self.num_sequences(),
                auto: self.autointegration(),
                delay: self.delay(),
                target: self.target(),
            };
            self.inner
                .scheduler
                .add(start, payload, interval, end, false)?;
            return Ok(());
        }

        let (nsequence, auto, delay, target) = (
            self.num_sequences(),
            self.autointegration(),
            self.delay(),
            self.target(),
        );
        self.submit(|reply| ControlTask::Record {
            run,
            nsequence,
            auto,
            delay,
            target,
            reply,
        })
        .await
    }

    /// Record a dark batch for `run` (or the current run).
    pub async fn record_dark(&self, run: Option<String>) -> Result<()> {
        let run = self.select_run(run.as_deref())?;
        self.submit(|reply| ControlTask::Dark { run, reply }).await
    }

    /// Determine the best integration times.
    pub async fn auto(&self, target: Option<f64>) -> Result<()> {
        if let Some(t) = target {
            self.set_target(t)?;
        }
        let target = self.target();
        self.submit(|reply| ControlTask::Autointegrate { target, reply })
            .await
    }

    /// Abort the batch in flight. A warning when nothing runs.
    pub fn abort(&self) -> Result<()> {
        if !self.inner.busy.load(Ordering::SeqCst) {
            return Err(PiccoloError::invalid("piccolo system is not busy"));
        }
        self.inner
            .tasks
            .send(ControlTask::Abort)
            .map_err(|_| PiccoloError::WorkerGone("control".to_string()))
    }

    /// Toggle pause on the batch in flight.
    pub fn pause(&self) -> Result<()> {
        if !self.inner.busy.load(Ordering::SeqCst) {
            return Err(PiccoloError::invalid("piccolo system is not busy"));
        }
        self.inner
            .tasks
            .send(ControlTask::Pause)
            .map_err(|_| PiccoloError::WorkerGone("control".to_string()))
    }

    // ------------------------------------------------------------------
    // Endpoints
    // ------------------------------------------------------------------

    /// Endpoint tree for the controller, with the scheduler mounted below
    /// `scheduler/`.
    pub fn resources(&self) -> Site {
        let mut site = Site::new();
        let c = self.clone();
        site.at("status")
            .get(move |_| {
                let c = c.clone();
                async move { Ok(json!(c.status())) }
            })
            .observable(self.inner.notifiers.status.clone())
            .register();
        let c = self.clone();
        site.at("current_sequence")
            .get(move |_| {
                let c = c.clone();
                async move { Ok(json!(c.current_sequence())) }
            })
            .observable(self.inner.notifiers.current_sequence.clone())
            .register();
        let c = self.clone();
        let c2 = self.clone();
        site.at("numSequences")
            .get(move |_| {
                let c = c.clone();
                async move { Ok(json!(c.num_sequences())) }
            })
            .put(move |call: Call| {
                let c = c2.clone();
                async move {
                    let n: i64 = call.require(0, "n")?;
                    c.set_num_sequences(n)?;
                    Ok(json!(c.num_sequences()))
                }
            })
            .observable(self.inner.notifiers.num_sequences.clone())
            .register();
        let c = self.clone();
        let c2 = self.clone();
        site.at("autointegration")
            .get(move |_| {
                let c = c.clone();
                async move { Ok(json!(c.autointegration())) }
            })
            .put(move |call: Call| {
                let c = c2.clone();
                async move {
                    let n: i64 = call.require(0, "n")?;
                    c.set_autointegration(n)?;
                    Ok(json!(c.autointegration()))
                }
            })
            .observable(self.inner.notifiers.autointegration.clone())
            .register();
        let c = self.clone();
        let c2 = self.clone();
        site.at("delay")
            .get(move |_| {
                let c = c.clone();
                async move { Ok(json!(c.delay())) }
            })
            .put(move |call: Call| {
                let c = c2.clone();
                async move {
                    let d: f64 = call.require(0, "d")?;
                    c.set_delay(d)?;
                    Ok(json!(c.delay()))
                }
            })
            .observable(self.inner.notifiers.delay.clone())
            .register();
        let c = self.clone();
        let c2 = self.clone();
        site.at("target")
            .get(move |_| {
                let c = c.clone();
                async move { Ok(json!(c.target())) }
            })
            .put(move |call: Call| {
                let c = c2.clone();
                async move {
                    let t: f64 = call.require(0, "t")?;
                    c.set_target(t)?;
                    Ok(json!(c.target()))
                }
            })
            .observable(self.inner.notifiers.target.clone())
            .register();
        let c = self.clone();
        site.at("record_sequence")
            .put(move |call: Call| {
                let c = c.clone();
                async move {
                    c.record_sequence(
                        call.param(0, "run")?,
                        call.param(1, "nsequence")?,
                        call.param(2, "auto")?,
                        call.param(3, "delay")?,
                        call.param(4, "target")?,
                        call.param(5, "at_time")?,
                        call.param(6, "interval")?,
                        call.param(7, "end_time")?,
                    )
                    .await?;
                    Ok(Value::Null)
                }
            })
            .register();
        let c = self.clone();
        site.at("record_dark")
            .put(move |call: Call| {
                let c = c.clone();
                async move {
                    c.record_dark(call.param(0, "run")?).await?;
                    Ok(Value::Null)
                }
            })
            .register();
        let c = self.clone();
        site.at("auto")
            .put(move |call: Call| {
                let c = c.clone();
                async move {
                    c.auto(call.param(0, "target")?).await?;
                    Ok(Value::Null)
                }
            })
            .register();
        let c = self.clone();
        site.at("abort")
            .get(move |_| {
                let c = c.clone();
                async move {
                    c.abort()?;
                    Ok(Value::Null)
                }
            })
            .register();
        let c = self.clone();
        site.at("pause")
            .get(move |_| {
                let c = c.clone();
                async move {
                    c.pause()?;
                    Ok(Value::Null)
                }
            })
            .register();
        site.mount("scheduler", self.inner.scheduler.resources());
        site
    }
}

fn spawn_info_task(
    inner: Arc<ControlInner>,
    mut info: tokio::sync::mpsc::UnboundedReceiver<ControlEvent>,
) {
    tokio::spawn(async move {
        while let Some(event) = info.recv().await {
            match event {
                ControlEvent::Status(status) => {
                    inner.state.write().status = status;
                    inner.notifiers.status.notify();
                }
                ControlEvent::Sequence(sequence) => {
                    inner.state.write().current_sequence = sequence;
                    inner.notifiers.current_sequence.notify();
                }
            }
        }
    });
}

/// Poll the scheduler once a second while the instrument is idle and run
/// whatever is due.
async fn scheduler_loop(inner: Arc<ControlInner>) {
    loop {
        tokio::time::sleep(Duration::from_secs(1)).await;
        if inner.busy.load(Ordering::SeqCst) {
            continue;
        }
        let jobs = match inner.scheduler.runnable_jobs(Utc::now()) {
            Ok(jobs) => jobs,
            Err(e) => {
                error!("scheduler poll: {e}");
                continue;
            }
        };
        for payload in jobs {
            if let Err(e) = dispatch_job(&inner, payload).await {
                error!("failed to run scheduled job: {e}");
            }
        }
    }
}

async fn dispatch_job(inner: &Arc<ControlInner>, payload: JobPayload) -> Result<()> {
    let send = |task: ControlTask| {
        inner
            .tasks
            .send(task)
            .map_err(|_| PiccoloError::WorkerGone("control".to_string()))
    };
    // The worker acknowledges as soon as it picks the job up.
    let (tx, rx) = oneshot::channel();
    match payload {
        JobPayload::Record {
            run,
            nsequence,
            auto,
            delay,
            target,
        } => {
            send(ControlTask::Record {
                run,
                nsequence,
                auto,
                delay,
                target,
                reply: tx,
            })?;
        }
        JobPayload::Dark { run } => {
            send(ControlTask::Dark { run, reply: tx })?;
        }
        JobPayload::Autointegrate { target } => {
            send(ControlTask::Autointegrate { target, reply: tx })?;
        }
        JobPayload::PowerOff => {
            info!("power-off window reached, peripherals may power down");
            return Ok(());
        }
        JobPayload::PowerOn => {
            info!("power-on window reached");
            return Ok(());
        }
    }
    rx.await
        .unwrap_or_else(|_| Err(PiccoloError::WorkerGone("control".to_string())))
}
