//! Acquisition orchestration thread.
//!
//! One thread runs every multi-step operation (batch recording, dark
//! frames, autointegration fan-out) so the instrument is single-flight by
//! construction. The thread polls its command queue at every natural yield
//! point: before and after dark frames, between sequences and while
//! sleeping out the inter-sequence delay. `abort` is only meaningful while
//! a job is in flight; `pause` parks the thread until the next `pause`
//! (unpause), `abort` or shutdown.

use super::{ControlEvent, ControlTask};
use crate::datadir::DataDir;
use crate::error::{PiccoloError, Result};
use crate::output::WriterMsg;
use crate::shutter::ShutterBank;
use crate::spectrometer::{SpectrometerBank, SpectrometerStatus};
use crate::spectrum::{SpectraList, Spectrum};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{mpsc, Arc};
use std::time::{Duration, Instant};
use tracing::{debug, error, info, warn};

const SETTLE: Duration = Duration::from_millis(100);

enum Directive {
    Job(ControlTask),
    Abort,
    Shutdown,
}

pub(super) struct ControlWorker {
    datadir: DataDir,
    shutters: ShutterBank,
    spectrometers: SpectrometerBank,
    tasks: mpsc::Receiver<ControlTask>,
    busy: Arc<AtomicBool>,
    paused: Arc<AtomicBool>,
    info: tokio::sync::mpsc::UnboundedSender<ControlEvent>,
    writer: mpsc::Sender<WriterMsg>,
    shutdown: bool,
}

impl ControlWorker {
    #[allow(clippy::too_many_arguments)]
    pub(super) fn new(
        datadir: DataDir,
        shutters: ShutterBank,
        spectrometers: SpectrometerBank,
        tasks: mpsc::Receiver<ControlTask>,
        busy: Arc<AtomicBool>,
        paused: Arc<AtomicBool>,
        info: tokio::sync::mpsc::UnboundedSender<ControlEvent>,
        writer: mpsc::Sender<WriterMsg>,
    ) -> Self {
        Self {
            datadir,
            shutters,
            spectrometers,
            tasks,
            busy,
            paused,
            info,
            writer,
            shutdown: false,
        }
    }

    pub(super) fn run(mut self) {
        loop {
            let directive = match self.next(true) {
                Some(d) => d,
                None => continue,
            };
            match directive {
                Directive::Shutdown => break,
                Directive::Abort => continue,
                Directive::Job(task) => {
                    self.busy.store(true, Ordering::SeqCst);
                    self.process(task);
                    self.update_status("idle");
                    self.busy.store(false, Ordering::SeqCst);
                    if self.shutdown {
                        break;
                    }
                }
            }
        }
        let _ = self.writer.send(WriterMsg::Shutdown);
        info!("stopped control worker");
    }

    fn process(&mut self, task: ControlTask) {
        match task {
            ControlTask::Record {
                run,
                nsequence,
                auto,
                delay,
                target,
                reply,
            } => {
                let _ = reply.send(Ok(()));
                if let Err(e) = self.record_sequence(&run, nsequence, auto, delay, target) {
                    error!("{e}");
                }
            }
            ControlTask::Dark { run, reply } => {
                let _ = reply.send(Ok(()));
                if let Err(e) = self.record_dark(&run, None, 0) {
                    error!("{e}");
                }
            }
            ControlTask::Autointegrate { target, reply } => {
                let _ = reply.send(Ok(()));
                self.autointegrate(target);
            }
            ControlTask::Abort | ControlTask::Pause | ControlTask::Shutdown => {}
        }
    }

    // ------------------------------------------------------------------
    // Command intake
    // ------------------------------------------------------------------

    fn next(&mut self, blocking: bool) -> Option<Directive> {
        let task = if blocking {
            match self.tasks.recv() {
                Ok(t) => t,
                Err(_) => return Some(Directive::Shutdown),
            }
        } else {
            match self.tasks.try_recv() {
                Ok(t) => t,
                Err(mpsc::TryRecvError::Empty) => return None,
                Err(mpsc::TryRecvError::Disconnected) => return Some(Directive::Shutdown),
            }
        };
        match task {
            ControlTask::Shutdown => Some(Directive::Shutdown),
            ControlTask::Abort => {
                if self.busy.load(Ordering::SeqCst) {
                    info!("aborted acquisition");
                    Some(Directive::Abort)
                } else {
                    warn!("abort called but not busy");
                    None
                }
            }
            ControlTask::Pause => self.enter_pause(),
            job => Some(Directive::Job(job)),
        }
    }

    /// Park until unpaused. A second `pause` resumes; `abort` and shutdown
    /// fall through to the caller.
    fn enter_pause(&mut self) -> Option<Directive> {
        if self.paused.load(Ordering::SeqCst) {
            info!("unpause acquisition");
            self.paused.store(false, Ordering::SeqCst);
            return None;
        }
        info!("pause acquisition");
        self.paused.store(true, Ordering::SeqCst);
        self.update_status("paused");
        loop {
            match self.tasks.recv() {
                Err(_) | Ok(ControlTask::Shutdown) => {
                    self.paused.store(false, Ordering::SeqCst);
                    return Some(Directive::Shutdown);
                }
                Ok(ControlTask::Abort) => {
                    self.paused.store(false, Ordering::SeqCst);
                    info!("aborted acquisition");
                    return Some(Directive::Abort);
                }
                Ok(ControlTask::Pause) => {
                    self.paused.store(false, Ordering::SeqCst);
                    info!("unpause acquisition");
                    return None;
                }
                Ok(ControlTask::Record { reply, .. })
                | Ok(ControlTask::Dark { reply, .. })
                | Ok(ControlTask::Autointegrate { reply, .. }) => {
                    warn!("acquisition paused");
                    let _ = reply.send(Err(PiccoloError::Busy(
                        "piccolo system".to_string(),
                        "paused".to_string(),
                    )));
                }
            }
        }
    }

    /// Non-blocking poll for abort/shutdown at a yield point.
    fn interrupted(&mut self) -> bool {
        match self.next(false) {
            Some(Directive::Abort) => true,
            Some(Directive::Shutdown) => {
                self.shutdown = true;
                true
            }
            _ => false,
        }
    }

    /// Sleep out the inter-sequence delay in slices, honouring interrupts.
    fn wait_delay(&mut self, seconds: f64) -> bool {
        let deadline = Instant::now() + Duration::from_secs_f64(seconds.max(0.0));
        loop {
            let now = Instant::now();
            if now >= deadline {
                return false;
            }
            if self.interrupted() {
                return true;
            }
            std::thread::sleep(SETTLE.min(deadline - now));
        }
    }

    fn update_status(&self, status: &str) {
        let _ = self.info.send(ControlEvent::Status(status.to_string()));
    }

    fn update_sequence(&self, sequence: i64) {
        let _ = self.info.send(ControlEvent::Sequence(sequence));
    }

    // ------------------------------------------------------------------
    // Primitives
    // ------------------------------------------------------------------

    /// Record one frame per spectrometer through `channel`. For a light
    /// frame only the channel's shutter is open; dark frames keep all
    /// shutters closed. Failed spectrometers are skipped with a warning.
    fn record(&mut self, channel: &str, dark: bool) -> Vec<Spectrum> {
        debug!(channel, dark, "recording");
        let kind = if dark { "dark" } else { "light" };
        self.update_status(&format!("{channel} {kind}"));
        for shutter in self.shutters.iter() {
            if !dark && shutter.name() == channel {
                if let Err(e) = shutter.open() {
                    warn!("{e}");
                }
            } else {
                let _ = shutter.close();
            }
        }
        for spec in self.spectrometers.iter() {
            if let Err(e) = spec.start_acquisition(channel, dark) {
                warn!(spectrometer = %spec.name(), "{e}");
            }
        }
        // Give the integrations a moment to start.
        std::thread::sleep(SETTLE);
        let mut spectra = Vec::new();
        for spec in self.spectrometers.iter() {
            match spec.get_spectrum() {
                Ok(s) => spectra.push(s),
                Err(e) => warn!(spectrometer = %spec.name(), "{e}"),
            }
        }
        if let Ok(shutter) = self.shutters.get(channel) {
            let _ = shutter.close();
        }
        spectra
    }

    fn record_dark(&mut self, run_name: &str, batch: Option<i64>, sequence: i64) -> Result<()> {
        let run = self.datadir.run(run_name)?;
        let batch = batch.unwrap_or_else(|| run.next_batch());
        info!(run = run_name, batch, sequence, "record dark");
        let mut spectra = SpectraList::new(run_name, batch, sequence);
        for name in self.shutters.names() {
            for s in self.record(&name, true) {
                spectra.push(s);
            }
        }
        let _ = self.writer.send(WriterMsg::Write(spectra));
        Ok(())
    }

    fn record_sequence(
        &mut self,
        run_name: &str,
        nsequence: i64,
        auto: i64,
        delay: f64,
        target: f64,
    ) -> Result<()> {
        let run = self.datadir.run(run_name)?;
        let batch = run.next_batch();
        info!(run = run_name, batch, nsequence, "start recording batch");

        self.update_sequence(-1);

        if auto == 0 {
            self.autointegrate(target);
            if self.interrupted() {
                return Ok(());
            }
        }
        if auto < 1 {
            self.record_dark(run_name, Some(batch), 0)?;
        }

        for sequence in 0..nsequence {
            if auto > 0 && sequence % auto == 0 {
                self.autointegrate(target);
                if self.interrupted() {
                    return Ok(());
                }
                self.record_dark(run_name, Some(batch), sequence)?;
                if self.interrupted() {
                    return Ok(());
                }
            }

            if self.interrupted() {
                return Ok(());
            }
            info!(run = run_name, batch, sequence, "recording sequence");
            self.update_sequence(sequence);
            let mut spectra = SpectraList::new(run_name, batch, sequence);
            for name in self.shutters.names() {
                for s in self.record(&name, false) {
                    spectra.push(s);
                }
            }
            let _ = self.writer.send(WriterMsg::Write(spectra));

            if self.interrupted() {
                return Ok(());
            }
            self.update_status("waiting");
            if self.wait_delay(delay) {
                return Ok(());
            }
        }

        if nsequence > 1 {
            self.record_dark(run_name, Some(batch), nsequence - 1)?;
        }
        Ok(())
    }

    /// Autointegrate every spectrometer against every shutter in turn.
    fn autointegrate(&mut self, target: f64) {
        debug!(target, "autointegrate");
        self.shutters.close_all();
        for name in self.shutters.names() {
            self.update_status(&format!("autointegrate {name}"));
            if let Err(e) = self.shutters.get(&name).and_then(|s| s.open()) {
                warn!("{e}");
            }
            for spec in self.spectrometers.iter() {
                if let Err(e) = spec.autointegrate(&name, target) {
                    warn!(spectrometer = %spec.name(), "{e}");
                }
            }
            std::thread::sleep(SETTLE);
            for spec in self.spectrometers.iter() {
                while spec.is_busy()
                    || spec.status() == SpectrometerStatus::Autointegrating
                {
                    std::thread::sleep(SETTLE);
                }
            }
            if let Ok(shutter) = self.shutters.get(&name) {
                let _ = shutter.close();
            }
        }
    }
}
