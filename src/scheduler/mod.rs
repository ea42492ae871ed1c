//! Persistent acquisition scheduler.
//!
//! Jobs live in an embedded SQLite database and survive restarts. The
//! controller polls [`Scheduler::runnable_jobs`] roughly once a second while
//! idle; each call yields the payloads that should run now, applies the
//! quiet-time gate, advances repeating jobs (collapsing missed intervals
//! into a single fast-forward) and emits the synthetic power-off/power-on
//! jobs at the edges of the power window.

pub(crate) mod store;

use crate::error::{PiccoloError, Result};
use crate::notify::Notifier;
use crate::resource::{Call, Site};
use chrono::{DateTime, Duration, NaiveTime, Timelike, Utc};
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use serde_json::json;
use std::path::Path;
use std::sync::Arc;
use tracing::{info, warn};

pub use store::{parse_datetime, parse_time_of_day};

/// Default seconds between the quiet-window edges and the power edges.
const DEFAULT_POWER_DELAY: i64 = 600;
const DEFAULT_QUIET_START: (u32, u32) = (22, 0);
const DEFAULT_QUIET_END: (u32, u32) = (4, 0);

/// What a scheduled job asks the controller to do.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(tag = "action", rename_all = "snake_case")]
pub enum JobPayload {
    Record {
        run: String,
        nsequence: i64,
        auto: i64,
        delay: f64,
        target: f64,
    },
    Dark {
        run: String,
    },
    Autointegrate {
        target: f64,
    },
    PowerOff,
    PowerOn,
}

/// Lifecycle of a stored job. Deleted jobs stay in the table as tombstones.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum JobStatus {
    Active,
    Suspended,
    Done,
    Deleted,
}

impl JobStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            JobStatus::Active => "active",
            JobStatus::Suspended => "suspended",
            JobStatus::Done => "done",
            JobStatus::Deleted => "deleted",
        }
    }

    pub fn parse(s: &str) -> Result<Self> {
        match s {
            "active" => Ok(JobStatus::Active),
            "suspended" => Ok(JobStatus::Suspended),
            "done" => Ok(JobStatus::Done),
            "deleted" => Ok(JobStatus::Deleted),
            other => Err(PiccoloError::invalid(format!("unknown job status {other}"))),
        }
    }
}

/// One stored job.
#[derive(Clone, Debug)]
pub struct ScheduledJob {
    pub id: i64,
    pub payload: JobPayload,
    pub start_time: DateTime<Utc>,
    pub next_time: DateTime<Utc>,
    pub end_time: Option<DateTime<Utc>>,
    pub interval: Option<Duration>,
    pub ignore_quiet_time: bool,
    pub status: JobStatus,
}

#[derive(Default)]
struct EdgeState {
    logged_quiet: bool,
    in_power_off: bool,
    warned_short_window: bool,
}

#[derive(Clone, Default)]
struct Notifiers {
    jobs: Notifier,
    quiet_time_enabled: Notifier,
    quiet_start: Notifier,
    quiet_end: Notifier,
    power_off_enabled: Notifier,
    power_delay: Notifier,
}

struct SchedulerInner {
    store: store::Store,
    edge: Mutex<EdgeState>,
    notifiers: Notifiers,
}

/// Handle to the scheduler; clones share the database.
#[derive(Clone)]
pub struct Scheduler {
    inner: Arc<SchedulerInner>,
}

impl Scheduler {
    pub fn open(path: &Path) -> Result<Self> {
        Ok(Self::with_store(store::Store::open(path)?))
    }

    /// An unpersisted scheduler; used by tests.
    pub fn in_memory() -> Result<Self> {
        Ok(Self::with_store(store::Store::in_memory()?))
    }

    fn with_store(store: store::Store) -> Self {
        Self {
            inner: Arc::new(SchedulerInner {
                store,
                edge: Mutex::new(EdgeState::default()),
                notifiers: Notifiers::default(),
            }),
        }
    }

    pub fn jobs_changed(&self) -> &Notifier {
        &self.inner.notifiers.jobs
    }

    // ------------------------------------------------------------------
    // Settings
    // ------------------------------------------------------------------

    pub fn quiet_time_enabled(&self) -> Result<bool> {
        Ok(self
            .inner
            .store
            .get_setting("quiet_time_enabled")?
            .map(|v| v.eq_ignore_ascii_case("true"))
            .unwrap_or(false))
    }

    pub fn set_quiet_time_enabled(&self, enabled: bool) -> Result<()> {
        self.inner
            .store
            .set_setting("quiet_time_enabled", if enabled { "True" } else { "False" })?;
        self.inner.notifiers.quiet_time_enabled.notify();
        Ok(())
    }

    pub fn power_off_enabled(&self) -> Result<bool> {
        Ok(self
            .inner
            .store
            .get_setting("power_off_enabled")?
            .map(|v| v.eq_ignore_ascii_case("true"))
            .unwrap_or(false))
    }

    pub fn set_power_off_enabled(&self, enabled: bool) -> Result<()> {
        self.inner
            .store
            .set_setting("power_off_enabled", if enabled { "True" } else { "False" })?;
        self.inner.notifiers.power_off_enabled.notify();
        Ok(())
    }

    /// Seconds between the quiet-window edges and the power edges.
    pub fn power_delay(&self) -> Result<i64> {
        Ok(self
            .inner
            .store
            .get_setting("power_delay")?
            .and_then(|v| v.parse().ok())
            .unwrap_or(DEFAULT_POWER_DELAY))
    }

    pub fn set_power_delay(&self, seconds: i64) -> Result<()> {
        if seconds < 0 {
            return Err(PiccoloError::invalid("power delay must be >= 0"));
        }
        self.inner
            .store
            .set_setting("power_delay", &seconds.to_string())?;
        self.inner.notifiers.power_delay.notify();
        Ok(())
    }

    pub fn quiet_start(&self) -> Result<NaiveTime> {
        Ok(self
            .inner
            .store
            .get_quiet_time("start")?
            .unwrap_or_else(|| hm(DEFAULT_QUIET_START)))
    }

    pub fn set_quiet_start(&self, t: NaiveTime) -> Result<()> {
        self.inner.store.set_quiet_time("start", t)?;
        self.inner.notifiers.quiet_start.notify();
        Ok(())
    }

    pub fn quiet_end(&self) -> Result<NaiveTime> {
        Ok(self
            .inner
            .store
            .get_quiet_time("end")?
            .unwrap_or_else(|| hm(DEFAULT_QUIET_END)))
    }

    pub fn set_quiet_end(&self, t: NaiveTime) -> Result<()> {
        self.inner.store.set_quiet_time("end", t)?;
        self.inner.notifiers.quiet_end.notify();
        Ok(())
    }

    // ------------------------------------------------------------------
    // Quiet and power windows
    // ------------------------------------------------------------------

    /// Whether `now` falls inside the quiet window `[start, end)`,
    /// wrapping across midnight when start > end.
    pub fn in_quiet_time(&self, now: DateTime<Utc>) -> Result<bool> {
        if !self.quiet_time_enabled()? {
            return Ok(false);
        }
        let t = now.time();
        let start = self.quiet_start()?;
        let end = self.quiet_end()?;
        Ok(if start <= end {
            start <= t && t < end
        } else {
            t >= start || t < end
        })
    }

    /// Seconds of quiet window elapsed at `now`, when inside it.
    fn quiet_elapsed(&self, now: DateTime<Utc>) -> Result<Option<i64>> {
        if !self.in_quiet_time(now)? {
            return Ok(None);
        }
        let start = self.quiet_start()?.num_seconds_from_midnight() as i64;
        let t = now.time().num_seconds_from_midnight() as i64;
        Ok(Some((t - start).rem_euclid(86_400)))
    }

    /// Length of the quiet window in seconds, wrap-aware.
    fn quiet_window_secs(&self) -> Result<i64> {
        let start = self.quiet_start()?.num_seconds_from_midnight() as i64;
        let end = self.quiet_end()?.num_seconds_from_midnight() as i64;
        Ok((end - start).rem_euclid(86_400))
    }

    // ------------------------------------------------------------------
    // Job management
    // ------------------------------------------------------------------

    /// Add a job. One-shot jobs in the past and jobs whose end already
    /// passed are rejected as a no-op (`Ok(None)`).
    pub fn add(
        &self,
        start_time: DateTime<Utc>,
        payload: JobPayload,
        interval: Option<Duration>,
        end_time: Option<DateTime<Utc>>,
        ignore_quiet_time: bool,
    ) -> Result<Option<i64>> {
        let now = Utc::now();
        if let Some(i) = interval {
            if i <= Duration::zero() {
                return Err(PiccoloError::invalid("interval must be positive"));
            }
        }
        if interval.is_none() && start_time < now {
            warn!("not scheduling one-shot job in the past");
            return Ok(None);
        }
        if end_time.is_some_and(|e| e < now) {
            warn!("not scheduling job whose end time has passed");
            return Ok(None);
        }
        let id = self.inner.store.insert_job(
            &payload,
            start_time,
            end_time,
            interval,
            ignore_quiet_time,
        )?;
        info!(id, "scheduled job");
        self.inner.notifiers.jobs.notify();
        Ok(Some(id))
    }

    pub fn job(&self, id: i64) -> Result<Option<ScheduledJob>> {
        self.inner.store.job(id)
    }

    pub fn jobs(&self) -> Result<Vec<ScheduledJob>> {
        self.inner.store.all_jobs()
    }

    /// Promote jobs that can no longer run to done. Runs before every
    /// mutation.
    pub fn check_done(&self) -> Result<()> {
        if self.inner.store.mark_expired_done()? > 0 {
            self.inner.notifiers.jobs.notify();
        }
        Ok(())
    }

    /// active -> suspended; idempotent.
    pub fn suspend(&self, id: i64) -> Result<bool> {
        self.check_done()?;
        let changed =
            self.inner
                .store
                .set_status(id, &[JobStatus::Active], JobStatus::Suspended)?;
        if changed {
            info!(id, "suspended job");
            self.inner.notifiers.jobs.notify();
        }
        Ok(changed)
    }

    /// suspended -> active; idempotent.
    pub fn unsuspend(&self, id: i64) -> Result<bool> {
        self.check_done()?;
        let changed =
            self.inner
                .store
                .set_status(id, &[JobStatus::Suspended], JobStatus::Active)?;
        if changed {
            info!(id, "unsuspended job");
            self.inner.notifiers.jobs.notify();
        }
        Ok(changed)
    }

    /// active|suspended -> deleted; idempotent. The tombstone remains
    /// visible in job listings.
    pub fn delete(&self, id: i64) -> Result<bool> {
        self.check_done()?;
        let changed = self.inner.store.set_status(
            id,
            &[JobStatus::Active, JobStatus::Suspended],
            JobStatus::Deleted,
        )?;
        if changed {
            info!(id, "deleted job");
            self.inner.notifiers.jobs.notify();
        }
        Ok(changed)
    }

    // ------------------------------------------------------------------
    // Runnable iteration
    // ------------------------------------------------------------------

    /// Yield the payloads that should run at `now` and advance the stored
    /// jobs. Each job is yielded at most once per call.
    pub fn runnable_jobs(&self, now: DateTime<Utc>) -> Result<Vec<JobPayload>> {
        let mut out = Vec::new();
        let in_quiet = self.in_quiet_time(now)?;

        {
            let mut edge = self.inner.edge.lock();
            if in_quiet && !edge.logged_quiet {
                info!("quiet time started, holding ordinary jobs");
                edge.logged_quiet = true;
            } else if !in_quiet && edge.logged_quiet {
                info!("quiet time stopped, scheduling jobs again");
                edge.logged_quiet = false;
            }
        }

        self.poll_power_window(now, &mut out)?;

        let mut advanced = false;
        for job in self.inner.store.due_jobs(now)? {
            if job.status == JobStatus::Active && (job.ignore_quiet_time || !in_quiet) {
                info!(id = job.id, "running scheduled job");
                out.push(job.payload.clone());
            }
            // Advance regardless of whether the job was yielded: runs held
            // back by quiet time or suspension are skipped, not queued.
            match job.interval {
                None => {
                    self.inner
                        .store
                        .set_status(job.id, &[job.status], JobStatus::Done)?;
                    advanced = true;
                }
                Some(interval) => {
                    let behind = (now - job.next_time).num_milliseconds() as f64;
                    let n = (behind / interval.num_milliseconds() as f64).floor() as i64 + 1;
                    if n > 1 {
                        info!(id = job.id, n, "fast forwarding job");
                    }
                    let next = job.next_time + interval * (n as i32);
                    self.inner.store.set_next_time(job.id, next)?;
                    advanced = true;
                    let expired = job
                        .end_time
                        .is_some_and(|end| next > end || end < now);
                    if expired {
                        info!(id = job.id, "job has expired");
                        self.inner
                            .store
                            .set_status(job.id, &[job.status], JobStatus::Done)?;
                    }
                }
            }
        }
        if advanced {
            self.inner.notifiers.jobs.notify();
        }
        Ok(out)
    }

    /// Emit the synthetic power jobs at the edges of the power sub-window.
    fn poll_power_window(&self, now: DateTime<Utc>, out: &mut Vec<JobPayload>) -> Result<()> {
        let mut edge = self.inner.edge.lock();
        if !(self.quiet_time_enabled()? && self.power_off_enabled()?) {
            // Leaving the feature disabled mid-window must still power
            // back on.
            if edge.in_power_off {
                edge.in_power_off = false;
                out.push(JobPayload::PowerOn);
            }
            return Ok(());
        }
        let delay = self.power_delay()?;
        let window = self.quiet_window_secs()?;
        if window < 2 * delay {
            if !edge.warned_short_window {
                warn!(
                    window,
                    delay, "quiet window too short for power-off, disabling"
                );
                edge.warned_short_window = true;
            }
            return Ok(());
        }
        edge.warned_short_window = false;
        let in_off = match self.quiet_elapsed(now)? {
            Some(elapsed) => elapsed >= delay && elapsed <= window - delay,
            None => false,
        };
        if in_off && !edge.in_power_off {
            edge.in_power_off = true;
            info!("entering power-off window");
            out.push(JobPayload::PowerOff);
        } else if !in_off && edge.in_power_off {
            edge.in_power_off = false;
            info!("leaving power-off window");
            out.push(JobPayload::PowerOn);
        }
        Ok(())
    }

    // ------------------------------------------------------------------
    // Endpoints
    // ------------------------------------------------------------------

    /// Endpoint tree for the scheduler, mounted below the controller.
    pub fn resources(&self) -> Site {
        let mut site = Site::new();
        let s = self.clone();
        site.at("jobs")
            .get(move |_| {
                let s = s.clone();
                async move {
                    let rows: Vec<_> = s
                        .jobs()?
                        .into_iter()
                        .map(|j| {
                            json!([
                                j.id,
                                j.payload,
                                j.start_time.to_rfc3339(),
                                j.next_time.to_rfc3339(),
                                j.end_time.map(|t| t.to_rfc3339()),
                                j.interval.map(|i| i.num_milliseconds() as f64 / 1000.0),
                                j.ignore_quiet_time,
                                j.status.as_str(),
                            ])
                        })
                        .collect();
                    Ok(json!(rows))
                }
            })
            .observable(self.inner.notifiers.jobs.clone())
            .register();
        let s = self.clone();
        let s2 = self.clone();
        site.at("quietTimeEnabled")
            .get(move |_| {
                let s = s.clone();
                async move { Ok(json!(s.quiet_time_enabled()?)) }
            })
            .put(move |call: Call| {
                let s = s2.clone();
                async move {
                    let enabled: bool = call.require(0, "e")?;
                    s.set_quiet_time_enabled(enabled)?;
                    Ok(json!(s.quiet_time_enabled()?))
                }
            })
            .observable(self.inner.notifiers.quiet_time_enabled.clone())
            .register();
        let s = self.clone();
        let s2 = self.clone();
        site.at("quietStart")
            .get(move |_| {
                let s = s.clone();
                async move { Ok(json!(s.quiet_start()?.format("%H:%M:%S").to_string())) }
            })
            .put(move |call: Call| {
                let s = s2.clone();
                async move {
                    let t: String = call.require(0, "t")?;
                    s.set_quiet_start(parse_time_of_day(&t)?)?;
                    Ok(json!(s.quiet_start()?.format("%H:%M:%S").to_string()))
                }
            })
            .observable(self.inner.notifiers.quiet_start.clone())
            .register();
        let s = self.clone();
        let s2 = self.clone();
        site.at("quietEnd")
            .get(move |_| {
                let s = s.clone();
                async move { Ok(json!(s.quiet_end()?.format("%H:%M:%S").to_string())) }
            })
            .put(move |call: Call| {
                let s = s2.clone();
                async move {
                    let t: String = call.require(0, "t")?;
                    s.set_quiet_end(parse_time_of_day(&t)?)?;
                    Ok(json!(s.quiet_end()?.format("%H:%M:%S").to_string()))
                }
            })
            .observable(self.inner.notifiers.quiet_end.clone())
            .register();
        let s = self.clone();
        let s2 = self.clone();
        site.at("powerOffEnabled")
            .get(move |_| {
                let s = s.clone();
                async move { Ok(json!(s.power_off_enabled()?)) }
            })
            .put(move |call: Call| {
                let s = s2.clone();
                async move {
                    let enabled: bool = call.require(0, "e")?;
                    s.set_power_off_enabled(enabled)?;
                    Ok(json!(s.power_off_enabled()?))
                }
            })
            .observable(self.inner.notifiers.power_off_enabled.clone())
            .register();
        let s = self.clone();
        let s2 = self.clone();
        site.at("powerDelay")
            .get(move |_| {
                let s = s.clone();
                async move { Ok(json!(s.power_delay()?)) }
            })
            .put(move |call: Call| {
                let s = s2.clone();
                async move {
                    let seconds: i64 = call.require(0, "delay")?;
                    s.set_power_delay(seconds)?;
                    Ok(json!(s.power_delay()?))
                }
            })
            .observable(self.inner.notifiers.power_delay.clone())
            .register();
        let s = self.clone();
        site.at("suspend")
            .put(move |call: Call| {
                let s = s.clone();
                async move {
                    let id: i64 = call.require(0, "jid")?;
                    Ok(json!(s.suspend(id)?))
                }
            })
            .register();
        let s = self.clone();
        site.at("unsuspend")
            .put(move |call: Call| {
                let s = s.clone();
                async move {
                    let id: i64 = call.require(0, "jid")?;
                    Ok(json!(s.unsuspend(id)?))
                }
            })
            .register();
        let s = self.clone();
        site.at("delete")
            .put(move |call: Call| {
                let s = s.clone();
                async move {
                    let id: i64 = call.require(0, "jid")?;
                    Ok(json!(s.delete(id)?))
                }
            })
            .register();
        site
    }
}

fn hm((h, m): (u32, u32)) -> NaiveTime {
    NaiveTime::from_hms_opt(h, m, 0).unwrap_or(NaiveTime::MIN)
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    fn at(h: u32, m: u32) -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2026, 8, 1, h, m, 0).single().unwrap()
    }

    fn record_payload() -> JobPayload {
        JobPayload::Record {
            run: "R1".into(),
            nsequence: 1,
            auto: -1,
            delay: 0.0,
            target: 80.0,
        }
    }

    #[test]
    fn test_quiet_window_wraps_midnight() {
        let s = Scheduler::in_memory().unwrap();
        s.set_quiet_time_enabled(true).unwrap();
        s.set_quiet_start(hm((22, 0))).unwrap();
        s.set_quiet_end(hm((4, 0))).unwrap();
        assert!(s.in_quiet_time(at(23, 0)).unwrap());
        assert!(s.in_quiet_time(at(3, 0)).unwrap());
        assert!(!s.in_quiet_time(at(5, 0)).unwrap());
        assert!(s.in_quiet_time(at(22, 0)).unwrap());
        assert!(!s.in_quiet_time(at(4, 0)).unwrap());
    }

    #[test]
    fn test_quiet_window_same_day() {
        let s = Scheduler::in_memory().unwrap();
        s.set_quiet_time_enabled(true).unwrap();
        s.set_quiet_start(hm((8, 0))).unwrap();
        s.set_quiet_end(hm((17, 0))).unwrap();
        assert!(s.in_quiet_time(at(12, 0)).unwrap());
        assert!(!s.in_quiet_time(at(18, 0)).unwrap());
        assert!(!s.in_quiet_time(at(7, 59)).unwrap());
    }

    #[test]
    fn test_one_shot_in_the_past_is_rejected() {
        let s = Scheduler::in_memory().unwrap();
        let id = s
            .add(
                Utc::now() - Duration::seconds(5),
                record_payload(),
                None,
                None,
                false,
            )
            .unwrap();
        assert_eq!(id, None);
        assert!(s.jobs().unwrap().is_empty());
        // Expired end time is also rejected.
        let id = s
            .add(
                Utc::now() + Duration::seconds(5),
                record_payload(),
                Some(Duration::seconds(1)),
                Some(Utc::now() - Duration::seconds(1)),
                false,
            )
            .unwrap();
        assert_eq!(id, None);
    }

    #[test]
    fn test_fast_forward_advance() {
        let s = Scheduler::in_memory().unwrap();
        let now = Utc::now();
        let id = s
            .add(
                now - Duration::seconds(35),
                record_payload(),
                Some(Duration::seconds(10)),
                Some(now + Duration::seconds(60)),
                false,
            )
            .unwrap()
            .unwrap();
        let jobs = s.runnable_jobs(now).unwrap();
        assert_eq!(jobs.len(), 1);
        let job = s.job(id).unwrap().unwrap();
        // floor(35/10)+1 = 4 intervals: next_time lands at now + 5 s.
        assert_eq!(job.next_time, now - Duration::seconds(35) + Duration::seconds(40));
        assert_eq!(job.status, JobStatus::Active);
        // The advance is a whole multiple of the interval.
        let advanced = job.next_time - job.start_time;
        assert_eq!(advanced.num_seconds() % 10, 0);
        // Nothing more to run right away.
        assert!(s.runnable_jobs(now).unwrap().is_empty());
    }

    #[test]
    fn test_one_shot_runs_once() {
        let s = Scheduler::in_memory().unwrap();
        let now = Utc::now();
        let id = s
            .add(now + Duration::seconds(2), record_payload(), None, None, false)
            .unwrap()
            .unwrap();
        let later = now + Duration::seconds(5);
        assert_eq!(s.runnable_jobs(later).unwrap().len(), 1);
        assert_eq!(s.job(id).unwrap().unwrap().status, JobStatus::Done);
        // Done jobs are never yielded again.
        assert!(s.runnable_jobs(later + Duration::seconds(1)).unwrap().is_empty());
    }

    #[test]
    fn test_quiet_time_gate_and_ignore_flag() {
        let s = Scheduler::in_memory().unwrap();
        s.set_quiet_time_enabled(true).unwrap();
        s.set_quiet_start(hm((22, 0))).unwrap();
        s.set_quiet_end(hm((4, 0))).unwrap();
        let now = at(23, 30);
        let held = s
            .add(
                now - Duration::seconds(5),
                JobPayload::Dark { run: "held".into() },
                Some(Duration::seconds(3600)),
                None,
                false,
            )
            .unwrap()
            .unwrap();
        s.add(
            now - Duration::seconds(5),
            JobPayload::Dark { run: "runs".into() },
            Some(Duration::seconds(3600)),
            None,
            true,
        )
        .unwrap()
        .unwrap();
        let jobs = s.runnable_jobs(now).unwrap();
        assert_eq!(jobs, vec![JobPayload::Dark { run: "runs".into() }]);
        // The held job advanced anyway: the missed run is skipped.
        assert!(s.job(held).unwrap().unwrap().next_time > now);
    }

    #[test]
    fn test_suspended_jobs_not_yielded() {
        let s = Scheduler::in_memory().unwrap();
        let now = Utc::now();
        let id = s
            .add(
                now - Duration::seconds(1),
                record_payload(),
                Some(Duration::seconds(10)),
                None,
                false,
            )
            .unwrap()
            .unwrap();
        assert!(s.suspend(id).unwrap());
        // Idempotent: suspending again changes nothing.
        assert!(!s.suspend(id).unwrap());
        assert!(s.runnable_jobs(now).unwrap().is_empty());
        assert!(s.unsuspend(id).unwrap());
        assert!(!s.unsuspend(id).unwrap());
        assert!(s.delete(id).unwrap());
        assert!(!s.delete(id).unwrap());
        assert_eq!(s.job(id).unwrap().unwrap().status, JobStatus::Deleted);
    }

    #[test]
    fn test_power_window_edges() {
        let s = Scheduler::in_memory().unwrap();
        s.set_quiet_time_enabled(true).unwrap();
        s.set_quiet_start(hm((22, 0))).unwrap();
        s.set_quiet_end(hm((4, 0))).unwrap();
        s.set_power_off_enabled(true).unwrap();
        s.set_power_delay(600).unwrap();
        // Before the power window: nothing.
        assert!(s.runnable_jobs(at(22, 5)).unwrap().is_empty());
        // Crossing in yields power_off exactly once.
        assert_eq!(
            s.runnable_jobs(at(22, 30)).unwrap(),
            vec![JobPayload::PowerOff]
        );
        assert!(s.runnable_jobs(at(23, 0)).unwrap().is_empty());
        // Crossing out (end - delay) yields power_on once.
        assert_eq!(
            s.runnable_jobs(at(3, 55)).unwrap(),
            vec![JobPayload::PowerOn]
        );
        assert!(s.runnable_jobs(at(3, 56)).unwrap().is_empty());
    }

    #[test]
    fn test_power_window_too_short() {
        let s = Scheduler::in_memory().unwrap();
        s.set_quiet_time_enabled(true).unwrap();
        s.set_quiet_start(hm((22, 0))).unwrap();
        s.set_quiet_end(hm((22, 15))).unwrap();
        s.set_power_off_enabled(true).unwrap();
        s.set_power_delay(600).unwrap();
        // 15-minute window cannot hold 2 x 10 minutes.
        assert!(s.runnable_jobs(at(22, 10)).unwrap().is_empty());
    }

    #[test]
    fn test_check_done_promotes_expired() {
        let s = Scheduler::in_memory().unwrap();
        let now = Utc::now();
        let id = s
            .add(
                now - Duration::seconds(30),
                record_payload(),
                Some(Duration::seconds(10)),
                Some(now + Duration::seconds(5)),
                false,
            )
            .unwrap()
            .unwrap();
        // Drains the backlog; next_time jumps past end_time.
        s.runnable_jobs(now).unwrap();
        assert_eq!(s.job(id).unwrap().unwrap().status, JobStatus::Done);
    }
}
