//! SQLite persistence for the scheduler.
//!
//! Three tables: `settings` (string key/value), `quiettime` (labelled
//! times of day) and `jobs`. Timestamps are stored as RFC 3339 strings in
//! UTC, intervals as fractional seconds, and enumerations by name so the
//! schema stays readable and forward compatible.

use super::{JobPayload, JobStatus, ScheduledJob};
use crate::error::{PiccoloError, Result};
use chrono::{DateTime, Duration, NaiveTime, Utc};
use parking_lot::Mutex;
use rusqlite::Connection;
use std::path::Path;

pub(crate) struct Store {
    conn: Mutex<Connection>,
}

const SCHEMA: &str = "
CREATE TABLE IF NOT EXISTS settings (
    key   TEXT PRIMARY KEY,
    value TEXT NOT NULL
);
CREATE TABLE IF NOT EXISTS quiettime (
    label TEXT PRIMARY KEY,
    time  TEXT NOT NULL
);
CREATE TABLE IF NOT EXISTS jobs (
    id                INTEGER PRIMARY KEY AUTOINCREMENT,
    job               TEXT NOT NULL,
    start_time        TEXT NOT NULL,
    next_time         TEXT NOT NULL,
    end_time          TEXT,
    interval_secs     REAL,
    ignore_quiet_time INTEGER NOT NULL DEFAULT 0,
    status            TEXT NOT NULL DEFAULT 'active'
);
";

impl Store {
    pub fn open(path: &Path) -> Result<Self> {
        Self::from_connection(Connection::open(path)?)
    }

    pub fn in_memory() -> Result<Self> {
        Self::from_connection(Connection::open_in_memory()?)
    }

    fn from_connection(conn: Connection) -> Result<Self> {
        conn.execute_batch(SCHEMA)?;
        Ok(Self {
            conn: Mutex::new(conn),
        })
    }

    // ------------------------------------------------------------------
    // Settings and quiet times
    // ------------------------------------------------------------------

    pub fn get_setting(&self, key: &str) -> Result<Option<String>> {
        let conn = self.conn.lock();
        let mut stmt = conn.prepare("SELECT value FROM settings WHERE key = ?1")?;
        let mut rows = stmt.query([key])?;
        match rows.next()? {
            Some(row) => Ok(Some(row.get(0)?)),
            None => Ok(None),
        }
    }

    pub fn set_setting(&self, key: &str, value: &str) -> Result<()> {
        self.conn.lock().execute(
            "INSERT INTO settings (key, value) VALUES (?1, ?2)
             ON CONFLICT(key) DO UPDATE SET value = excluded.value",
            [key, value],
        )?;
        Ok(())
    }

    pub fn get_quiet_time(&self, label: &str) -> Result<Option<NaiveTime>> {
        let conn = self.conn.lock();
        let mut stmt = conn.prepare("SELECT time FROM quiettime WHERE label = ?1")?;
        let mut rows = stmt.query([label])?;
        match rows.next()? {
            Some(row) => {
                let text: String = row.get(0)?;
                Ok(Some(parse_time_of_day(&text)?))
            }
            None => Ok(None),
        }
    }

    pub fn set_quiet_time(&self, label: &str, time: NaiveTime) -> Result<()> {
        let text = time.format("%H:%M:%S").to_string();
        self.conn.lock().execute(
            "INSERT INTO quiettime (label, time) VALUES (?1, ?2)
             ON CONFLICT(label) DO UPDATE SET time = excluded.time",
            [label, text.as_str()],
        )?;
        Ok(())
    }

    // ------------------------------------------------------------------
    // Jobs
    // ------------------------------------------------------------------

    pub fn insert_job(
        &self,
        payload: &JobPayload,
        start_time: DateTime<Utc>,
        end_time: Option<DateTime<Utc>>,
        interval: Option<Duration>,
        ignore_quiet_time: bool,
    ) -> Result<i64> {
        let conn = self.conn.lock();
        conn.execute(
            "INSERT INTO jobs (job, start_time, next_time, end_time, interval_secs,
                               ignore_quiet_time, status)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7)",
            rusqlite::params![
                serde_json::to_string(payload)?,
                start_time.to_rfc3339(),
                start_time.to_rfc3339(),
                end_time.map(|t| t.to_rfc3339()),
                interval.map(duration_secs),
                ignore_quiet_time,
                JobStatus::Active.as_str(),
            ],
        )?;
        Ok(conn.last_insert_rowid())
    }

    pub fn job(&self, id: i64) -> Result<Option<ScheduledJob>> {
        let conn = self.conn.lock();
        let mut stmt = conn.prepare(&format!("{JOB_SELECT} WHERE id = ?1"))?;
        let mut rows = stmt.query([id])?;
        match rows.next()? {
            Some(row) => Ok(Some(job_from_row(row)?)),
            None => Ok(None),
        }
    }

    /// Every stored job, tombstones included, ordered by id.
    pub fn all_jobs(&self) -> Result<Vec<ScheduledJob>> {
        let conn = self.conn.lock();
        let mut stmt = conn.prepare(&format!("{JOB_SELECT} ORDER BY id"))?;
        let rows = stmt.query_map([], |row| Ok(job_from_row(row)))?;
        let mut jobs = Vec::new();
        for row in rows {
            jobs.push(row??);
        }
        Ok(jobs)
    }

    /// Live jobs whose `next_time` lies in the past.
    pub fn due_jobs(&self, now: DateTime<Utc>) -> Result<Vec<ScheduledJob>> {
        let conn = self.conn.lock();
        let mut stmt = conn.prepare(&format!(
            "{JOB_SELECT} WHERE status IN ('active', 'suspended') AND next_time < ?1 ORDER BY id"
        ))?;
        let rows = stmt.query_map([now.to_rfc3339()], |row| Ok(job_from_row(row)))?;
        let mut jobs = Vec::new();
        for row in rows {
            jobs.push(row??);
        }
        Ok(jobs)
    }

    pub fn set_next_time(&self, id: i64, next_time: DateTime<Utc>) -> Result<()> {
        self.conn.lock().execute(
            "UPDATE jobs SET next_time = ?1 WHERE id = ?2",
            rusqlite::params![next_time.to_rfc3339(), id],
        )?;
        Ok(())
    }

    /// Transition a job's status; `from` constrains which states may move.
    /// Returns whether a row actually changed.
    pub fn set_status(&self, id: i64, from: &[JobStatus], to: JobStatus) -> Result<bool> {
        let from_list = from
            .iter()
            .map(|s| format!("'{}'", s.as_str()))
            .collect::<Vec<_>>()
            .join(", ");
        let changed = self.conn.lock().execute(
            &format!("UPDATE jobs SET status = ?1 WHERE id = ?2 AND status IN ({from_list})"),
            rusqlite::params![to.as_str(), id],
        )?;
        Ok(changed > 0)
    }

    /// Promote jobs whose `next_time` ran past their `end_time` to done.
    pub fn mark_expired_done(&self) -> Result<usize> {
        Ok(self.conn.lock().execute(
            "UPDATE jobs SET status = 'done'
             WHERE status IN ('active', 'suspended')
               AND end_time IS NOT NULL AND next_time > end_time",
            [],
        )?)
    }
}

const JOB_SELECT: &str = "SELECT id, job, start_time, next_time, end_time, interval_secs,
                                 ignore_quiet_time, status
                          FROM jobs";

fn duration_secs(d: Duration) -> f64 {
    d.num_milliseconds() as f64 / 1000.0
}

fn job_from_row(row: &rusqlite::Row<'_>) -> Result<ScheduledJob> {
    let payload: String = row.get(1)?;
    let start: String = row.get(2)?;
    let next: String = row.get(3)?;
    let end: Option<String> = row.get(4)?;
    let interval: Option<f64> = row.get(5)?;
    let status: String = row.get(7)?;
    Ok(ScheduledJob {
        id: row.get(0)?,
        payload: serde_json::from_str(&payload)?,
        start_time: parse_datetime(&start)?,
        next_time: parse_datetime(&next)?,
        end_time: end.as_deref().map(parse_datetime).transpose()?,
        interval: interval.map(|s| Duration::milliseconds((s * 1000.0).round() as i64)),
        ignore_quiet_time: row.get(6)?,
        status: JobStatus::parse(&status)?,
    })
}

/// Parse an ISO-8601 / RFC 3339 timestamp; bare timestamps are taken as UTC.
pub fn parse_datetime(s: &str) -> Result<DateTime<Utc>> {
    if let Ok(t) = DateTime::parse_from_rfc3339(s) {
        return Ok(t.with_timezone(&Utc));
    }
    for fmt in ["%Y-%m-%dT%H:%M:%S", "%Y-%m-%d %H:%M:%S"] {
        if let Ok(t) = chrono::NaiveDateTime::parse_from_str(s, fmt) {
            return Ok(t.and_utc());
        }
    }
    Err(PiccoloError::invalid(format!("cannot parse time {s}")))
}

/// Parse a time of day, `HH:MM:SS` or `HH:MM`.
pub fn parse_time_of_day(s: &str) -> Result<NaiveTime> {
    for fmt in ["%H:%M:%S", "%H:%M"] {
        if let Ok(t) = NaiveTime::parse_from_str(s, fmt) {
            return Ok(t);
        }
    }
    Err(PiccoloError::invalid(format!(
        "cannot parse time of day {s}"
    )))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn payload() -> JobPayload {
        JobPayload::Dark { run: "R1".into() }
    }

    #[test]
    fn test_settings_roundtrip() {
        let store = Store::in_memory().unwrap();
        assert_eq!(store.get_setting("power_delay").unwrap(), None);
        store.set_setting("power_delay", "600").unwrap();
        store.set_setting("power_delay", "900").unwrap();
        assert_eq!(
            store.get_setting("power_delay").unwrap().as_deref(),
            Some("900")
        );
    }

    #[test]
    fn test_quiet_time_roundtrip() {
        let store = Store::in_memory().unwrap();
        let t = NaiveTime::from_hms_opt(22, 0, 0).unwrap();
        store.set_quiet_time("start", t).unwrap();
        assert_eq!(store.get_quiet_time("start").unwrap(), Some(t));
    }

    #[test]
    fn test_job_roundtrip() {
        let store = Store::in_memory().unwrap();
        let now = Utc::now();
        let id = store
            .insert_job(
                &payload(),
                now,
                Some(now + Duration::seconds(60)),
                Some(Duration::seconds(10)),
                true,
            )
            .unwrap();
        let job = store.job(id).unwrap().unwrap();
        assert_eq!(job.payload, payload());
        assert_eq!(job.next_time, job.start_time);
        assert_eq!(job.interval, Some(Duration::seconds(10)));
        assert!(job.ignore_quiet_time);
        assert_eq!(job.status, JobStatus::Active);
        // Sub-second precision survives the round trip.
        assert!((job.start_time - now).num_milliseconds().abs() < 1);
    }

    #[test]
    fn test_due_jobs_filter() {
        let store = Store::in_memory().unwrap();
        let now = Utc::now();
        let due = store
            .insert_job(&payload(), now - Duration::seconds(5), None, None, false)
            .unwrap();
        store
            .insert_job(&payload(), now + Duration::seconds(5), None, None, false)
            .unwrap();
        let deleted = store
            .insert_job(&payload(), now - Duration::seconds(5), None, None, false)
            .unwrap();
        store
            .set_status(deleted, &[JobStatus::Active], JobStatus::Deleted)
            .unwrap();
        let jobs = store.due_jobs(now).unwrap();
        assert_eq!(jobs.len(), 1);
        assert_eq!(jobs[0].id, due);
    }

    #[test]
    fn test_status_transitions_are_guarded() {
        let store = Store::in_memory().unwrap();
        let now = Utc::now();
        let id = store
            .insert_job(&payload(), now, None, Some(Duration::seconds(1)), false)
            .unwrap();
        assert!(store
            .set_status(id, &[JobStatus::Active], JobStatus::Suspended)
            .unwrap());
        // Suspending a suspended job changes nothing.
        assert!(!store
            .set_status(id, &[JobStatus::Active], JobStatus::Suspended)
            .unwrap());
        assert!(store
            .set_status(
                id,
                &[JobStatus::Active, JobStatus::Suspended],
                JobStatus::Deleted
            )
            .unwrap());
        // Tombstone stays visible.
        assert_eq!(store.all_jobs().unwrap().len(), 1);
        assert_eq!(store.all_jobs().unwrap()[0].status, JobStatus::Deleted);
    }

    #[test]
    fn test_mark_expired_done() {
        let store = Store::in_memory().unwrap();
        let now = Utc::now();
        let id = store
            .insert_job(
                &payload(),
                now - Duration::seconds(60),
                Some(now - Duration::seconds(30)),
                Some(Duration::seconds(10)),
                false,
            )
            .unwrap();
        store.set_next_time(id, now).unwrap();
        assert_eq!(store.mark_expired_done().unwrap(), 1);
        assert_eq!(store.job(id).unwrap().unwrap().status, JobStatus::Done);
    }

    #[test]
    fn test_parse_datetime_variants() {
        assert!(parse_datetime("2026-08-01T10:00:00Z").is_ok());
        assert!(parse_datetime("2026-08-01T10:00:00+01:00").is_ok());
        assert!(parse_datetime("2026-08-01 10:00:00").is_ok());
        assert!(parse_datetime("not a time").is_err());
    }
}
