//! Output data directory and runs.
//!
//! Spectra are grouped into *runs*, one directory per run below the data
//! root. Each run carries a batch counter that starts at -1 and is
//! rediscovered at startup from the largest `b####` prefix among existing
//! `.pico` files, so batch numbers keep increasing across restarts.

use crate::config::DataDirConfig;
use crate::error::{PiccoloError, Result};
use crate::notify::Notifier;
use crate::resource::{Call, Site};
use parking_lot::{Mutex, RwLock};
use serde_json::json;
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tracing::{debug, info};

const SPECTRA_SUFFIX: &str = ".pico";

/// The run every instrument starts out in.
pub const DEFAULT_RUN: &str = "spectra";

struct RunInner {
    name: String,
    dir: PathBuf,
    current_batch: Mutex<i64>,
}

/// One run directory with its batch counter.
#[derive(Clone)]
pub struct Run {
    inner: Arc<RunInner>,
}

impl Run {
    fn open(datadir: &Path, name: &str) -> Self {
        let dir = datadir.join(name);
        let mut current_batch = -1;
        for file in list_spectra(&dir) {
            if let Some(b) = batch_prefix(&file) {
                current_batch = current_batch.max(b);
            }
        }
        Self {
            inner: Arc::new(RunInner {
                name: name.to_string(),
                dir,
                current_batch: Mutex::new(current_batch),
            }),
        }
    }

    pub fn name(&self) -> &str {
        &self.inner.name
    }

    pub fn current_batch(&self) -> i64 {
        *self.inner.current_batch.lock()
    }

    /// Advance and return the batch counter; first call yields 0.
    pub fn next_batch(&self) -> i64 {
        let mut batch = self.inner.current_batch.lock();
        *batch += 1;
        *batch
    }

    /// Sorted spectra file names in this run.
    pub fn spectra_list(&self) -> Vec<String> {
        list_spectra(&self.inner.dir)
    }

    /// Contents of one spectra file. The name must be a bare file name.
    pub fn read_spectra(&self, name: &str) -> Result<String> {
        if name.contains(std::path::MAIN_SEPARATOR) || name.contains("..") {
            return Err(PiccoloError::invalid(format!("bad spectra name {name}")));
        }
        Ok(std::fs::read_to_string(self.inner.dir.join(name))?)
    }
}

/// Parse the batch number out of a `b####_s#####.pico` file name.
fn batch_prefix(name: &str) -> Option<i64> {
    name.split('_').next()?.strip_prefix('b')?.parse().ok()
}

fn list_spectra(dir: &Path) -> Vec<String> {
    let mut out: Vec<String> = match std::fs::read_dir(dir) {
        Ok(entries) => entries
            .flatten()
            .filter_map(|e| e.file_name().into_string().ok())
            .filter(|n| n.starts_with('b') && n.ends_with(SPECTRA_SUFFIX))
            .collect(),
        Err(_) => Vec::new(),
    };
    out.sort();
    out
}

struct DataDirInner {
    datadir: PathBuf,
    device: String,
    mntpnt: PathBuf,
    runs: RwLock<BTreeMap<String, Run>>,
    current_run: RwLock<String>,
    current_run_changed: Notifier,
}

/// The output data directory.
#[derive(Clone)]
pub struct DataDir {
    inner: Arc<DataDirInner>,
}

impl DataDir {
    /// Open the data directory described by the server configuration,
    /// mounting the backing device first when requested.
    pub fn new(cfg: &DataDirConfig) -> Result<Self> {
        let mntpnt = PathBuf::from(cfg.mntpnt.trim_end_matches('/'));
        let datadir = if cfg.mount {
            mntpnt.join(&cfg.datadir)
        } else {
            let p = PathBuf::from(&cfg.datadir);
            if p.is_absolute() {
                p
            } else {
                std::env::current_dir()?.join(p)
            }
        };
        let dd = Self {
            inner: Arc::new(DataDirInner {
                datadir,
                device: cfg.device.clone(),
                mntpnt,
                runs: RwLock::new(BTreeMap::new()),
                current_run: RwLock::new(String::new()),
                current_run_changed: Notifier::new(),
            }),
        };
        if cfg.mount && !dd.get_mount()? {
            dd.set_mount(true)?;
        }
        dd.check_datadir()?;
        for name in dd.all_runs(true, false)? {
            dd.add_run(&name);
        }
        dd.set_current_run(DEFAULT_RUN)?;
        Ok(dd)
    }

    /// Open at a fixed path without any mount handling; used by tests.
    pub fn at_path(path: &Path) -> Result<Self> {
        Self::new(&DataDirConfig {
            datadir: path.to_string_lossy().into_owned(),
            device: String::new(),
            mntpnt: "/mnt".into(),
            mount: false,
        })
    }

    fn check_datadir(&self) -> Result<()> {
        let dir = &self.inner.datadir;
        if !dir.exists() {
            info!("creating data directory {}", dir.display());
            std::fs::create_dir_all(dir)?;
        }
        if !dir.is_dir() {
            return Err(PiccoloError::Configuration(format!(
                "{} is not a directory",
                dir.display()
            )));
        }
        let probe = dir.join(".piccolo_write_check");
        std::fs::write(&probe, b"")
            .map_err(|_| {
                PiccoloError::Configuration(format!("cannot write to {}", dir.display()))
            })?;
        let _ = std::fs::remove_file(probe);
        Ok(())
    }

    pub fn datadir(&self) -> &Path {
        &self.inner.datadir
    }

    /// Join a path to the data directory unless it is already absolute.
    pub fn join(&self, p: impl AsRef<Path>) -> PathBuf {
        let p = p.as_ref();
        if p.is_absolute() {
            p.to_path_buf()
        } else {
            self.inner.datadir.join(p)
        }
    }

    fn add_run(&self, name: &str) -> Run {
        let mut runs = self.inner.runs.write();
        runs.entry(name.to_string())
            .or_insert_with(|| Run::open(&self.inner.datadir, name))
            .clone()
    }

    /// Look up an existing run.
    pub fn run(&self, name: &str) -> Result<Run> {
        self.inner
            .runs
            .read()
            .get(name)
            .cloned()
            .ok_or_else(|| PiccoloError::UnknownRun(name.to_string()))
    }

    pub fn current_run(&self) -> String {
        self.inner.current_run.read().clone()
    }

    pub fn current_run_changed(&self) -> &Notifier {
        &self.inner.current_run_changed
    }

    /// Switch the current run, creating its directory on first reference.
    /// Selecting the run that is already current is a warning.
    pub fn set_current_run(&self, run: &str) -> Result<String> {
        if *self.inner.current_run.read() == run {
            return Err(PiccoloError::invalid(format!("already using run {run}")));
        }
        let dir = self.join(run);
        if !dir.is_dir() {
            debug!(run, "creating directory for run");
            std::fs::create_dir_all(&dir)?;
        }
        self.add_run(run);
        *self.inner.current_run.write() = run.to_string();
        self.inner.current_run_changed.notify();
        Ok(run.to_string())
    }

    /// List run directories, sorted by mtime unless `alpha`.
    pub fn all_runs(&self, alpha: bool, reverse: bool) -> Result<Vec<String>> {
        let mut runs: Vec<(String, std::time::SystemTime)> = Vec::new();
        for entry in std::fs::read_dir(&self.inner.datadir)?.flatten() {
            if entry.path().is_dir() {
                if let Ok(name) = entry.file_name().into_string() {
                    let mtime = entry
                        .metadata()
                        .and_then(|m| m.modified())
                        .unwrap_or(std::time::SystemTime::UNIX_EPOCH);
                    runs.push((name, mtime));
                }
            }
        }
        if alpha {
            runs.sort_by(|a, b| a.0.cmp(&b.0));
        } else {
            runs.sort_by_key(|r| r.1);
        }
        if reverse {
            runs.reverse();
        }
        Ok(runs.into_iter().map(|r| r.0).collect())
    }

    /// Whether the backing device is mounted at the configured mount point.
    pub fn get_mount(&self) -> Result<bool> {
        let mounts = std::fs::read_to_string("/proc/mounts")?;
        let mntpnt = self.inner.mntpnt.to_string_lossy();
        for line in mounts.lines() {
            let mut fields = line.split_whitespace();
            if fields.next() != Some(self.inner.device.as_str()) {
                continue;
            }
            let at = fields.next().unwrap_or("?");
            if at == mntpnt {
                return Ok(true);
            }
            return Err(PiccoloError::Device(format!(
                "device {} mounted in wrong directory {at}",
                self.inner.device
            )));
        }
        Ok(false)
    }

    /// Mount or unmount the backing device.
    pub fn set_mount(&self, mount: bool) -> Result<String> {
        if mount {
            if self.get_mount()? {
                return Err(PiccoloError::invalid(format!(
                    "device {} is already mounted",
                    self.inner.device
                )));
            }
            let msg = format!(
                "mounting {} at {}",
                self.inner.device,
                self.inner.mntpnt.display()
            );
            info!("{msg}");
            let mntpnt = self.inner.mntpnt.to_string_lossy();
            run_command("mount", &[self.inner.device.as_str(), mntpnt.as_ref()])?;
            self.check_datadir()?;
            Ok(msg)
        } else {
            if !self.get_mount()? {
                return Err(PiccoloError::invalid(format!(
                    "device {} is already unmounted",
                    self.inner.device
                )));
            }
            let msg = format!("unmounting {}", self.inner.device);
            info!("{msg}");
            run_command("umount", &[self.inner.device.as_str()])?;
            Ok(msg)
        }
    }

    /// Endpoint tree for the data-directory component.
    pub fn resources(&self) -> Site {
        let mut site = Site::new();
        let dd = self.clone();
        site.at("datadir")
            .get(move |_| {
                let dd = dd.clone();
                async move { Ok(json!(dd.datadir().to_string_lossy())) }
            })
            .register();
        let dd = self.clone();
        let dd2 = self.clone();
        site.at("mount")
            .get(move |_| {
                let dd = dd.clone();
                async move { Ok(json!(dd.get_mount()?)) }
            })
            .put(move |call: Call| {
                let dd = dd2.clone();
                async move {
                    let mount: bool = call.require(0, "mount")?;
                    Ok(json!(dd.set_mount(mount)?))
                }
            })
            .register();
        let dd = self.clone();
        site.at("all_runs")
            .put(move |call: Call| {
                let dd = dd.clone();
                async move {
                    let alpha = call.param::<bool>(0, "alpha")?.unwrap_or(false);
                    let reverse = call.param::<bool>(1, "reverse")?.unwrap_or(false);
                    let nitems = call.param::<usize>(2, "nitems")?;
                    let page = call.param::<usize>(3, "page")?.unwrap_or(0);
                    let mut runs = dd.all_runs(alpha, reverse)?;
                    if let Some(n) = nitems {
                        runs = runs.into_iter().skip(page * n).take(n).collect();
                    }
                    Ok(json!(runs))
                }
            })
            .register();
        let dd = self.clone();
        let notifier = self.inner.current_run_changed.clone();
        let dd2 = self.clone();
        site.at("current_run")
            .get(move |_| {
                let dd = dd.clone();
                async move { Ok(json!(dd.current_run())) }
            })
            .put(move |call: Call| {
                let dd = dd2.clone();
                async move {
                    let run: String = call.require(0, "run")?;
                    Ok(json!(dd.set_current_run(&run)?))
                }
            })
            .observable(notifier)
            .register();
        // Run subtree; runs appear at runtime, so this is one wildcard
        // resource that resolves `runs/{run}/{leaf}` on each request.
        let dd = self.clone();
        let dd2 = self.clone();
        site.at("runs")
            .wildcard()
            .get(move |call: Call| {
                let dd = dd.clone();
                async move {
                    let arg = call.path_arg()?;
                    let (run_name, leaf) = arg
                        .split_once('/')
                        .ok_or_else(|| PiccoloError::invalid("expected runs/{run}/{item}"))?;
                    let run = dd.run(run_name)?;
                    match leaf {
                        "name" => Ok(json!(run.name())),
                        "current_batch" => Ok(json!(run.current_batch())),
                        "spectra_list" => Ok(json!(run.spectra_list())),
                        other => Err(PiccoloError::invalid(format!("unknown run item {other}"))),
                    }
                }
            })
            .put(move |call: Call| {
                let dd = dd2.clone();
                async move {
                    let arg = call.path_arg()?;
                    let (run_name, leaf) = arg
                        .split_once('/')
                        .ok_or_else(|| PiccoloError::invalid("expected runs/{run}/{item}"))?;
                    if leaf != "spectra" {
                        return Err(PiccoloError::invalid(format!(
                            "unknown run item {leaf}"
                        )));
                    }
                    let run = dd.run(run_name)?;
                    let sname: String = call.require(0, "sname")?;
                    Ok(json!(run.read_spectra(&sname)?))
                }
            })
            .register();
        site
    }
}

fn run_command(cmd: &str, args: &[&str]) -> Result<()> {
    let output = std::process::Command::new("sudo")
        .arg(cmd)
        .args(args)
        .output()?;
    if !output.status.success() {
        return Err(PiccoloError::Device(format!(
            "{cmd} failed: {}",
            String::from_utf8_lossy(&output.stderr)
        )));
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_batch_prefix() {
        assert_eq!(batch_prefix("b0003_s00012.pico"), Some(3));
        assert_eq!(batch_prefix("b0000_s00000.pico"), Some(0));
        assert_eq!(batch_prefix("junk.pico"), None);
    }

    #[test]
    fn test_next_batch_increases_from_scan() {
        let dir = tempfile::tempdir().unwrap();
        let run_dir = dir.path().join("R1");
        std::fs::create_dir_all(&run_dir).unwrap();
        std::fs::write(run_dir.join("b0002_s00000.pico"), b"{}").unwrap();
        std::fs::write(run_dir.join("b0005_s00003.pico"), b"{}").unwrap();
        let run = Run::open(dir.path(), "R1");
        assert_eq!(run.current_batch(), 5);
        assert_eq!(run.next_batch(), 6);
        assert_eq!(run.next_batch(), 7);
    }

    #[test]
    fn test_fresh_run_starts_at_zero() {
        let dir = tempfile::tempdir().unwrap();
        let run = Run::open(dir.path(), "R1");
        assert_eq!(run.current_batch(), -1);
        assert_eq!(run.next_batch(), 0);
        assert_eq!(run.next_batch(), 1);
    }

    #[test]
    fn test_default_run_selected() {
        let dir = tempfile::tempdir().unwrap();
        let dd = DataDir::at_path(dir.path()).unwrap();
        assert_eq!(dd.current_run(), DEFAULT_RUN);
        assert!(dir.path().join(DEFAULT_RUN).is_dir());
    }

    #[test]
    fn test_set_current_run_warns_on_duplicate() {
        let dir = tempfile::tempdir().unwrap();
        let dd = DataDir::at_path(dir.path()).unwrap();
        dd.set_current_run("R1").unwrap();
        assert_eq!(dd.current_run(), "R1");
        let err = dd.set_current_run("R1").unwrap_err();
        assert!(err.is_domain());
        // The run directory was created and registered.
        assert!(dd.run("R1").is_ok());
        assert!(dd.run("R2").is_err());
    }

    #[test]
    fn test_all_runs_listing() {
        let dir = tempfile::tempdir().unwrap();
        let dd = DataDir::at_path(dir.path()).unwrap();
        dd.set_current_run("beta").unwrap();
        dd.set_current_run("alpha").unwrap();
        let alpha = dd.all_runs(true, false).unwrap();
        assert_eq!(alpha, vec!["alpha", "beta", DEFAULT_RUN]);
        let rev = dd.all_runs(true, true).unwrap();
        assert_eq!(rev, vec![DEFAULT_RUN, "beta", "alpha"]);
    }

    #[test]
    fn test_read_spectra_rejects_traversal() {
        let dir = tempfile::tempdir().unwrap();
        let dd = DataDir::at_path(dir.path()).unwrap();
        dd.set_current_run("R1").unwrap();
        let run = dd.run("R1").unwrap();
        assert!(run.read_spectra("../secret").is_err());
    }
}
