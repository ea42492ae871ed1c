//! Shutter registry.
//!
//! Each optical channel is gated by one shutter. A shutter owns its drive
//! exclusively and tracks a binary open/closed state; opening an open
//! shutter (or closing a closed one) is a warning, not a state change. At
//! startup every shutter is driven closed so the instrument starts from a
//! known state.

use crate::config::ChannelConfig;
use crate::error::{PiccoloError, Result};
use crate::hardware::{DummyShutter, ShutterDriver};
use crate::notify::Notifier;
use crate::resource::{Call, Site};
use parking_lot::Mutex;
use serde_json::json;
use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;
use tracing::{info, warn};

struct ShutterState {
    open: bool,
    driver: Box<dyn ShutterDriver>,
}

struct ShutterInner {
    name: String,
    reverse: bool,
    fibre_diameter: f64,
    state: Mutex<ShutterState>,
    changed: Notifier,
}

/// Handle to one shutter. Clones share the same device.
#[derive(Clone)]
pub struct Shutter {
    inner: Arc<ShutterInner>,
}

impl Shutter {
    pub fn new(
        name: impl Into<String>,
        driver: Box<dyn ShutterDriver>,
        reverse: bool,
        fibre_diameter: f64,
    ) -> Result<Self> {
        let shutter = Self {
            inner: Arc::new(ShutterInner {
                name: name.into(),
                reverse,
                fibre_diameter,
                state: Mutex::new(ShutterState {
                    open: false,
                    driver,
                }),
                changed: Notifier::new(),
            }),
        };
        // Establish a known state.
        shutter.inner.state.lock().driver.set_open(false)?;
        Ok(shutter)
    }

    pub fn name(&self) -> &str {
        &self.inner.name
    }

    pub fn reverse(&self) -> bool {
        self.inner.reverse
    }

    pub fn fibre_diameter(&self) -> f64 {
        self.inner.fibre_diameter
    }

    pub fn changed(&self) -> &Notifier {
        &self.inner.changed
    }

    /// Open the shutter. Opening an already-open shutter changes nothing
    /// and reports a domain warning.
    pub fn open(&self) -> Result<()> {
        let mut state = self.inner.state.lock();
        if state.open {
            warn!(shutter = %self.inner.name, "shutter already open");
            return Err(PiccoloError::invalid("shutter already open"));
        }
        state.driver.set_open(true)?;
        state.open = true;
        info!(shutter = %self.inner.name, "open shutter");
        self.inner.changed.notify();
        Ok(())
    }

    /// Close the shutter; closing a closed shutter is a warning.
    pub fn close(&self) -> Result<()> {
        let mut state = self.inner.state.lock();
        if !state.open {
            return Err(PiccoloError::invalid("shutter already closed"));
        }
        state.driver.set_open(false)?;
        state.open = false;
        info!(shutter = %self.inner.name, "closed shutter");
        self.inner.changed.notify();
        Ok(())
    }

    /// Open for `milliseconds`, then close, on a detached thread.
    pub fn timed_open(&self, milliseconds: u64) {
        info!(
            shutter = %self.inner.name,
            milliseconds, "opening the shutter for a set period"
        );
        let shutter = self.clone();
        let _ = std::thread::Builder::new()
            .name(format!("shutter.{}", self.inner.name))
            .spawn(move || {
                if let Err(e) = shutter.open() {
                    warn!(shutter = %shutter.inner.name, "timed open: {e}");
                    return;
                }
                std::thread::sleep(Duration::from_millis(milliseconds));
                if let Err(e) = shutter.close() {
                    warn!(shutter = %shutter.inner.name, "timed close: {e}");
                }
            });
    }

    /// `"open"` or `"closed"`.
    pub fn status(&self) -> &'static str {
        if self.inner.state.lock().open {
            "open"
        } else {
            "closed"
        }
    }
}

/// The named shutters of the instrument, keyed by direction.
#[derive(Clone, Default)]
pub struct ShutterBank {
    shutters: Arc<BTreeMap<String, Shutter>>,
}

impl ShutterBank {
    /// Build the bank from the channel configuration. Keys must follow the
    /// `shutter_<n>` convention; a malformed key fails startup.
    pub fn from_config(channels: &BTreeMap<String, ChannelConfig>) -> Result<Self> {
        let mut shutters = BTreeMap::new();
        for (key, cfg) in channels {
            let parsed = key
                .strip_prefix("shutter_")
                .and_then(|n| n.parse::<u32>().ok());
            if parsed.is_none() {
                return Err(PiccoloError::Configuration(format!(
                    "cannot parse shutter {key}"
                )));
            }
            // Real GPIO drives attach here; the state-only drive stands in
            // when none is wired up.
            let driver = Box::new(DummyShutter::default());
            let shutter =
                Shutter::new(cfg.direction.clone(), driver, cfg.reverse, cfg.fibre_diameter)?;
            shutters.insert(cfg.direction.clone(), shutter);
        }
        Ok(Self {
            shutters: Arc::new(shutters),
        })
    }

    /// Build a bank directly from shutters; used by tests.
    pub fn from_shutters(list: Vec<Shutter>) -> Self {
        Self {
            shutters: Arc::new(
                list.into_iter()
                    .map(|s| (s.name().to_string(), s))
                    .collect(),
            ),
        }
    }

    pub fn get(&self, name: &str) -> Result<&Shutter> {
        self.shutters
            .get(name)
            .ok_or_else(|| PiccoloError::UnknownChannel(name.to_string()))
    }

    /// Direction names, sorted.
    pub fn names(&self) -> Vec<String> {
        self.shutters.keys().cloned().collect()
    }

    pub fn iter(&self) -> impl Iterator<Item = &Shutter> {
        self.shutters.values()
    }

    pub fn len(&self) -> usize {
        self.shutters.len()
    }

    pub fn is_empty(&self) -> bool {
        self.shutters.is_empty()
    }

    /// Close every shutter, ignoring already-closed warnings.
    pub fn close_all(&self) {
        for shutter in self.iter() {
            let _ = shutter.close();
        }
    }

    /// Endpoint tree for the shutter component.
    pub fn resources(&self) -> Site {
        let mut site = Site::new();
        let bank = self.clone();
        site.at("shutters")
            .get(move |_call: Call| {
                let bank = bank.clone();
                async move { Ok(json!(bank.names())) }
            })
            .register();
        for shutter in self.iter() {
            let name = shutter.name().to_string();
            let s = shutter.clone();
            site.at(&format!("{name}/reverse"))
                .get(move |_| {
                    let s = s.clone();
                    async move { Ok(json!(s.reverse())) }
                })
                .register();
            let s = shutter.clone();
            site.at(&format!("{name}/fibre_diameter"))
                .get(move |_| {
                    let s = s.clone();
                    async move { Ok(json!(s.fibre_diameter())) }
                })
                .register();
            let s = shutter.clone();
            site.at(&format!("{name}/status"))
                .get(move |_| {
                    let s = s.clone();
                    async move { Ok(json!(s.status())) }
                })
                .observable(shutter.changed().clone())
                .register();
            let s = shutter.clone();
            site.at(&format!("{name}/open_shutter"))
                .put(move |call: Call| {
                    let s = s.clone();
                    async move {
                        let sopen = call.param::<bool>(0, "sopen")?.unwrap_or(true);
                        if sopen { s.open()? } else { s.close()? }
                        Ok(json!(s.status()))
                    }
                })
                .register();
            let s = shutter.clone();
            site.at(&format!("{name}/close_shutter"))
                .put(move |call: Call| {
                    let s = s.clone();
                    async move {
                        let sclose = call.param::<bool>(0, "sclose")?.unwrap_or(true);
                        if sclose { s.close()? } else { s.open()? }
                        Ok(json!(s.status()))
                    }
                })
                .register();
        }
        site
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn shutter(name: &str) -> Shutter {
        Shutter::new(name, Box::new(DummyShutter::default()), false, 600.0).unwrap()
    }

    #[test]
    fn test_open_close_idempotence() {
        let s = shutter("upwelling");
        assert_eq!(s.status(), "closed");
        s.open().unwrap();
        assert_eq!(s.status(), "open");
        // A second open is a warning, not a state change.
        assert!(s.open().is_err());
        assert_eq!(s.status(), "open");
        s.close().unwrap();
        assert!(s.close().is_err());
        assert_eq!(s.status(), "closed");
    }

    #[test]
    fn test_timed_open() {
        let s = shutter("upwelling");
        s.timed_open(50);
        std::thread::sleep(Duration::from_millis(25));
        assert_eq!(s.status(), "open");
        std::thread::sleep(Duration::from_millis(100));
        assert_eq!(s.status(), "closed");
    }

    #[test]
    fn test_bank_from_config() {
        let mut channels = BTreeMap::new();
        channels.insert(
            "shutter_1".to_string(),
            ChannelConfig {
                direction: "upwelling".into(),
                reverse: true,
                fibre_diameter: 600.0,
            },
        );
        channels.insert(
            "shutter_2".to_string(),
            ChannelConfig {
                direction: "downwelling".into(),
                reverse: false,
                fibre_diameter: 400.0,
            },
        );
        let bank = ShutterBank::from_config(&channels).unwrap();
        assert_eq!(bank.names(), vec!["downwelling", "upwelling"]);
        assert!(bank.get("upwelling").unwrap().reverse());
        assert!(bank.get("sideways").is_err());
    }

    #[test]
    fn test_bank_rejects_malformed_keys() {
        let mut channels = BTreeMap::new();
        channels.insert(
            "not_a_shutter".to_string(),
            ChannelConfig {
                direction: "upwelling".into(),
                reverse: false,
                fibre_diameter: 600.0,
            },
        );
        assert!(ShutterBank::from_config(&channels).is_err());
    }

    #[test]
    fn test_close_all_ignores_closed() {
        let bank = ShutterBank::from_shutters(vec![shutter("a"), shutter("b")]);
        bank.get("a").unwrap().open().unwrap();
        bank.close_all();
        assert_eq!(bank.get("a").unwrap().status(), "closed");
        assert_eq!(bank.get("b").unwrap().status(), "closed");
    }
}
