use std::collections::BTreeMap;
use std::sync::{Arc, Mutex, PoisonError};

use log::{error, info};
use prometheus::proto::MetricFamily;
use prometheus::{Encoder, TextEncoder};

use crate::definition::{Instrument, MetricDefinition};
use crate::error::Result;

/// What `Registry::register` did with an instrument
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Registration {
    Registered,
    /// an instrument with the same definition was attached and got swapped out
    Replaced,
    /// not attached; the reason was logged
    Rejected,
}

/// The set of instruments served to scrapers. Holds at most one instrument
/// per metric name. Clones share the same set.
#[derive(Clone)]
pub struct Registry {
    inner: prometheus::Registry,
    attached: Arc<Mutex<BTreeMap<String, MetricDefinition>>>,
}

impl Default for Registry {
    fn default() -> Self {
        Self::new()
    }
}

impl Registry {
    pub fn new() -> Self {
        Registry {
            inner: prometheus::Registry::new(),
            attached: Arc::new(Mutex::new(BTreeMap::new())),
        }
    }

    /// Attach an instrument. Re-registering an equal definition replaces the
    /// attached instrument; a different definition under an attached name is
    /// logged and left out. Never fails.
    pub fn register(&self, instrument: &dyn Instrument) -> Registration {
        let definition = instrument.definition();
        let mut attached = self.attached.lock().unwrap_or_else(PoisonError::into_inner);

        match attached.get(definition.name()) {
            Some(existing) if existing == definition => {
                // nothing to detach is fine, the attach below decides
                let _ = self.inner.unregister(instrument.collector());
                match self.inner.register(instrument.collector()) {
                    Ok(()) => {
                        info!("Metric already registered; replacing: {}", definition);
                        Registration::Replaced
                    }
                    Err(err) => {
                        attached.remove(definition.name());
                        error!("Failed to register metric {}: {}", definition, err);
                        Registration::Rejected
                    }
                }
            }
            Some(existing) => {
                error!(
                    "Failed to register metric {}: conflicts with registered {}",
                    definition, existing
                );
                Registration::Rejected
            }
            None => match self.inner.register(instrument.collector()) {
                Ok(()) => {
                    attached.insert(definition.name().to_owned(), definition.clone());
                    info!("Registered metric: {}", definition);
                    Registration::Registered
                }
                Err(err) => {
                    error!("Failed to register metric {}: {}", definition, err);
                    Registration::Rejected
                }
            },
        }
    }

    /// Register each instrument in turn; a rejected one does not stop the rest
    pub fn register_all(&self, instruments: &[&dyn Instrument]) -> Vec<Registration> {
        instruments.iter().map(|i| self.register(*i)).collect()
    }

    /// Detach an instrument. Returns whether its definition was attached.
    pub fn unregister(&self, instrument: &dyn Instrument) -> bool {
        let definition = instrument.definition();
        let mut attached = self.attached.lock().unwrap_or_else(PoisonError::into_inner);

        match attached.get(definition.name()) {
            Some(existing) if existing == definition => {
                let _ = self.inner.unregister(instrument.collector());
                attached.remove(definition.name());
                true
            }
            _ => false,
        }
    }

    pub fn lookup(&self, name: &str) -> Option<MetricDefinition> {
        self.attached
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .get(name)
            .cloned()
    }

    /// Attached definitions, sorted by name
    pub fn definitions(&self) -> Vec<MetricDefinition> {
        self.attached
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .values()
            .cloned()
            .collect()
    }

    pub fn gather(&self) -> Vec<MetricFamily> {
        self.inner.gather()
    }

    /// Current values in the Prometheus text exposition format
    pub fn encode_text(&self) -> Result<String> {
        let encoder = TextEncoder::new();
        let mut buffer = vec![];
        encoder.encode(&self.gather(), &mut buffer)?;
        Ok(String::from_utf8_lossy(&buffer).into_owned())
    }
}
