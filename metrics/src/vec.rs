use std::sync::{Arc, PoisonError, RwLock};

use prometheus::core::{Collector, Desc};
use prometheus::proto::MetricFamily;
use prometheus::{CounterVec, GaugeVec, Opts};

use crate::definition::{Instrument, MetricDefinition, MetricKind};
use crate::error::Result;

/// Gauge keyed by label values.
///
/// The label-value map sits behind a lock so a full recomputation can build
/// a replacement map and swap it in at once: a concurrent collect sees the
/// old map or the new one, never a half-reset one. Updates to single cells
/// only take the lock shared.
#[derive(Clone)]
pub struct LabeledGauge {
    inner: Arc<GaugeInner>,
}

struct GaugeInner {
    definition: MetricDefinition,
    desc: Desc,
    opts: Opts,
    cells: RwLock<GaugeVec>,
}

impl LabeledGauge {
    pub fn new(opts: Opts, labels: &[&str]) -> Result<Self> {
        let definition = MetricDefinition::new(MetricKind::Gauge, &opts, labels);
        let desc = definition.desc()?;
        let cells = GaugeVec::new(opts.clone(), labels)?;
        Ok(LabeledGauge {
            inner: Arc::new(GaugeInner {
                definition,
                desc,
                opts,
                cells: RwLock::new(cells),
            }),
        })
    }

    pub fn set(&self, values: &[&str], value: f64) -> Result<()> {
        self.inner.definition.check_labels(values)?;
        let cells = self.inner.cells.read().unwrap_or_else(PoisonError::into_inner);
        cells.get_metric_with_label_values(values)?.set(value);
        Ok(())
    }

    pub fn add(&self, values: &[&str], delta: f64) -> Result<()> {
        self.inner.definition.check_labels(values)?;
        let cells = self.inner.cells.read().unwrap_or_else(PoisonError::into_inner);
        cells.get_metric_with_label_values(values)?.add(delta);
        Ok(())
    }

    pub fn inc(&self, values: &[&str]) -> Result<()> {
        self.add(values, 1.0)
    }

    pub fn dec(&self, values: &[&str]) -> Result<()> {
        self.add(values, -1.0)
    }

    /// Drops one label tuple. Returns false when it was not present.
    pub fn remove(&self, values: &[&str]) -> Result<bool> {
        self.inner.definition.check_labels(values)?;
        let cells = self.inner.cells.read().unwrap_or_else(PoisonError::into_inner);
        Ok(cells.remove_label_values(values).is_ok())
    }

    /// Current value of one label tuple, without creating it
    pub fn value(&self, values: &[&str]) -> Option<f64> {
        let cells = self.inner.cells.read().unwrap_or_else(PoisonError::into_inner);
        cells
            .collect()
            .iter()
            .flat_map(|mf| mf.get_metric().iter())
            .find(|m| label_values_match(&self.inner.definition, m, values))
            .map(|m| m.get_gauge().get_value())
    }

    /// Builds an empty replacement map, lets `populate` fill it, then swaps
    /// it in. If `populate` fails the current values stay in place.
    pub fn rebuild<F>(&self, populate: F) -> Result<()>
    where
        F: FnOnce(&GaugeVec) -> Result<()>,
    {
        let labels: Vec<&str> = self
            .inner
            .definition
            .labels()
            .iter()
            .map(String::as_str)
            .collect();
        let fresh = GaugeVec::new(self.inner.opts.clone(), &labels)?;
        populate(&fresh)?;

        let mut cells = self.inner.cells.write().unwrap_or_else(PoisonError::into_inner);
        *cells = fresh;
        Ok(())
    }
}

impl Collector for LabeledGauge {
    fn desc(&self) -> Vec<&Desc> {
        vec![&self.inner.desc]
    }

    fn collect(&self) -> Vec<MetricFamily> {
        self.inner
            .cells
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .collect()
    }
}

impl Instrument for LabeledGauge {
    fn definition(&self) -> &MetricDefinition {
        &self.inner.definition
    }

    fn collector(&self) -> Box<dyn Collector> {
        Box::new(self.clone())
    }
}

/// Monotonic counter keyed by label values
#[derive(Clone)]
pub struct LabeledCounter {
    definition: Arc<MetricDefinition>,
    cells: CounterVec,
}

impl LabeledCounter {
    pub fn new(opts: Opts, labels: &[&str]) -> Result<Self> {
        let definition = MetricDefinition::new(MetricKind::Counter, &opts, labels);
        Ok(LabeledCounter {
            cells: CounterVec::new(opts, labels)?,
            definition: Arc::new(definition),
        })
    }

    pub fn inc(&self, values: &[&str]) -> Result<()> {
        self.definition.check_labels(values)?;
        self.cells.get_metric_with_label_values(values)?.inc();
        Ok(())
    }

    pub fn value(&self, values: &[&str]) -> Option<f64> {
        self.cells
            .collect()
            .iter()
            .flat_map(|mf| mf.get_metric().iter())
            .find(|m| label_values_match(&self.definition, m, values))
            .map(|m| m.get_counter().get_value())
    }
}

impl Collector for LabeledCounter {
    fn desc(&self) -> Vec<&Desc> {
        self.cells.desc()
    }

    fn collect(&self) -> Vec<MetricFamily> {
        self.cells.collect()
    }
}

impl Instrument for LabeledCounter {
    fn definition(&self) -> &MetricDefinition {
        &self.definition
    }

    fn collector(&self) -> Box<dyn Collector> {
        Box::new(self.clone())
    }
}

// label pairs on a collected metric are sorted by name, so look each key up
fn label_values_match(
    definition: &MetricDefinition,
    metric: &prometheus::proto::Metric,
    values: &[&str],
) -> bool {
    definition.labels().len() == values.len()
        && definition.labels().iter().zip(values).all(|(key, value)| {
            metric
                .get_label()
                .iter()
                .any(|pair| pair.get_name() == key && pair.get_value() == *value)
        })
}
