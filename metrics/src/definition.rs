use std::collections::HashMap;
use std::fmt;

use prometheus::core::{Collector, Desc};
use prometheus::Opts;

use crate::error::{Error, Result};

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum MetricKind {
    Counter,
    Gauge,
    CounterFunc,
    GaugeFunc,
    Summary,
}

impl MetricKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            MetricKind::Counter => "counter",
            MetricKind::Gauge => "gauge",
            MetricKind::CounterFunc => "counter_func",
            MetricKind::GaugeFunc => "gauge_func",
            MetricKind::Summary => "summary",
        }
    }
}

/// Name, help, kind and label keys of one metric. Two instruments built
/// from equal definitions are the same metric as far as the registry cares.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct MetricDefinition {
    name: String,
    help: String,
    kind: MetricKind,
    labels: Vec<String>,
}

impl MetricDefinition {
    pub fn new(kind: MetricKind, opts: &Opts, labels: &[&str]) -> Self {
        MetricDefinition {
            name: opts.fq_name(),
            help: opts.help.clone(),
            kind,
            labels: labels.iter().map(|l| (*l).to_owned()).collect(),
        }
    }

    /// fully qualified name, namespace and subsystem included
    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn help(&self) -> &str {
        &self.help
    }

    pub fn kind(&self) -> MetricKind {
        self.kind
    }

    pub fn labels(&self) -> &[String] {
        &self.labels
    }

    pub fn check_labels(&self, values: &[&str]) -> Result<()> {
        if values.len() != self.labels.len() {
            return Err(Error::LabelMismatch {
                metric: self.name.clone(),
                expected: self.labels.len(),
                got: values.len(),
            });
        }
        Ok(())
    }

    pub(crate) fn desc(&self) -> Result<Desc> {
        Ok(Desc::new(
            self.name.clone(),
            self.help.clone(),
            self.labels.clone(),
            HashMap::new(),
        )?)
    }
}

impl fmt::Display for MetricDefinition {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "Desc{{fqName: {:?}, help: {:?}, kind: {}, variableLabels: [{}]}}",
            self.name,
            self.help,
            self.kind.as_str(),
            self.labels.join(" ")
        )
    }
}

/// A collector that knows its own definition
pub trait Instrument: Send + Sync {
    fn definition(&self) -> &MetricDefinition;

    /// a handle onto the same live values, for handing to a registry
    fn collector(&self) -> Box<dyn Collector>;
}
