use std::sync::Arc;

use prometheus::core::{Collector, Desc};
use prometheus::proto::{self, MetricFamily, MetricType};
use prometheus::Opts;

use crate::definition::{Instrument, MetricDefinition, MetricKind};
use crate::error::Result;

type ValueFn = dyn Fn() -> f64 + Send + Sync;

/// Unlabeled metric whose value is computed by a closure on every collect
#[derive(Clone)]
pub struct FuncMetric {
    inner: Arc<FuncInner>,
}

struct FuncInner {
    definition: MetricDefinition,
    desc: Desc,
    value: Box<ValueFn>,
}

impl FuncMetric {
    pub fn counter<F>(opts: Opts, value: F) -> Result<Self>
    where
        F: Fn() -> f64 + Send + Sync + 'static,
    {
        Self::new(MetricKind::CounterFunc, opts, Box::new(value))
    }

    pub fn gauge<F>(opts: Opts, value: F) -> Result<Self>
    where
        F: Fn() -> f64 + Send + Sync + 'static,
    {
        Self::new(MetricKind::GaugeFunc, opts, Box::new(value))
    }

    fn new(kind: MetricKind, opts: Opts, value: Box<ValueFn>) -> Result<Self> {
        let definition = MetricDefinition::new(kind, &opts, &[]);
        let desc = definition.desc()?;
        Ok(FuncMetric {
            inner: Arc::new(FuncInner {
                definition,
                desc,
                value,
            }),
        })
    }

    pub fn value(&self) -> f64 {
        (self.inner.value)()
    }
}

impl Collector for FuncMetric {
    fn desc(&self) -> Vec<&Desc> {
        vec![&self.inner.desc]
    }

    fn collect(&self) -> Vec<MetricFamily> {
        let value = self.value();
        let mut metric = proto::Metric::default();
        let mut family = MetricFamily::default();
        family.set_name(self.inner.definition.name().to_owned());
        family.set_help(self.inner.definition.help().to_owned());

        if self.inner.definition.kind() == MetricKind::CounterFunc {
            let mut counter = proto::Counter::default();
            counter.set_value(value);
            metric.set_counter(counter);
            family.set_field_type(MetricType::COUNTER);
        } else {
            let mut gauge = proto::Gauge::default();
            gauge.set_value(value);
            metric.set_gauge(gauge);
            family.set_field_type(MetricType::GAUGE);
        }

        family.mut_metric().push(metric);
        vec![family]
    }
}

impl Instrument for FuncMetric {
    fn definition(&self) -> &MetricDefinition {
        &self.inner.definition
    }

    fn collector(&self) -> Box<dyn Collector> {
        Box::new(self.clone())
    }
}
