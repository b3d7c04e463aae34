use std::collections::{HashMap, VecDeque};
use std::sync::{Arc, Mutex, PoisonError, RwLock};
use std::time::{Duration, Instant};

use prometheus::core::{Collector, Desc};
use prometheus::proto::{self, LabelPair, MetricFamily, MetricType};
use prometheus::Opts;
use quantiles::ckms::CKMS;

use crate::definition::{Instrument, MetricDefinition, MetricKind};
use crate::error::Result;

pub const DEFAULT_MAX_AGE: Duration = Duration::from_secs(10 * 60);
pub const DEFAULT_AGE_BUCKETS: u32 = 5;
/// rank error used when no objective asks for a tighter one
const DEFAULT_RANK_ERROR: f64 = 0.01;

/// A quantile to report, with the rank error it is allowed to have
#[derive(Clone, Copy, Debug, PartialEq)]
pub struct Objective {
    pub quantile: f64,
    pub error: f64,
}

pub fn default_objectives() -> Vec<Objective> {
    vec![
        Objective {
            quantile: 0.5,
            error: 0.05,
        },
        Objective {
            quantile: 0.9,
            error: 0.01,
        },
        Objective {
            quantile: 0.99,
            error: 0.001,
        },
    ]
}

/// Summary keyed by label values. Quantiles are estimated over observations
/// from the last `max_age`, using `age_buckets` staggered CKMS streams whose
/// rank error is the tightest objective error. Count and sum cover the whole
/// process lifetime.
#[derive(Clone)]
pub struct LabeledSummary {
    inner: Arc<SummaryInner>,
}

struct SummaryInner {
    definition: MetricDefinition,
    desc: Desc,
    objectives: Vec<Objective>,
    rank_error: f64,
    max_age: Duration,
    age_buckets: u32,
    cells: RwLock<HashMap<Vec<String>, Arc<Mutex<SampleWindow>>>>,
}

impl LabeledSummary {
    pub fn new(opts: Opts, objectives: Vec<Objective>, labels: &[&str]) -> Result<Self> {
        Self::with_window(opts, objectives, labels, DEFAULT_MAX_AGE, DEFAULT_AGE_BUCKETS)
    }

    pub fn with_window(
        opts: Opts,
        mut objectives: Vec<Objective>,
        labels: &[&str],
        max_age: Duration,
        age_buckets: u32,
    ) -> Result<Self> {
        let definition = MetricDefinition::new(MetricKind::Summary, &opts, labels);
        let desc = definition.desc()?;
        objectives.sort_by(|a, b| a.quantile.total_cmp(&b.quantile));
        let rank_error = objectives
            .iter()
            .map(|o| o.error)
            .filter(|e| *e > 0.0)
            .fold(DEFAULT_RANK_ERROR, f64::min);
        Ok(LabeledSummary {
            inner: Arc::new(SummaryInner {
                definition,
                desc,
                objectives,
                rank_error,
                max_age,
                age_buckets: age_buckets.max(1),
                cells: RwLock::new(HashMap::new()),
            }),
        })
    }

    pub fn observe(&self, values: &[&str], value: f64) -> Result<()> {
        self.observe_at(values, value, Instant::now())
    }

    pub(crate) fn observe_at(&self, values: &[&str], value: f64, now: Instant) -> Result<()> {
        self.inner.definition.check_labels(values)?;
        let cell = self.cell(values, now);
        cell.lock()
            .unwrap_or_else(PoisonError::into_inner)
            .observe(value, now);
        Ok(())
    }

    fn cell(&self, values: &[&str], now: Instant) -> Arc<Mutex<SampleWindow>> {
        let key: Vec<String> = values.iter().map(|v| (*v).to_owned()).collect();
        if let Some(cell) = self
            .inner
            .cells
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .get(&key)
        {
            return cell.clone();
        }

        let mut cells = self.inner.cells.write().unwrap_or_else(PoisonError::into_inner);
        cells
            .entry(key)
            .or_insert_with(|| {
                Arc::new(Mutex::new(SampleWindow::new(
                    now,
                    self.inner.max_age,
                    self.inner.age_buckets,
                    self.inner.rank_error,
                )))
            })
            .clone()
    }

    pub(crate) fn collect_at(&self, now: Instant) -> Vec<MetricFamily> {
        let mut family = MetricFamily::default();
        family.set_name(self.inner.definition.name().to_owned());
        family.set_help(self.inner.definition.help().to_owned());
        family.set_field_type(MetricType::SUMMARY);

        let cells = self.inner.cells.read().unwrap_or_else(PoisonError::into_inner);
        for (values, cell) in cells.iter() {
            let mut window = cell.lock().unwrap_or_else(PoisonError::into_inner);

            let mut summary = proto::Summary::default();
            summary.set_sample_count(window.count);
            summary.set_sample_sum(window.sum);
            for (objective, value) in self
                .inner
                .objectives
                .iter()
                .zip(window.quantiles(now, &self.inner.objectives))
            {
                let mut quantile = proto::Quantile::default();
                quantile.set_quantile(objective.quantile);
                quantile.set_value(value);
                summary.mut_quantile().push(quantile);
            }

            let mut metric = proto::Metric::default();
            let mut pairs: Vec<LabelPair> = self
                .inner
                .definition
                .labels()
                .iter()
                .zip(values)
                .map(|(name, value)| {
                    let mut pair = LabelPair::default();
                    pair.set_name(name.clone());
                    pair.set_value(value.clone());
                    pair
                })
                .collect();
            pairs.sort_by(|a, b| a.get_name().cmp(b.get_name()));
            for pair in pairs {
                metric.mut_label().push(pair);
            }
            metric.set_summary(summary);
            family.mut_metric().push(metric);
        }

        vec![family]
    }
}

impl Collector for LabeledSummary {
    fn desc(&self) -> Vec<&Desc> {
        vec![&self.inner.desc]
    }

    fn collect(&self) -> Vec<MetricFamily> {
        self.collect_at(Instant::now())
    }
}

impl Instrument for LabeledSummary {
    fn definition(&self) -> &MetricDefinition {
        &self.inner.definition
    }

    fn collector(&self) -> Box<dyn Collector> {
        Box::new(self.clone())
    }
}

/// Observations since `started`. Every stream in a window sees every
/// observation made after it was opened.
struct AgeStream {
    started: Instant,
    stream: CKMS<f64>,
}

struct SampleWindow {
    count: u64,
    sum: f64,
    rank_error: f64,
    max_age: Duration,
    bucket_width: Duration,
    streams: VecDeque<AgeStream>,
}

impl SampleWindow {
    fn new(now: Instant, max_age: Duration, age_buckets: u32, rank_error: f64) -> Self {
        let mut window = SampleWindow {
            count: 0,
            sum: 0.0,
            rank_error,
            max_age,
            bucket_width: max_age / age_buckets,
            streams: VecDeque::new(),
        };
        window.rotate(now);
        window
    }

    fn observe(&mut self, value: f64, now: Instant) {
        self.count += 1;
        self.sum += value;
        self.rotate(now);
        for age in self.streams.iter_mut() {
            age.stream.insert(value);
        }
    }

    fn expire(&mut self, now: Instant) {
        while let Some(front) = self.streams.front() {
            if now.saturating_duration_since(front.started) >= self.max_age {
                self.streams.pop_front();
            } else {
                break;
            }
        }
    }

    fn rotate(&mut self, now: Instant) {
        self.expire(now);
        let fresh = match self.streams.back() {
            Some(back) => now.saturating_duration_since(back.started) >= self.bucket_width,
            None => true,
        };
        if fresh {
            self.streams.push_back(AgeStream {
                started: now,
                stream: CKMS::new(self.rank_error),
            });
        }
    }

    /// Answered by the oldest live stream, which covers the most of the
    /// window. NaN for every objective when it holds no observations.
    fn quantiles(&mut self, now: Instant, objectives: &[Objective]) -> Vec<f64> {
        self.expire(now);
        match self.streams.front() {
            Some(oldest) => objectives
                .iter()
                .map(|o| {
                    oldest
                        .stream
                        .query(o.quantile)
                        .map_or(f64::NAN, |(_, value)| value)
                })
                .collect(),
            None => vec![f64::NAN; objectives.len()],
        }
    }
}
