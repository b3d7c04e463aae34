//! The fixed catalogue of controller metrics.
//!
//! - certificate_expiration_timestamp_seconds{name, namespace, issuer_name, issuer_kind, issuer_group}
//! - certificate_renewal_timestamp_seconds{name, namespace, issuer_name, issuer_kind, issuer_group}
//! - certificate_ready_status{name, namespace, condition, issuer_name, issuer_kind, issuer_group}
//! - current_certificate_request_count{name, namespace, issuer_name, issuer_kind, issuer_group}
//! - http_acme_client_request_count{scheme, host, path, method, status}
//! - http_acme_client_request_duration_seconds{scheme, host, path, method, status}
//! - http_venafi_client_request_duration_seconds{api_call}
//! - controller_sync_call_count{controller}
//! - controller_sync_error_count{controller}
//! - clock_time_seconds, clock_time_seconds_gauge

use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use crd::ConditionStatus;
use log::info;
use prometheus::Opts;
use utils::Clock;

use crate::definition::Instrument;
use crate::error::Result;
use crate::func::FuncMetric;
use crate::registry::{Registration, Registry};
use crate::summary::{default_objectives, LabeledSummary};
use crate::vec::{LabeledCounter, LabeledGauge};

/// Prefix for all metric names except current_certificate_request_count
pub const NAMESPACE: &str = "certmanager";

const CERTIFICATE_LABELS: [&str; 5] = [
    "name",
    "namespace",
    "issuer_name",
    "issuer_kind",
    "issuer_group",
];
const CLIENT_REQUEST_LABELS: [&str; 5] = ["scheme", "host", "path", "method", "status"];

/// A namespaced object issued by an issuer: a Certificate, or a
/// CertificateRequest when it appears in a listing snapshot.
#[derive(Clone, Debug, Default, PartialEq, Eq, Hash)]
pub struct ResourceRef {
    pub name: String,
    pub namespace: String,
    pub issuer_name: String,
    pub issuer_kind: String,
    pub issuer_group: String,
}

impl ResourceRef {
    pub fn new(
        name: &str,
        namespace: &str,
        issuer_name: &str,
        issuer_kind: &str,
        issuer_group: &str,
    ) -> Self {
        ResourceRef {
            name: name.to_owned(),
            namespace: namespace.to_owned(),
            issuer_name: issuer_name.to_owned(),
            issuer_kind: issuer_kind.to_owned(),
            issuer_group: issuer_group.to_owned(),
        }
    }

    /// values in the order of the certificate label keys
    pub fn label_values(&self) -> [&str; 5] {
        [
            &self.name,
            &self.namespace,
            &self.issuer_name,
            &self.issuer_kind,
            &self.issuer_group,
        ]
    }

    fn with_condition<'a>(&'a self, condition: &'a str) -> [&'a str; 6] {
        [
            &self.name,
            &self.namespace,
            condition,
            &self.issuer_name,
            &self.issuer_kind,
            &self.issuer_group,
        ]
    }
}

/// Labels of one outbound ACME HTTP call
#[derive(Clone, Copy, Debug)]
pub struct ClientRequest<'a> {
    pub scheme: &'a str,
    pub host: &'a str,
    pub path: &'a str,
    pub method: &'a str,
    pub status: u16,
}

/// Shared handle for updating every metric the controller exposes.
/// Cloning is cheap; clones update the same values.
#[derive(Clone)]
pub struct Metrics {
    registry: Registry,

    clock_time_seconds: FuncMetric,
    clock_time_seconds_gauge: FuncMetric,
    certificate_expiry_time_seconds: LabeledGauge,
    certificate_renewal_time_seconds: LabeledGauge,
    certificate_ready_status: LabeledGauge,
    acme_client_request_count: LabeledCounter,
    acme_client_request_duration_seconds: LabeledSummary,
    venafi_client_request_duration_seconds: LabeledSummary,
    controller_sync_call_count: LabeledCounter,
    controller_sync_error_count: LabeledCounter,
    pub(crate) certificate_request_count: LabeledGauge,
    /// held from listing to swap so recounts apply in the order they listed
    pub(crate) recount: Arc<tokio::sync::Mutex<()>>,
}

impl Metrics {
    /// Builds every instrument. Nothing is registered until `register`.
    pub fn new(registry: Registry, clock: Arc<dyn Clock>) -> Result<Self> {
        let counter_clock = clock.clone();
        // Deprecated in favour of clock_time_seconds_gauge: time can go
        // backwards, so it should never have been a counter.
        let clock_time_seconds = FuncMetric::counter(
            Opts::new(
                "clock_time_seconds",
                "DEPRECATED: use clock_time_seconds_gauge instead. The clock time given in seconds (from 1970/01/01 UTC).",
            )
            .namespace(NAMESPACE),
            move || counter_clock.now().timestamp() as f64,
        )?;

        let clock_time_seconds_gauge = FuncMetric::gauge(
            Opts::new(
                "clock_time_seconds_gauge",
                "The clock time given in seconds (from 1970/01/01 UTC).",
            )
            .namespace(NAMESPACE),
            move || clock.now().timestamp() as f64,
        )?;

        let certificate_expiry_time_seconds = LabeledGauge::new(
            Opts::new(
                "certificate_expiration_timestamp_seconds",
                "The date after which the certificate expires. Expressed as a Unix Epoch Time.",
            )
            .namespace(NAMESPACE),
            &CERTIFICATE_LABELS,
        )?;

        let certificate_renewal_time_seconds = LabeledGauge::new(
            Opts::new(
                "certificate_renewal_timestamp_seconds",
                "The number of seconds before expiration time the certificate should renew.",
            )
            .namespace(NAMESPACE),
            &CERTIFICATE_LABELS,
        )?;

        let certificate_ready_status = LabeledGauge::new(
            Opts::new(
                "certificate_ready_status",
                "The ready status of the certificate.",
            )
            .namespace(NAMESPACE),
            &[
                "name",
                "namespace",
                "condition",
                "issuer_name",
                "issuer_kind",
                "issuer_group",
            ],
        )?;

        let acme_client_request_count = LabeledCounter::new(
            Opts::new(
                "acme_client_request_count",
                "The number of requests made by the ACME client.",
            )
            .namespace(NAMESPACE)
            .subsystem("http"),
            &CLIENT_REQUEST_LABELS,
        )?;

        let acme_client_request_duration_seconds = LabeledSummary::new(
            Opts::new(
                "acme_client_request_duration_seconds",
                "The HTTP request latencies in seconds for the ACME client.",
            )
            .namespace(NAMESPACE)
            .subsystem("http"),
            default_objectives(),
            &CLIENT_REQUEST_LABELS,
        )?;

        // alpha, kept until it is clear it helps measure Venafi call latency
        let venafi_client_request_duration_seconds = LabeledSummary::new(
            Opts::new(
                "venafi_client_request_duration_seconds",
                "ALPHA: The HTTP request latencies in seconds for the Venafi client. This metric is currently alpha as we would like to understand whether it helps to measure Venafi call latency. Please leave feedback if you have any.",
            )
            .namespace(NAMESPACE)
            .subsystem("http"),
            default_objectives(),
            &["api_call"],
        )?;

        let controller_sync_call_count = LabeledCounter::new(
            Opts::new(
                "controller_sync_call_count",
                "The number of sync() calls made by a controller.",
            )
            .namespace(NAMESPACE),
            &["controller"],
        )?;

        let controller_sync_error_count = LabeledCounter::new(
            Opts::new(
                "controller_sync_error_count",
                "The number of errors encountered during controller sync().",
            )
            .namespace(NAMESPACE),
            &["controller"],
        )?;

        let certificate_request_count = LabeledGauge::new(
            Opts::new(
                "current_certificate_request_count",
                "The current number of certificate requests.",
            ),
            &CERTIFICATE_LABELS,
        )?;

        Ok(Metrics {
            registry,
            clock_time_seconds,
            clock_time_seconds_gauge,
            certificate_expiry_time_seconds,
            certificate_renewal_time_seconds,
            certificate_ready_status,
            acme_client_request_count,
            acme_client_request_duration_seconds,
            venafi_client_request_duration_seconds,
            controller_sync_call_count,
            controller_sync_error_count,
            certificate_request_count,
            recount: Arc::new(tokio::sync::Mutex::new(())),
        })
    }

    pub fn registry(&self) -> &Registry {
        &self.registry
    }

    pub fn instruments(&self) -> [&dyn Instrument; 11] {
        [
            &self.certificate_request_count,
            &self.clock_time_seconds,
            &self.clock_time_seconds_gauge,
            &self.certificate_expiry_time_seconds,
            &self.certificate_renewal_time_seconds,
            &self.certificate_ready_status,
            &self.acme_client_request_duration_seconds,
            &self.venafi_client_request_duration_seconds,
            &self.acme_client_request_count,
            &self.controller_sync_call_count,
            &self.controller_sync_error_count,
        ]
    }

    /// Attach every instrument to the registry. Safe to call repeatedly.
    pub fn register(&self) -> Vec<Registration> {
        self.registry.register_all(&self.instruments())
    }

    /// Increase the sync counter for that controller
    pub fn increment_sync_call_count(&self, controller_name: &str) -> Result<()> {
        self.controller_sync_call_count.inc(&[controller_name])
    }

    /// Increase the count of errors during sync of that controller
    pub fn increment_sync_error_count(&self, controller_name: &str) -> Result<()> {
        self.controller_sync_error_count.inc(&[controller_name])
    }

    pub fn update_certificate_expiry(
        &self,
        certificate: &ResourceRef,
        not_after: Option<DateTime<Utc>>,
    ) -> Result<()> {
        self.certificate_expiry_time_seconds
            .set(&certificate.label_values(), epoch_seconds(not_after))
    }

    pub fn update_certificate_renewal_time(
        &self,
        certificate: &ResourceRef,
        renewal_time: Option<DateTime<Utc>>,
    ) -> Result<()> {
        self.certificate_renewal_time_seconds
            .set(&certificate.label_values(), epoch_seconds(renewal_time))
    }

    /// Set the ready condition gauge to 1 for `status` and 0 for the others
    pub fn update_certificate_status(
        &self,
        certificate: &ResourceRef,
        status: ConditionStatus,
    ) -> Result<()> {
        for condition in ConditionStatus::ALL {
            let value = if condition == status { 1.0 } else { 0.0 };
            self.certificate_ready_status
                .set(&certificate.with_condition(condition.as_str()), value)?;
        }
        Ok(())
    }

    /// Forget every series of a deleted certificate
    pub fn remove_certificate(&self, certificate: &ResourceRef) -> Result<()> {
        let values = certificate.label_values();
        self.certificate_expiry_time_seconds.remove(&values)?;
        self.certificate_renewal_time_seconds.remove(&values)?;
        for condition in ConditionStatus::ALL {
            self.certificate_ready_status
                .remove(&certificate.with_condition(condition.as_str()))?;
        }
        info!(
            "Removed certificate metrics name={} namespace={}",
            certificate.name, certificate.namespace
        );
        Ok(())
    }

    pub fn increment_acme_request_count(&self, request: &ClientRequest<'_>) -> Result<()> {
        let status = request.status.to_string();
        self.acme_client_request_count.inc(&[
            request.scheme,
            request.host,
            request.path,
            request.method,
            &status,
        ])
    }

    pub fn observe_acme_request_duration(
        &self,
        request: &ClientRequest<'_>,
        duration: Duration,
    ) -> Result<()> {
        let status = request.status.to_string();
        self.acme_client_request_duration_seconds.observe(
            &[
                request.scheme,
                request.host,
                request.path,
                request.method,
                &status,
            ],
            duration.as_secs_f64(),
        )
    }

    pub fn observe_venafi_request_duration(&self, api_call: &str, duration: Duration) -> Result<()> {
        self.venafi_client_request_duration_seconds
            .observe(&[api_call], duration.as_secs_f64())
    }
}

fn epoch_seconds(time: Option<DateTime<Utc>>) -> f64 {
    time.map(|t| t.timestamp() as f64).unwrap_or(0.0)
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use chrono::TimeZone;
    use utils::FakeClock;

    pub(crate) fn fixed_clock() -> Arc<FakeClock> {
        Arc::new(FakeClock::new(Utc.timestamp_opt(1_700_000_000, 0).unwrap()))
    }

    pub(crate) fn new_metrics() -> Metrics {
        let metrics = Metrics::new(Registry::new(), fixed_clock()).unwrap();
        metrics.register();
        metrics
    }

    /// value of the sample `metric{labels...}` in an exposition body
    pub(crate) fn sample(body: &str, metric: &str, labels: &[(&str, &str)]) -> Option<f64> {
        body.lines()
            .filter(|line| !line.starts_with('#'))
            .filter(|line| {
                line.strip_prefix(metric)
                    .map_or(false, |rest| rest.starts_with('{') || rest.starts_with(' '))
            })
            .find(|line| {
                labels
                    .iter()
                    .all(|(k, v)| line.contains(&format!("{}=\"{}\"", k, v)))
            })
            .and_then(|line| line.rsplit(' ').next())
            .and_then(|value| value.parse().ok())
    }

    fn cert_a() -> ResourceRef {
        ResourceRef::new("cert-a", "ns1", "issuer1", "ClusterIssuer", "cert-manager.io")
    }

    #[test]
    fn test_register_twice_keeps_one_instance_each() {
        let metrics = new_metrics();
        let outcomes = metrics.register();

        assert!(outcomes.iter().all(|o| *o == Registration::Replaced));
        assert_eq!(metrics.registry().definitions().len(), 11);
    }

    #[test]
    fn test_metric_names() {
        let metrics = new_metrics();
        let names: Vec<String> = metrics
            .registry()
            .definitions()
            .iter()
            .map(|d| d.name().to_owned())
            .collect();

        for expected in [
            "certmanager_certificate_expiration_timestamp_seconds",
            "certmanager_certificate_renewal_timestamp_seconds",
            "certmanager_certificate_ready_status",
            "current_certificate_request_count",
            "certmanager_http_acme_client_request_count",
            "certmanager_http_acme_client_request_duration_seconds",
            "certmanager_http_venafi_client_request_duration_seconds",
            "certmanager_controller_sync_call_count",
            "certmanager_controller_sync_error_count",
            "certmanager_clock_time_seconds",
            "certmanager_clock_time_seconds_gauge",
        ] {
            assert!(names.iter().any(|n| n == expected), "missing {}", expected);
        }
    }

    #[test]
    fn test_clock_metrics_follow_injected_clock() {
        let clock = fixed_clock();
        let metrics = Metrics::new(Registry::new(), clock.clone()).unwrap();
        metrics.register();

        let body = metrics.registry().encode_text().unwrap();
        assert_eq!(sample(&body, "certmanager_clock_time_seconds", &[]), Some(1.7e9));
        assert_eq!(sample(&body, "certmanager_clock_time_seconds_gauge", &[]), Some(1.7e9));

        clock.step(chrono::Duration::seconds(-10));
        let body = metrics.registry().encode_text().unwrap();
        assert_eq!(
            sample(&body, "certmanager_clock_time_seconds_gauge", &[]),
            Some(1_699_999_990.0)
        );
        assert!(body.contains("# TYPE certmanager_clock_time_seconds counter"));
        assert!(body.contains("# TYPE certmanager_clock_time_seconds_gauge gauge"));
    }

    #[test]
    fn test_sync_counts() {
        let metrics = new_metrics();
        metrics.increment_sync_call_count("certificates").unwrap();
        metrics.increment_sync_call_count("certificates").unwrap();
        metrics.increment_sync_error_count("certificates").unwrap();

        let body = metrics.registry().encode_text().unwrap();
        let controller = [("controller", "certificates")];
        assert_eq!(
            sample(&body, "certmanager_controller_sync_call_count", &controller),
            Some(2.0)
        );
        assert_eq!(
            sample(&body, "certmanager_controller_sync_error_count", &controller),
            Some(1.0)
        );
    }

    #[test]
    fn test_certificate_expiry_renewal_and_status() {
        let metrics = new_metrics();
        let cert = cert_a();
        let expiry = Utc.timestamp_opt(1_800_000_000, 0).unwrap();

        metrics.update_certificate_expiry(&cert, Some(expiry)).unwrap();
        metrics.update_certificate_renewal_time(&cert, None).unwrap();
        metrics
            .update_certificate_status(&cert, ConditionStatus::True)
            .unwrap();

        let body = metrics.registry().encode_text().unwrap();
        let name = [("name", "cert-a"), ("issuer_kind", "ClusterIssuer")];
        assert_eq!(
            sample(&body, "certmanager_certificate_expiration_timestamp_seconds", &name),
            Some(1.8e9)
        );
        assert_eq!(
            sample(&body, "certmanager_certificate_renewal_timestamp_seconds", &name),
            Some(0.0)
        );
        for (condition, expected) in [("True", 1.0), ("False", 0.0), ("Unknown", 0.0)] {
            assert_eq!(
                sample(
                    &body,
                    "certmanager_certificate_ready_status",
                    &[("name", "cert-a"), ("condition", condition)]
                ),
                Some(expected)
            );
        }
    }

    #[test]
    fn test_remove_certificate() {
        let metrics = new_metrics();
        let cert = cert_a();
        metrics.update_certificate_expiry(&cert, None).unwrap();
        metrics
            .update_certificate_status(&cert, ConditionStatus::False)
            .unwrap();

        metrics.remove_certificate(&cert).unwrap();
        // removing again is harmless
        metrics.remove_certificate(&cert).unwrap();

        let body = metrics.registry().encode_text().unwrap();
        assert!(!body.contains("cert-a"));
    }

    #[test]
    fn test_acme_and_venafi_client_metrics() {
        let metrics = new_metrics();
        let request = ClientRequest {
            scheme: "https",
            host: "acme-v02.api.letsencrypt.org",
            path: "/acme/new-order",
            method: "POST",
            status: 201,
        };
        metrics.increment_acme_request_count(&request).unwrap();
        metrics
            .observe_acme_request_duration(&request, Duration::from_millis(250))
            .unwrap();
        metrics
            .observe_venafi_request_duration("request_certificate", Duration::from_secs(2))
            .unwrap();

        let body = metrics.registry().encode_text().unwrap();
        assert_eq!(
            sample(
                &body,
                "certmanager_http_acme_client_request_count",
                &[("status", "201"), ("method", "POST")]
            ),
            Some(1.0)
        );
        assert_eq!(
            sample(
                &body,
                "certmanager_http_acme_client_request_duration_seconds",
                &[("quantile", "0.5"), ("path", "/acme/new-order")]
            ),
            Some(0.25)
        );
        assert_eq!(
            sample(
                &body,
                "certmanager_http_venafi_client_request_duration_seconds_count",
                &[("api_call", "request_certificate")]
            ),
            Some(1.0)
        );
        assert!(body.contains("# TYPE certmanager_http_venafi_client_request_duration_seconds summary"));
    }
}
