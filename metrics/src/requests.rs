use std::fmt;

use async_trait::async_trait;
use log::{debug, error, info};

use crate::error::{Error, Result};
use crate::metrics::{Metrics, ResourceRef};

/// One CertificateRequest from a full listing
pub type CertificateRequestRecord = ResourceRef;

/// The authoritative source for current_certificate_request_count
#[async_trait]
pub trait CertificateRequestLister: Send + Sync {
    async fn list_certificate_requests(&self) -> anyhow::Result<Vec<CertificateRequestRecord>>;
}

/// What happened to the CertificateRequest that triggered a recount
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ResourceEvent {
    Applied,
    Deleted,
}

impl fmt::Display for ResourceEvent {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ResourceEvent::Applied => f.write_str("apply"),
            ResourceEvent::Deleted => f.write_str("delete"),
        }
    }
}

impl Metrics {
    /// Increase the certificate request count by one
    pub fn increment_certificate_request_count(&self, labels: &[&str]) -> Result<()> {
        self.certificate_request_count.inc(labels)
    }

    /// Decrease the certificate request count by one
    pub fn decrement_certificate_request_count(&self, labels: &[&str]) -> Result<()> {
        self.certificate_request_count.dec(labels)
    }

    pub fn increment_current_certificate_request(
        &self,
        name: &str,
        namespace: &str,
        issuer_name: &str,
        issuer_kind: &str,
        issuer_group: &str,
    ) -> Result<()> {
        info!(
            "Incrementing certificateRequestCount name={} namespace={} issuerName={} issuerKind={} issuerGroup={}",
            name, namespace, issuer_name, issuer_kind, issuer_group
        );
        self.increment_certificate_request_count(&[
            name,
            namespace,
            issuer_name,
            issuer_kind,
            issuer_group,
        ])
    }

    pub fn decrement_current_certificate_request(
        &self,
        name: &str,
        namespace: &str,
        issuer_name: &str,
        issuer_kind: &str,
        issuer_group: &str,
    ) -> Result<()> {
        info!(
            "Decrementing certificateRequestCount name={} namespace={} issuerName={} issuerKind={} issuerGroup={}",
            name, namespace, issuer_name, issuer_kind, issuer_group
        );
        self.decrement_certificate_request_count(&[
            name,
            namespace,
            issuer_name,
            issuer_kind,
            issuer_group,
        ])
    }

    /// Replace current_certificate_request_count with one count per record,
    /// grouped by label values. Scrapes see either the old counts or the new
    /// ones in full.
    pub fn update_current_count(&self, records: &[CertificateRequestRecord]) -> Result<()> {
        self.certificate_request_count.rebuild(|cells| {
            for record in records {
                cells
                    .get_metric_with_label_values(&record.label_values())?
                    .inc();
            }
            Ok(())
        })?;
        debug!(
            "Recomputed certificateRequestCount from {} certificate requests",
            records.len()
        );
        Ok(())
    }

    /// List every CertificateRequest and recompute the count. On a list
    /// failure the previous counts stay exposed. Concurrent refreshes run
    /// one at a time, so a slow listing never overwrites a newer one.
    pub async fn refresh_certificate_request_count<L>(&self, lister: &L) -> Result<usize>
    where
        L: CertificateRequestLister + ?Sized,
    {
        let _recount = self.recount.lock().await;
        let records = lister
            .list_certificate_requests()
            .await
            .map_err(Error::List)?;
        self.update_current_count(&records)?;
        Ok(records.len())
    }

    /// Entry point for the CertificateRequest event source. Any change
    /// triggers a full recount rather than an incremental update.
    pub async fn handle_certificate_request_event<L>(
        &self,
        lister: &L,
        object: &CertificateRequestRecord,
        event: ResourceEvent,
    ) where
        L: CertificateRequestLister + ?Sized,
    {
        debug!(
            "CertificateRequest {} event for {}/{}",
            event, object.namespace, object.name
        );
        if let Err(err) = self.refresh_certificate_request_count(lister).await {
            error!(
                "Skipping certificateRequestCount recount after {} of {}/{}: {}",
                event, object.namespace, object.name, err
            );
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::metrics::tests::{new_metrics, sample};
    use anyhow::anyhow;
    use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
    use std::sync::{Arc, Barrier, Mutex};
    use std::time::Duration;
    use tokio::sync::Notify;

    const COUNT: &str = "current_certificate_request_count";

    #[derive(Default)]
    struct FakeLister {
        records: Mutex<Vec<CertificateRequestRecord>>,
        fail: AtomicBool,
    }

    impl FakeLister {
        fn set(&self, records: Vec<CertificateRequestRecord>) {
            *self.records.lock().unwrap() = records;
        }
    }

    #[async_trait]
    impl CertificateRequestLister for FakeLister {
        async fn list_certificate_requests(
            &self,
        ) -> anyhow::Result<Vec<CertificateRequestRecord>> {
            if self.fail.load(Ordering::SeqCst) {
                return Err(anyhow!("connection refused"));
            }
            Ok(self.records.lock().unwrap().clone())
        }
    }

    fn record(name: &str, namespace: &str) -> CertificateRequestRecord {
        ResourceRef::new(name, namespace, "issuer1", "ClusterIssuer", "cert-manager.io")
    }

    fn count(metrics: &Metrics, name: &str, namespace: &str) -> Option<f64> {
        let body = metrics.registry().encode_text().unwrap();
        sample(&body, COUNT, &[("name", name), ("namespace", namespace)])
    }

    fn exposed_series(metrics: &Metrics) -> usize {
        let body = metrics.registry().encode_text().unwrap();
        body.lines()
            .filter(|l| l.starts_with(&format!("{}{{", COUNT)))
            .count()
    }

    #[test]
    fn test_increment_then_recompute_wins() {
        let metrics = new_metrics();
        for _ in 0..2 {
            metrics
                .increment_current_certificate_request(
                    "cert-a",
                    "ns1",
                    "issuer1",
                    "ClusterIssuer",
                    "cert-manager.io",
                )
                .unwrap();
        }
        assert_eq!(count(&metrics, "cert-a", "ns1"), Some(2.0));

        metrics
            .update_current_count(&[record("cert-a", "ns1")])
            .unwrap();
        assert_eq!(count(&metrics, "cert-a", "ns1"), Some(1.0));
    }

    #[test]
    fn test_decrement() {
        let metrics = new_metrics();
        let labels = ["cert-a", "ns1", "issuer1", "Issuer", "cert-manager.io"];
        metrics.increment_certificate_request_count(&labels).unwrap();
        metrics.decrement_certificate_request_count(&labels).unwrap();
        metrics.decrement_certificate_request_count(&labels).unwrap();

        assert_eq!(count(&metrics, "cert-a", "ns1"), Some(-1.0));
    }

    #[test]
    fn test_label_mismatch_is_an_error() {
        let metrics = new_metrics();
        let result = metrics.increment_certificate_request_count(&["cert-a", "ns1"]);

        assert!(matches!(
            result,
            Err(Error::LabelMismatch { expected: 5, got: 2, .. })
        ));
        assert_eq!(exposed_series(&metrics), 0);
    }

    #[test]
    fn test_recompute_groups_by_label_values() {
        let metrics = new_metrics();
        metrics
            .update_current_count(&[
                record("cert-a", "ns1"),
                record("cert-a", "ns1"),
                record("cert-b", "ns2"),
            ])
            .unwrap();

        assert_eq!(count(&metrics, "cert-a", "ns1"), Some(2.0));
        assert_eq!(count(&metrics, "cert-b", "ns2"), Some(1.0));
    }

    #[test]
    fn test_recompute_is_idempotent() {
        let metrics = new_metrics();
        let snapshot = vec![record("cert-a", "ns1"), record("cert-b", "ns1")];

        metrics.update_current_count(&snapshot).unwrap();
        let once = metrics.registry().encode_text().unwrap();
        metrics.update_current_count(&snapshot).unwrap();
        let twice = metrics.registry().encode_text().unwrap();

        assert_eq!(once, twice);
    }

    #[test]
    fn test_empty_snapshot_clears_everything() {
        let metrics = new_metrics();
        metrics
            .increment_current_certificate_request("stale", "ns1", "i", "Issuer", "g")
            .unwrap();
        metrics
            .update_current_count(&[record("cert-a", "ns1")])
            .unwrap();

        metrics.update_current_count(&[]).unwrap();
        assert_eq!(exposed_series(&metrics), 0);
    }

    #[test]
    fn test_concurrent_increments_on_distinct_tuples() {
        let metrics = new_metrics();
        let workers: Vec<_> = (0..8)
            .map(|worker| {
                let metrics = metrics.clone();
                std::thread::spawn(move || {
                    let name = format!("cert-{}", worker % 4);
                    for i in 0..200 {
                        let labels = [name.as_str(), "ns1", "issuer1", "Issuer", "cert-manager.io"];
                        if i % 4 == 3 {
                            metrics.decrement_certificate_request_count(&labels).unwrap();
                        } else {
                            metrics.increment_certificate_request_count(&labels).unwrap();
                        }
                    }
                })
            })
            .collect();
        for worker in workers {
            worker.join().unwrap();
        }

        // two workers per tuple, 150 increments and 50 decrements each
        for n in 0..4 {
            assert_eq!(
                count(&metrics, &format!("cert-{}", n), "ns1"),
                Some(200.0)
            );
        }
    }

    #[test]
    fn test_scrape_during_recompute_sees_previous_counts() {
        let metrics = new_metrics();
        metrics
            .update_current_count(&[record("old-0", "ns1"), record("old-1", "ns1")])
            .unwrap();

        let filled = Arc::new(Barrier::new(2));
        let resume = Arc::new(Barrier::new(2));
        let writer = {
            let metrics = metrics.clone();
            let filled = filled.clone();
            let resume = resume.clone();
            std::thread::spawn(move || {
                metrics.certificate_request_count.rebuild(|cells| {
                    for n in 0..2 {
                        let fresh = record(&format!("new-{}", n), "ns1");
                        cells.get_metric_with_label_values(&fresh.label_values())?.inc();
                    }
                    filled.wait();
                    resume.wait();
                    Ok(())
                })
            })
        };

        // replacement fully populated but not swapped in yet
        filled.wait();
        assert_eq!(count(&metrics, "old-0", "ns1"), Some(1.0));
        assert_eq!(count(&metrics, "old-1", "ns1"), Some(1.0));
        assert_eq!(count(&metrics, "new-0", "ns1"), None);
        assert_eq!(exposed_series(&metrics), 2);
        resume.wait();
        writer.join().unwrap().unwrap();

        assert_eq!(count(&metrics, "old-0", "ns1"), None);
        assert_eq!(count(&metrics, "new-0", "ns1"), Some(1.0));
        assert_eq!(count(&metrics, "new-1", "ns1"), Some(1.0));
    }

    /// Lister whose first call captures its records, then stalls until released
    #[derive(Default)]
    struct StallingLister {
        records: Mutex<Vec<CertificateRequestRecord>>,
        calls: AtomicUsize,
        listed: Notify,
        release: Notify,
    }

    #[async_trait]
    impl CertificateRequestLister for StallingLister {
        async fn list_certificate_requests(
            &self,
        ) -> anyhow::Result<Vec<CertificateRequestRecord>> {
            let records = self.records.lock().unwrap().clone();
            if self.calls.fetch_add(1, Ordering::SeqCst) == 0 {
                self.listed.notify_one();
                self.release.notified().await;
            }
            Ok(records)
        }
    }

    #[tokio::test]
    async fn test_slow_resync_does_not_undo_newer_recount() {
        let metrics = new_metrics();
        let lister = Arc::new(StallingLister::default());
        *lister.records.lock().unwrap() = vec![record("cert-a", "ns1"), record("cert-b", "ns1")];

        let resync = {
            let metrics = metrics.clone();
            let lister = lister.clone();
            tokio::spawn(async move { metrics.refresh_certificate_request_count(lister.as_ref()).await })
        };
        lister.listed.notified().await;

        // cert-b is deleted while the resync still holds its old listing
        *lister.records.lock().unwrap() = vec![record("cert-a", "ns1")];
        let mut deleted = {
            let metrics = metrics.clone();
            let lister = lister.clone();
            tokio::spawn(async move {
                metrics
                    .handle_certificate_request_event(
                        lister.as_ref(),
                        &record("cert-b", "ns1"),
                        ResourceEvent::Deleted,
                    )
                    .await
            })
        };
        assert!(
            tokio::time::timeout(Duration::from_millis(50), &mut deleted)
                .await
                .is_err()
        );

        lister.release.notify_one();
        assert_eq!(resync.await.unwrap().unwrap(), 2);
        deleted.await.unwrap();

        assert_eq!(count(&metrics, "cert-a", "ns1"), Some(1.0));
        assert_eq!(count(&metrics, "cert-b", "ns1"), None);
    }

    #[tokio::test]
    async fn test_event_triggers_full_recount() {
        let metrics = new_metrics();
        let lister = FakeLister::default();
        lister.set(vec![record("cert-a", "ns1"), record("cert-b", "ns1")]);

        metrics
            .handle_certificate_request_event(&lister, &record("cert-b", "ns1"), ResourceEvent::Applied)
            .await;
        assert_eq!(count(&metrics, "cert-a", "ns1"), Some(1.0));
        assert_eq!(count(&metrics, "cert-b", "ns1"), Some(1.0));

        lister.set(vec![record("cert-a", "ns1")]);
        metrics
            .handle_certificate_request_event(&lister, &record("cert-b", "ns1"), ResourceEvent::Deleted)
            .await;
        assert_eq!(count(&metrics, "cert-b", "ns1"), None);
    }

    #[tokio::test]
    async fn test_failed_listing_keeps_previous_counts() {
        let metrics = new_metrics();
        let lister = FakeLister::default();
        lister.set(vec![record("cert-a", "ns1")]);
        assert_eq!(metrics.refresh_certificate_request_count(&lister).await.unwrap(), 1);

        lister.fail.store(true, Ordering::SeqCst);
        assert!(matches!(
            metrics.refresh_certificate_request_count(&lister).await,
            Err(Error::List(_))
        ));
        metrics
            .handle_certificate_request_event(&lister, &record("cert-a", "ns1"), ResourceEvent::Applied)
            .await;

        assert_eq!(count(&metrics, "cert-a", "ns1"), Some(1.0));
    }

    #[tokio::test]
    async fn test_lister_as_trait_object() {
        let metrics = new_metrics();
        let lister: Arc<dyn CertificateRequestLister> = Arc::new(FakeLister::default());

        assert_eq!(
            metrics
                .refresh_certificate_request_count(lister.as_ref())
                .await
                .unwrap(),
            0
        );
    }
}
