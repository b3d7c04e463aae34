use anyhow::Result;
use futures::{future::BoxFuture, FutureExt, StreamExt};
use kube::{
    api::{Api, ListParams, ResourceExt},
    runtime::{
        controller::{Action, Controller},
        watcher, WatchStreamExt,
    },
    Client, Resource,
};
use std::sync::Arc;
use tokio::time::{Duration, MissedTickBehavior};

use log::{error, info, warn};

use crd::{CertificateRequest, ConditionStatus};
use k8s::{certificate_request_record, KubeCertificateRequestLister};
use metrics::{Metrics, ResourceEvent};
use utils::ControllerConfig;

/// controller label on the sync call and error counters
pub const CONTROLLER_NAME: &str = "certificaterequests";

/// All errors possible to occur during reconciliation
#[derive(Debug, thiserror::Error)]
pub enum Error {
    /// Error in the CertificateRequest resource itself, typically missing fields.
    #[error("Invalid CertificateRequest: {0}")]
    UserInputError(String),

    #[error("Metrics Error: {0}")]
    MetricsError(#[from] metrics::Error),
}

async fn reconcile(cr: Arc<CertificateRequest>, ctx: Arc<ContextData>) -> Result<Action, Error> {
    ctx.metrics.increment_sync_call_count(CONTROLLER_NAME)?;

    let name = cr.name_any();
    let ns = cr.namespace().ok_or_else(|| {
        Error::UserInputError(format!(
            "expected CertificateRequest {} to be namespaced",
            name
        ))
    })?;

    match determine_action(&cr) {
        CertificateRequestAction::Deleting => {
            info!("CertificateRequest {} in namespace {} is being deleted", name, ns);
            Ok(Action::await_change())
        }
        CertificateRequestAction::Settled => Ok(Action::await_change()),
        CertificateRequestAction::Pending => {
            info!("CertificateRequest {} in namespace {} is not ready yet", name, ns);
            Ok(Action::requeue(Duration::from_secs(20)))
        }
    }
}

#[derive(Debug, PartialEq, Eq)]
enum CertificateRequestAction {
    Deleting,
    Settled,
    Pending,
}

fn determine_action(cr: &CertificateRequest) -> CertificateRequestAction {
    if cr.meta().deletion_timestamp.is_some() {
        CertificateRequestAction::Deleting
    } else if cr.ready_status() == Some(ConditionStatus::True) {
        CertificateRequestAction::Settled
    } else {
        CertificateRequestAction::Pending
    }
}

fn error_policy(_cr: Arc<CertificateRequest>, error: &Error, ctx: Arc<ContextData>) -> Action {
    warn!("reconcile failed: {:?}", error);
    if let Err(err) = ctx.metrics.increment_sync_error_count(CONTROLLER_NAME) {
        error!("Failed to count sync error: {}", err);
    }
    Action::requeue(Duration::from_secs(5 * 60))
}

/// Context injected with each `reconcile` and `error_policy` invocation.
#[derive(Clone)]
pub struct ContextData {
    metrics: Metrics,
}

/// Feeds every CertificateRequest change into a full recount
async fn watch_certificate_requests(
    api: Api<CertificateRequest>,
    metrics: Metrics,
    lister: KubeCertificateRequestLister,
) {
    let mut events = watcher(api, watcher::Config::default())
        .default_backoff()
        .boxed();

    while let Some(event) = events.next().await {
        match event {
            Ok(watcher::Event::Apply(cr)) => {
                metrics
                    .handle_certificate_request_event(
                        &lister,
                        &certificate_request_record(&cr),
                        ResourceEvent::Applied,
                    )
                    .await
            }
            Ok(watcher::Event::Delete(cr)) => {
                metrics
                    .handle_certificate_request_event(
                        &lister,
                        &certificate_request_record(&cr),
                        ResourceEvent::Deleted,
                    )
                    .await
            }
            // one recount once the initial listing is complete
            Ok(watcher::Event::InitDone) => {
                if let Err(err) = metrics.refresh_certificate_request_count(&lister).await {
                    error!("Initial certificateRequestCount recount failed: {}", err);
                }
            }
            Ok(_) => {}
            Err(err) => warn!("CertificateRequest watch failed: {}", err),
        }
    }
}

/// Recount on a fixed cadence, independent of watch events
async fn resync_certificate_request_count(
    metrics: Metrics,
    lister: KubeCertificateRequestLister,
    period: Duration,
) {
    let mut interval = tokio::time::interval(period);
    interval.set_missed_tick_behavior(MissedTickBehavior::Delay);
    loop {
        interval.tick().await;
        match metrics.refresh_certificate_request_count(&lister).await {
            Ok(count) => info!("Resynced certificateRequestCount from {} requests", count),
            Err(err) => error!("Periodic certificateRequestCount resync skipped: {}", err),
        }
    }
}

/// Handle for the running controller tasks
#[derive(Clone)]
pub struct Manager {}

/// Manager that owns a Controller for CertificateRequest
impl Manager {
    /// Lifecycle initialization interface for app
    ///
    /// This returns a `Manager` that drives a `Controller`, the recount
    /// watcher and the periodic resync as one future to be awaited.
    /// It is up to `main` to wait for it.
    pub async fn new(
        metrics: Metrics,
        config: &ControllerConfig,
    ) -> Result<(Self, BoxFuture<'static, ()>)> {
        let client = Client::try_default().await?;

        let certificate_requests: Api<CertificateRequest> = Api::all(client.clone());

        // Ensure CRD is installed before loop-watching
        certificate_requests
            .list(&ListParams::default().limit(1))
            .await
            .map_err(|err| anyhow::anyhow!("is the CertificateRequest CRD installed? {}", err))?;

        let lister = KubeCertificateRequestLister::new(client.clone());
        let context = Arc::new(ContextData {
            metrics: metrics.clone(),
        });

        let controller = Controller::new(certificate_requests.clone(), watcher::Config::default())
            .shutdown_on_signal()
            .run(reconcile, error_policy, context)
            .filter_map(|x| async move { std::result::Result::ok(x) })
            .for_each(|_| futures::future::ready(()));
        let watch =
            watch_certificate_requests(certificate_requests, metrics.clone(), lister.clone());
        let resync = resync_certificate_request_count(
            metrics,
            lister,
            config.resync_interval(),
        );

        let drainer = async move {
            tokio::select! {
                _ = controller => info!("controller stream ended"),
                _ = watch => warn!("CertificateRequest watch ended"),
                _ = resync => {},
            }
        }
        .boxed();

        Ok((Self {}, drainer))
    }
}
