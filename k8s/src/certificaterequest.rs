use anyhow::Result;
use async_trait::async_trait;
use kube::{
    api::{Api, ListParams, ResourceExt},
    Client,
};
use log::debug;

use crd::CertificateRequest;
use metrics::{CertificateRequestLister, CertificateRequestRecord};

/// default issuer group when the reference leaves it empty
pub const DEFAULT_ISSUER_GROUP: &str = "cert-manager.io";
/// default issuer kind when the reference leaves it empty
pub const DEFAULT_ISSUER_KIND: &str = "Issuer";

/// snapshot record of a CertificateRequest, labelled by its issuer
pub fn certificate_request_record(cr: &CertificateRequest) -> CertificateRequestRecord {
    let issuer = &cr.spec.issuer_ref;
    CertificateRequestRecord {
        name: cr.name_any(),
        namespace: cr.namespace().unwrap_or_default(),
        issuer_name: issuer.name.clone(),
        issuer_kind: issuer
            .kind
            .clone()
            .filter(|k| !k.is_empty())
            .unwrap_or_else(|| DEFAULT_ISSUER_KIND.to_owned()),
        issuer_group: issuer
            .group
            .clone()
            .filter(|g| !g.is_empty())
            .unwrap_or_else(|| DEFAULT_ISSUER_GROUP.to_owned()),
    }
}

/// Lists CertificateRequests across all namespaces from the API server
#[derive(Clone)]
pub struct KubeCertificateRequestLister {
    client: Client,
}

impl KubeCertificateRequestLister {
    pub fn new(client: Client) -> Self {
        KubeCertificateRequestLister { client }
    }
}

#[async_trait]
impl CertificateRequestLister for KubeCertificateRequestLister {
    async fn list_certificate_requests(&self) -> Result<Vec<CertificateRequestRecord>> {
        let api: Api<CertificateRequest> = Api::all(self.client.clone());
        let list = api.list(&ListParams::default()).await?;
        debug!("Listed {} certificate requests", list.items.len());
        Ok(list.items.iter().map(certificate_request_record).collect())
    }
}
