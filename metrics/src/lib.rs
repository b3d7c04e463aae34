#![warn(rust_2018_idioms)]
//! Metrics exposed by the certificate controller.
//!
//! A [`Registry`] is built once per process and handed to [`Metrics`], which
//! owns every instrument. Controller code reports values through `Metrics`;
//! the exposition server renders the registry on each scrape.

pub mod definition;
pub mod error;
pub mod func;
pub mod metrics;
pub mod registry;
pub mod requests;
pub mod summary;
pub mod vec;

pub use definition::{Instrument, MetricDefinition, MetricKind};
pub use error::{Error, Result};
pub use metrics::{ClientRequest, Metrics, ResourceRef, NAMESPACE};
pub use registry::{Registration, Registry};
pub use requests::{CertificateRequestLister, CertificateRequestRecord, ResourceEvent};
