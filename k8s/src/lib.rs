#![warn(rust_2018_idioms)]
pub mod certificaterequest;

pub use certificaterequest::{certificate_request_record, KubeCertificateRequestLister};
