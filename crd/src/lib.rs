#![warn(rust_2018_idioms)]
/// crd
/// Generated type, for crdgen
pub mod crd;
pub use crd::CertificateRequest;
pub use crd::CertificateRequestCondition;
pub use crd::CertificateRequestSpec;
pub use crd::CertificateRequestStatus;
pub use crd::ConditionStatus;
pub use crd::IssuerReference;
