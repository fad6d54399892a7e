mod admission;
mod liveness;

pub use admission::{AdmissionController, AdmissionPermit};
pub use liveness::{LivenessProber, ManifestProbe};
