//! kubeops - sample operator built on the kubeops runtime
//!
//! Ships one custom resource, [`crd::ConfigMirror`], and its controller. The
//! watch/queue/dispatch machinery lives in `kubeops-runtime`; shared errors,
//! settings and telemetry live in `kubeops-common`.

pub mod crd;
pub mod mirror;

pub use crd::{ConfigMirror, ConfigMirrorSpec, ConfigMirrorStatus, MirrorPhase};
pub use mirror::{ConfigMirrorController, MirrorCleanup};
