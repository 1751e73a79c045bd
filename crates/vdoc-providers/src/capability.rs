//! The capability interface: one external per-item service call.
//!
//! Concrete vendor clients implement this; the gateway and router depend
//! only on the trait.

use async_trait::async_trait;
use vdoc_models::{CapabilityKind, CapabilityOutput};

use crate::error::ProviderResult;

/// One external per-item worker, e.g. "OCR an image" or "transcribe an
/// audio chunk".
#[async_trait]
pub trait Capability: Send + Sync {
    /// Provider name, retained on results for auditing.
    fn name(&self) -> &str;

    /// What this capability does.
    fn kind(&self) -> CapabilityKind;

    /// Perform one call: given bytes, return text plus confidence.
    async fn call(&self, input: &[u8]) -> ProviderResult<CapabilityOutput>;
}
