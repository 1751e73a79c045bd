//! Rate-limited capability gateway and multi-provider router.
//!
//! External per-item services (OCR engines, ASR engines) are modeled as
//! [`Capability`] implementations. A [`CapabilityGateway`] bounds one
//! provider's concurrency and request rate and handles retries; a
//! [`ProviderRouter`] selects among interchangeable gateways and fails
//! over between them.

pub mod capability;
pub mod error;
pub mod gateway;
pub mod router;

pub use capability::Capability;
pub use error::{ProviderError, ProviderResult};
pub use gateway::{CapabilityGateway, GatewayConfig, GatewayStats};
pub use router::{BatchOutcome, BatchStats, ProviderRouter, RouterConfig, SelectionPolicy};
