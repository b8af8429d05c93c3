pub mod capability;
pub mod sse;
pub mod usage;

pub use capability::{AuthScheme, Capability, CapabilityParseError, ProviderFamily};
pub use sse::{SseEvent, SseParser};
pub use usage::{TokenUsage, UsageAccumulator, extract_token_usage};
