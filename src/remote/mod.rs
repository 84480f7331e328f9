//! Remote reasoning
//!
//! Optional override path: a structured session and profile context is sent
//! to a remote reasoning provider and a structured verdict comes back.
//!
//! Pipeline: ReasoningContext → fingerprint → cache / in-flight registry →
//! provider envelope → Transport → verdict

mod client;
pub mod context;
pub mod keys;
pub mod provider;
pub mod transport;

pub use client::{CacheEntry, RemoteReasoningClient};
pub use context::{fingerprint, ReasoningContext, SnapshotView};
pub use keys::{EnvKeyProvider, KeyProvider, Secret, StaticKeyProvider};
pub use provider::{
    parse_verdict, provider_for, AnthropicProvider, OpenAiProvider, ProviderId, ProviderRequest,
    ReasoningProvider, RemoteVerdict,
};
pub use transport::{StaticTransport, Transport};
