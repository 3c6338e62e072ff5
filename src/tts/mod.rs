//! Speech synthesis: backend trait and implementations, the factory
//! registry, the shared backend pool and the on-disk result cache.

pub mod cache;
pub mod pool;
pub mod provider;
pub mod registry;

pub use cache::{CacheEntry, CacheKey, ResultCache};
pub use pool::{BackendHandle, BackendPool, PoolError, PoolStats};
pub use provider::{SynthesisBackend, SynthesisOptions, SynthesisOutput};
pub use registry::{BackendConfig, BackendKey, BackendKind, BackendRegistry};
