//! Resource query and execution layer
//!
//! Turns a declarative resource descriptor into a cached, augmented
//! collection of live records. Descriptors are loaded from JSON catalogs
//! embedded at compile time, so new resource kinds need no code changes.
//!
//! # Architecture
//!
//! - [`registry`] - Descriptors, typed plugin registries and kind assembly
//! - [`query`] - Paginated enumeration and per-parent fan-out
//! - [`source`] - Describe, describe-child and config source strategies
//! - [`augment`] - Scalar, batch and tag augmentation
//! - [`manager`] - Manager facade, cache use and the resource-limit breaker
//! - [`cache`] - Null, in-memory and file-backed caches
//! - [`path`] - Result path evaluation against provider responses
//! - [`pool`] - Bounded task group shared by every fan-out site
//!
//! # Resource Definitions
//!
//! Kinds are defined in JSON files under `src/resources/`:
//! - `compute.json` - instances, images, clusters, file systems, fleets
//! - `security.json` - certificates, HSM clusters, parameters
//! - `management.json` - config/tagging/metrics services, state machines
//!
//! # Example
//!
//! ```ignore
//! let registry = Arc::new(Registry::builtin()?);
//! let ctx = ExecutionContext::new(policy, &options, session, registry);
//! let selection = Policy::new(ctx).run().await?;
//! ```

pub mod augment;
pub mod cache;
pub mod manager;
pub mod path;
pub mod pool;
pub mod query;
pub mod registry;
pub mod source;

pub use cache::{Cache, CacheKey, FileCache, MemoryCache, NullCache};
pub use manager::{check_resource_limit, generate_arn, ManagerCore, QueryResourceManager, Selection};
pub use query::{ChildResourceQuery, ResourceQuery, PARENT_ANNOTATION};
pub use registry::*;
pub use source::{default_sources, ConfigSource, DescribeSource, Source, SourceRegistry};
