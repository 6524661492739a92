/**
 * Tiered ciphertext cache: local staging, drain to durable
 *  storage, range-aware reads with peer fallback.
 */
pub mod ciphertext;
/**
 * The object store interface (persistence of metadata,
 *  permissions, and revisions) and its in-memory
 *  implementation.
 */
pub mod database;
/**
 * Global audit events and the event bus producers.
 */
pub mod events;
/**
 * The HTTP surface: router assembly, per-request context,
 *  error envelope, and the per-operation handlers.
 */
pub mod http_server;
/**
 * Long-lived background workers: ciphertext drainer,
 *  cache eviction walker, and the upstream keepalive probe.
 */
pub mod process;
/**
 * Service configuration loaded from TOML with environment
 *  overrides.
 */
pub mod service_config;
/**
 * The per-process state bundle injected into handlers and
 *  workers.
 */
pub mod state;

pub use service_config::Config;
pub use state::ServiceState;
