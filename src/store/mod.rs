//! Quota / Health / Routing stores (C5, spec §4.4). Each is a small struct
//! behind its own `RwLock<HashMap<...>>` with best-effort JSON persistence
//! under the configured session directory, mirroring the teacher's
//! `Arc<std::sync::RwLock<XdsStore>>` state-sharing shape (`src/xds.rs`,
//! `src/static.rs`) rather than a single god-object store.

pub mod health;
pub mod quota;
pub mod routing;

pub use health::HealthStore;
pub use quota::QuotaStore;
pub use routing::RoutingStateStore;
