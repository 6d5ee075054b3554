//! Downstream sinks fed by the orchestrator: the cache-store mirror, the
//! DNS zones and the optional webhook.

pub mod cache;
pub mod dns;
pub mod nsupdate;
pub mod resolver;
pub mod webhook;

pub use cache::{CacheSync, RedisStore};
pub use dns::DnsBatcher;
pub use nsupdate::NsUpdate;
pub use resolver::HickoryResolver;
pub use webhook::Webhook;
