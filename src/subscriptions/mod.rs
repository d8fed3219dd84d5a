//! The processing core: per-subscription processing units and the manager
//! that coordinates them through the update barrier protocol.

pub mod manager;
pub mod metrics;
pub mod spu;

pub use manager::{DependabilityMonitor, SpuManager};
pub use spu::{NaivePolicy, PreUpdatePolicy, ProcessingListener, Spu, SpuId, SpuState};
