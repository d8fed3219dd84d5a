//! Canonical home of live subscriptions.

pub mod subscription_registry;

pub use subscription_registry::{Gid, RegistryError, Sid, Subscriber, SubscriptionRegistry};
