//! Subscription of this bridge with the CCU interfaces
//!
//! The bridge is both an XML-RPC server (callbacks) and a client (`init`).
//! This module is the client role; [`crate::server`] is the server role. They
//! share only the [`SubscriptionRegistry`].

pub mod backoff;
pub mod client;
pub mod registry;

pub use backoff::{BackoffPolicy, NextStep, SubscriptionAttempt, SubscriptionState};
pub use client::{ClientRegistration, Readiness, RegistrationClient, RegistrationTarget};
pub use registry::SubscriptionRegistry;
