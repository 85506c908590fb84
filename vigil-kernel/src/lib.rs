//! Vigil kernel: failure notifications in, recovery workflows out.
//!
//! Leaves first: [`topology`] and [`compute`] are the external collaborators,
//! [`selector`] turns a failure into a task graph, [`engine`] runs it,
//! [`coordinator`] keeps one recovery per target and [`dispatcher`] ties them
//! together around the [`notifications`] store.

pub mod compute;
pub mod config;
pub mod coordinator;
pub mod dispatcher;
pub mod engine;
pub mod events;
pub mod health;
pub mod host_failure;
pub mod http;
pub mod models;
pub mod mqtt;
pub mod notifications;
pub mod selector;
pub mod topology;
