//! Fleetgate - an administration gateway for a fleet of application instances
//!
//! This library provides:
//! - A route table derived from the instance registry, rebuilt lazily when
//!   registrations change
//! - A reverse proxy that forwards `/{prefix}/{instance}/**` to the
//!   instance's management endpoints through a filter chain
//! - Status change notifications over mail, webhooks and Slack, with
//!   per-channel cooldowns and templated messages
//! - An admin API to inspect routes, register instances and read
//!   notification counters

pub mod admin;
pub mod channels;
pub mod config;
pub mod error;
pub mod events;
pub mod filters;
pub mod forward;
pub mod headers;
pub mod instance;
pub mod locator;
pub mod notifications;
pub mod notifier;
pub mod pool;
pub mod proxy;
pub mod refresh;
pub mod registry;
pub mod route;
pub mod template;

/// Body type used for proxied requests and responses
pub type ProxyBody = http_body_util::combinators::BoxBody<hyper::body::Bytes, hyper::Error>;
