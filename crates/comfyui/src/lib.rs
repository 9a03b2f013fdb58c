//! ComfyUI REST client and the remote-accessor boundary.
//!
//! Provides the [`accessor::RenderAccessor`] trait the orchestration core
//! consumes, its HTTP implementation over the ComfyUI API, typed parsing of
//! the history and queue endpoints, and a cancellable wait-for-reachability
//! loop with exponential backoff.

pub mod accessor;
pub mod api;
pub mod messages;
pub mod reconnect;
