//! Per-branch build environments driven by repository branch events.
//!
//! Signed GitHub webhooks and the optional native reference hook are
//! normalized into [`event::BranchEvent`]s, published on the in-process
//! [`bus::EventBus`], and handled by the [`lifecycle`] provisioner and
//! decommissioner through the collaborators in [`resources`].

pub mod bus;
pub mod config;
pub mod event;
pub mod lifecycle;
pub mod resources;
pub mod secrets;
pub mod server;
pub mod sources;
pub mod verification;
