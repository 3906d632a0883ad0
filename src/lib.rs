//! Session engine for a per-conference translation-avatar audio-forwarding
//! pipeline (§1 Purpose & Scope).
//!
//! The parent binary (`avatar-relayd`) owns the control surface, the
//! deduplication registry, and one [`session::SessionManager`] child per
//! active session. The child binary (`bot_worker`) runs the orchestrator
//! that sequences the avatar handshake and the conference bot, isolating
//! the conference SDK's native crashes from the control plane.

pub mod audio;
pub mod avatar;
pub mod conference;
pub mod config;
pub mod control;
pub mod error;
pub mod ipc;
pub mod orchestrator;
pub mod registry;
pub mod session;
pub mod token;
pub mod translator;

pub use config::Config;
pub use control::{ControlSurface, StartRequest, StartResponse};
pub use error::ErrorCode;
