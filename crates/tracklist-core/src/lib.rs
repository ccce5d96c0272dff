//! Serves a callback-driven playlist service through one-request/one-response
//! calls.
//!
//! The backend only ever reports progress through notifications surfaced while
//! it is pumped. Requests park continuations in a [`registry::Registry`] until
//! the playlist they touch is loaded or their mutation has settled, and patch
//! requests reconcile the live item list with a desired one through
//! [`diff`] scripts, re-diffing whenever the playlist moves underneath them.
//! All of it runs on the single thread owned by [`event_loop::EventLoop`].

pub mod applicator;
pub mod backend;
pub mod config;
pub mod diff;
pub mod dispatcher;
pub mod event_loop;
pub mod link;
pub mod registry;
pub mod request;
pub mod response;

pub use backend::memory::{MemoryBackend, MemoryConfig, PlaylistSeed};
pub use backend::{Backend, BackendError, WakeSignal};
pub use config::BridgeConfig;
pub use event_loop::{spawn_loop_thread, EventLoop, ExitStatus, LoopHandle, LoopState};
pub use link::{EntityRef, Item};
pub use request::{Field, Operation, Request, RequestError};
pub use response::{Body, PlaylistView, Reply, Response, Status};
