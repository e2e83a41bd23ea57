//! Tiller observer.
//!
//! Reconstructs run state from the engine's event stream:
//!
//! - **[`reducer`]** -- The idempotent fold from events to [`RunState`].
//! - **[`codec`]** -- NDJSON framing with lenient decoding.
//! - **[`client`]** -- Resumable stream client with reconnect/backoff
//!   over pluggable [`EventSource`]s.
//! - **[`error`]** -- Observer error types.
//!
//! The observer never talks back to the engine; it is a pure consumer of
//! an append-only stream and must remain correct under duplicates,
//! truncation and resume.

pub mod client;
pub mod codec;
pub mod error;
pub mod reducer;

pub use client::{Backoff, ConnectionState, EventSource, MemorySource, ObserverClient, ReaderSource};
pub use error::{ObserverError, Result};
pub use reducer::{fold, Applied, CandidateState, RunState, RunStatus, StageState, StageStatus};
