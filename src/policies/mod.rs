//! Retry timing policies.
//!
//! Busy ticks are not dropped: they are re-enqueued after a delay. This
//! module groups the knobs controlling that delay.
//!
//! ## Contents
//! - [`BackoffPolicy`] how retry delays evolve (first / factor / max + jitter)
//! - [`JitterPolicy`]  randomization to avoid synchronized retries
//!
//! ## Quick wiring
//! ```text
//! EngineConfig { tick_retry: BackoffPolicy, .. }
//!      └─► engine::worker uses tick_retry.next(attempt)
//!          to schedule the delayed re-enqueue of a contended tick
//! ```

mod backoff;
mod jitter;

pub use backoff::BackoffPolicy;
pub use jitter::JitterPolicy;
