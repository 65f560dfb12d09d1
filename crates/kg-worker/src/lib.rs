//! Library surface for the pipeline worker: the scatter -> extract -> dedupe
//! -> cluster -> describe -> recurse wiring, plus the health/metrics routers
//! the binary serves alongside it. Split out of `main.rs` so `kg-server` can
//! embed the same pipeline behind its HTTP invocation API without spawning a
//! second process.

pub mod health;
pub mod metrics;
pub mod pipeline;
