//! Chunked acquisition of online agency endpoints.
//!
//! An adapter describes its endpoint with an [`AcquisitionPlan`] (how to
//! window the range, the record period, whether a token is needed, whether
//! a failed window invalidates the rest) and a [`RequestPlanner`] that turns a
//! window into a request. The [`AcquisitionEngine`] walks the windows one at
//! a time through the shared transport, rate limiter and session, and hands
//! back the raw payloads for the adapter to parse.

mod engine;
mod window;

pub use engine::{
    AcquisitionEngine, AcquisitionPlan, MAX_PAGES_PER_WINDOW, RawData, RawPage, RequestPlanner,
};
pub use window::{ChunkPolicy, DateWindow};
