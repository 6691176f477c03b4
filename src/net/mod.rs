//! Network seams: the live event stream and the history API.

pub mod history;
pub mod sse;
pub mod transport;
