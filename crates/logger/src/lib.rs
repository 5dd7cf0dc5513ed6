//! Tracing subscriber bootstrap shared by the workspace binaries.

mod subscriber;

pub use subscriber::{LogFormat, init};
