//! Client-facing TCP listeners.

mod listener;

pub use listener::FrontendListener;
