//! Producer-side task dispatch

pub mod dispatcher;

pub use dispatcher::Dispatcher;
