//! Runnable experiment setups built on the public API.

pub mod synthetic;
