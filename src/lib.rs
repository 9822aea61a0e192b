//! genproxy - HTTP(S) record/playback intercepting proxy
//!
//! In record mode managed requests are forwarded to their real destination
//! and the responses stored under a request fingerprint. In playback mode the
//! same fingerprint is looked up and the stored response served without
//! touching the network.

#![deny(unsafe_op_in_unsafe_fn)]
#![warn(missing_docs, clippy::all, clippy::pedantic, clippy::cargo)]
#![allow(
    clippy::module_name_repetitions,
    clippy::must_use_candidate,
    clippy::cast_possible_truncation,
    clippy::field_reassign_with_default,
    clippy::multiple_crate_versions
)]

pub mod config;
pub mod engine;
pub mod error;
pub mod fingerprint;
pub mod intercept;
pub mod message;
pub mod network;
pub mod proxy;
pub mod storage;

pub use error::{GenproxyError, Result};
