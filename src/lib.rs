#![cfg_attr(docsrs, feature(doc_auto_cfg))]
#![warn(missing_docs, missing_debug_implementations, rust_2018_idioms)]
// Allow acronyms like DRM
#![allow(clippy::upper_case_acronyms)]

//! # hwcomposer: layer composition for display controllers
//!
//! This crate decides, frame after frame, how the layers a client submits
//! reach the screen: straight to a hardware plane, blended by a 2D blit
//! engine, or composed by the client itself into a single target buffer.
//!
//! ## Structure of the crate
//!
//! - [`composer`] is the client facing side. A [`Composer`](composer::Composer)
//!   owns one [`Display`](composer::Display) per output; each display runs the
//!   validate, accept, present cycle over its layers.
//! - [`backend`] talks to the hardware. The
//!   [`DeviceClient`](backend::DeviceClient) trait is implemented on top of
//!   kernel mode-setting ([`backend::drm`]) and legacy frame-buffer devices;
//!   [`backend::blit`] drives blit engines, and [`backend::sync`] wraps the
//!   fence file descriptors passed between all of them.
//! - [`utils`] holds geometry and time helpers shared by both.
//!
//! ## Threads
//!
//! Every display runs a vsync thread of its own, and hotplug detection may run
//! on another. Calls on one display are serialized by a lock held for the whole
//! call; different displays can be driven in parallel.
//!
//! ### Logging
//!
//! The crate makes extensive use of [`tracing`] for its internal logging and
//! never installs a subscriber itself.
//!
//! For release builds it is recommended to limit the log level during compile time,
//! by enabling the corresponding features of [`tracing`] in your binary crate:
//!
//! ```toml
//! [dependencies]
//! tracing = { version = "0.1", features = ["max_level_trace", "release_max_level_debug"] }
//! ```

pub mod backend;
pub mod composer;
pub mod utils;
