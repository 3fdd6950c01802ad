#![cfg_attr(docsrs, feature(doc_auto_cfg))]
#![warn(missing_docs, missing_debug_implementations, rust_2018_idioms)]

//! # xwayland-bootstrap: start XWayland from a wayland compositor
//!
//! This crate takes care of the system-level dance needed to run legacy X11 clients
//! inside a wayland compositor: finding a free X11 display, binding its sockets,
//! launching the XWayland server with the right descriptors and environment, and
//! notifying your window manager once the server is ready.
//!
//! Everything lives in the [`xwayland`] module.
//!
//! ## General principles
//!
//! ### The event loop
//!
//! Like the rest of the Smithay ecosystem, this crate is built around [`calloop`]. The
//! readiness notification of XWayland is an event source inserted in your event loop,
//! and your window manager callback receives the mutable state of the loop.
//!
//! ### Logging
//!
//! This crate makes use of [`tracing`] for its internal logging.
//!
//! For release builds it is recommended to limit the log level during compile time.
//! This can be done by adding a dependency to [`tracing`] and enabling the corresponding features.
//! For example to enable `trace` messages for debug builds, but limit release builds to `debug` add
//! the following in your binary crate `Cargo.toml`:
//!
//! ```toml
//! [dependencies]
//! tracing = { version = "0.1", features = ["max_level_trace", "release_max_level_debug"] }
//! ```

pub mod xwayland;

pub mod reexports;
