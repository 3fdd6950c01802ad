//! XWayland utilities
//!
//! This module contains helpers to start XWayland from your compositor, in order
//! to support running X11 apps.
//!
//! The starting point is [`XWayland::spawn`], which:
//!
//! - locks a free X11 display number (see [`X11Lock`]),
//! - binds the sockets X11 clients connect to (see [`ListenerSocket`]),
//! - creates the wayland and window manager connections (see [`ChannelPair`]),
//! - arms the readiness signal (see [`ReadySignal`]),
//! - and launches XWayland with exactly the descriptors it needs (see [`LaunchHelper`]).
//!
//! Once XWayland signals it is ready, your [`XwmHandler`] receives the window manager
//! connection. You need to provide the X11 window manager yourself, treating XWayland
//! (and all its X11 apps) as one special wayland client.
//!
//! Supervision of the running XWayland process is left to the compositor: dropping the
//! [`XWayland`] handle releases the display lock and the sockets, but does not kill the
//! server.
//!
//! ```no_run
//! use std::os::unix::net::UnixStream;
//!
//! use xwayland_bootstrap::{
//!     reexports::{calloop::EventLoop, wayland_server::Display},
//!     xwayland::{XWayland, XWaylandConfig},
//! };
//!
//! struct State {
//!     xwm_connection: Option<UnixStream>,
//! }
//!
//! let event_loop = EventLoop::<State>::try_new().unwrap();
//! let display = Display::<State>::new().unwrap();
//! let mut dh = display.handle();
//!
//! let xwayland = XWayland::spawn(
//!     &event_loop.handle(),
//!     &mut dh,
//!     XWaylandConfig::default(),
//!     |connection: UnixStream, display_number: u32, state: &mut State| {
//!         println!("X11 clients can connect to :{}", display_number);
//!         state.xwm_connection = Some(connection);
//!     },
//! )
//! .expect("Failed to start XWayland");
//! println!("DISPLAY={}", xwayland.display_name());
//! ```
mod launch_helper;
mod ready;
mod x11_sockets;
mod xserver;

pub use self::launch_helper::LaunchHelper;
pub use self::ready::{ReadyError, ReadySignal};
pub use self::x11_sockets::{ChannelPair, ChannelRole, ListenerSocket, LockError, SocketNamespace, X11Lock};
#[cfg(feature = "wayland_frontend")]
pub use self::xserver::XWaylandClientData;
pub use self::xserver::{
    BindFailurePolicy, BootstrapError, ClientInserter, XWayland, XWaylandConfig, XwmHandler,
};
