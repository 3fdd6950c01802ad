/*
 * Steps of Xwayland server creation
 *
 * Sockets to create:
 * - a pair for Xwayland to connect to the compositor as a wayland client, we use
 *   our end to insert the Xwayland client in the display
 * - a pair for the compositor to connect to Xwayland as a WM, our end is given
 *   to the WM once Xwayland is ready
 * - 2 listening sockets on which the Xwayland server will listen. We need to
 *   bind them ourselves so we know what value put in the $DISPLAY env variable.
 *   This involves some dance with a lockfile to ensure there is no collision with
 *   an other starting xserver
 *   if we listen on display $D, their paths are respectively:
 *   - /tmp/.X11-unix/X$D
 *   - @/tmp/.X11-unix/X$D (abstract socket)
 *
 * The XWayland server is spawned via fork+exec.
 * -> once it is started, it sends us a SIGUSR1 if it inherited the signal as
 *    ignored. The listener for it is armed before the fork, otherwise the
 *    signal could arrive before anyone waits for it.
 * -> supervision of the running server (restart on crash, shutdown) is left
 *    to the compositor.
 *
 * cf https://github.com/swaywm/wlroots/blob/master/xwayland/xwayland.c
 */
use std::{
    ffi::OsString,
    ops::Range,
    os::unix::{io::AsFd, net::UnixStream},
    path::{Path, PathBuf},
    process::Child,
};

use calloop::{signals::Signal, LoopHandle, RegistrationToken};
use tracing::{error, info, warn};

use super::{
    launch_helper::xwayland_launcher,
    ready::{ReadyError, ReadySignal},
    x11_sockets::{prepare_x11_sockets, ChannelPair, ChannelRole, ListenerSocket, LockError, X11Lock},
};

/// What to do when the sockets of a freshly locked display cannot be bound
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum BindFailurePolicy {
    /// Fail the whole launch
    ///
    /// A bind failure after acquiring the lock means a process that does not honor
    /// X11 lock files uses this display.
    #[default]
    Abort,
    /// Release the lock and try the next display number
    NextDisplay,
}

/// Configuration of an XWayland launch
#[derive(Debug, Clone)]
pub struct XWaylandConfig {
    /// XWayland binary, looked up in `PATH` unless it is a path
    pub binary: PathBuf,
    /// Use exactly this display number instead of searching for a free one
    pub display: Option<u32>,
    /// First display number of the search
    pub first_display: u32,
    /// How many display numbers are tried before giving up
    pub max_displays: u32,
    /// Directory holding the `.X<n>-lock` files
    pub lock_dir: PathBuf,
    /// Directory holding the `X<n>` sockets
    pub socket_dir: PathBuf,
    /// Also listen on the abstract socket (Linux only)
    pub open_abstract_socket: bool,
    /// Signal XWayland raises once it is ready
    pub ready_signal: Signal,
    /// Additional environment variables for XWayland
    pub envs: Vec<(OsString, OsString)>,
    /// Behavior on socket bind failure
    pub bind_failure: BindFailurePolicy,
    /// Export `DISPLAY` in the compositor's environment once XWayland is ready
    pub export_display: bool,
}

impl Default for XWaylandConfig {
    fn default() -> Self {
        XWaylandConfig {
            binary: PathBuf::from("Xwayland"),
            display: None,
            first_display: 0,
            max_displays: 33,
            lock_dir: PathBuf::from("/tmp"),
            socket_dir: PathBuf::from("/tmp/.X11-unix"),
            open_abstract_socket: true,
            ready_signal: Signal::SIGUSR1,
            envs: Vec::new(),
            bind_failure: BindFailurePolicy::Abort,
            export_display: true,
        }
    }
}

impl XWaylandConfig {
    /// Display numbers considered for this launch
    pub fn display_range(&self) -> Range<u32> {
        match self.display {
            Some(d) => d..d.saturating_add(1),
            None => self.first_display..self.first_display.saturating_add(self.max_displays),
        }
    }
}

/// Error emitted while launching XWayland
///
/// None of them leaves anything behind: lock, sockets and descriptors created so far
/// are released, and an already spawned XWayland is killed and reaped, before the
/// error is returned.
#[derive(Debug, thiserror::Error)]
pub enum BootstrapError {
    /// No display number could be locked
    #[error("Could not find a free display for the XServer")]
    Lock(#[from] LockError),
    /// Creating a socket pair failed
    #[error("Failed to create the {role:?} socket pair")]
    Channel {
        /// Role of the pair
        role: ChannelRole,
        /// The underlying error
        #[source]
        source: std::io::Error,
    },
    /// A listening socket could not be bound
    #[error("Failed to bind the X11 socket {path:?}")]
    SocketBind {
        /// Path of the socket
        path: PathBuf,
        /// The underlying error
        #[source]
        source: std::io::Error,
    },
    /// The readiness signal could not be armed
    #[error("Failed to arm the readiness signal")]
    Ready(#[from] ReadyError),
    /// The compositor refused the XWayland client
    #[error("Failed to insert the XWayland client")]
    ClientInsertion(#[source] Box<dyn std::error::Error + Send + Sync>),
    /// XWayland could not be found or executed
    #[error("Failed to spawn XWayland")]
    Spawn(#[source] std::io::Error),
}

/// Compositor side of the XWayland connection
///
/// Turns our end of the wayland socket pair into a client of the compositor.
pub trait ClientInserter {
    /// Handle to the inserted client
    type Client;
    /// Error on insertion
    type Error: std::error::Error + Send + Sync + 'static;

    /// Register the XWayland wayland connection as a client
    fn insert_xwayland_client(
        &mut self,
        stream: UnixStream,
        display_number: u32,
    ) -> Result<Self::Client, Self::Error>;
}

#[cfg(feature = "wayland_frontend")]
mod frontend {
    use std::{os::unix::net::UnixStream, sync::Arc};

    use tracing::info;
    use wayland_server::{
        backend::{ClientData, ClientId, DisconnectReason},
        Client, DisplayHandle,
    };

    /// Client data attached to the XWayland wayland client
    #[derive(Debug)]
    pub struct XWaylandClientData {
        display_number: u32,
    }

    impl XWaylandClientData {
        /// Display number of the XWayland instance behind this client
        pub fn display_number(&self) -> u32 {
            self.display_number
        }
    }

    impl ClientData for XWaylandClientData {
        fn disconnected(&self, _client_id: ClientId, reason: DisconnectReason) {
            info!(display = self.display_number, ?reason, "XWayland client disconnected");
        }
    }

    impl super::ClientInserter for DisplayHandle {
        type Client = Client;
        type Error = std::io::Error;

        fn insert_xwayland_client(&mut self, stream: UnixStream, display_number: u32) -> std::io::Result<Client> {
            self.insert_client(stream, Arc::new(XWaylandClientData { display_number }))
        }
    }
}

#[cfg(feature = "wayland_frontend")]
pub use self::frontend::XWaylandClientData;

/// Trait to be implemented by your X11 window manager
///
/// Called once, when XWayland signals it is ready. Your privileged connection to
/// the X server is the given `UnixStream`.
pub trait XwmHandler<D> {
    /// The XWayland server is ready
    fn xwayland_ready(&mut self, connection: UnixStream, display_number: u32, data: &mut D);
}

impl<D, F> XwmHandler<D> for F
where
    F: FnMut(UnixStream, u32, &mut D),
{
    fn xwayland_ready(&mut self, connection: UnixStream, display_number: u32, data: &mut D) {
        self(connection, display_number, data)
    }
}

/// A launched XWayland instance
///
/// Holds the display lock and the listening sockets for as long as it lives. Dropping
/// it releases them, it does not stop the XWayland process.
#[derive(Debug)]
pub struct XWayland<C> {
    display_lock: X11Lock,
    listeners: Vec<ListenerSocket>,
    client: C,
    child_pid: u32,
    ready_token: RegistrationToken,
}

impl<C> XWayland<C> {
    /// Start the XWayland server
    ///
    /// Locks a display, binds its sockets, arms the readiness signal, spawns XWayland,
    /// then registers the readiness source on `handle` and inserts the XWayland client
    /// through `compositor`. Once XWayland is ready, `wm` receives the window manager
    /// connection.
    ///
    /// See [`ReadySignal`] for how the readiness signal is caught.
    pub fn spawn<'l, D, I, H>(
        handle: &LoopHandle<'l, D>,
        compositor: &mut I,
        config: XWaylandConfig,
        wm: H,
    ) -> Result<XWayland<C>, BootstrapError>
    where
        I: ClientInserter<Client = C>,
        H: XwmHandler<D> + 'l,
        D: 'l,
    {
        let (display_lock, listeners) = prepare_x11_sockets(&config)?;
        let number = display_lock.display_number();

        let channel = |role| {
            ChannelPair::new(role).map_err(|source| BootstrapError::Channel { role, source })
        };
        let wayland = channel(ChannelRole::CoreProtocol)?;
        let xwm = channel(ChannelRole::WindowManager)?;

        // must be armed before the fork
        let ready = ReadySignal::arm(config.ready_signal)?;

        let launcher = xwayland_launcher(
            config.binary.as_os_str(),
            number,
            wayland.child.as_fd(),
            xwm.child.as_fd(),
            &listeners,
            [wayland.parent.as_fd(), xwm.parent.as_fd()],
            config.ready_signal,
            &config.envs,
        );
        let mut child = launcher.spawn().map_err(|err| {
            error!(error = ?err, binary = ?config.binary, "Failed to spawn XWayland");
            BootstrapError::Spawn(err)
        })?;

        let ChannelPair {
            parent: wayland_stream,
            child: wayland_child,
            ..
        } = wayland;
        let ChannelPair {
            parent: wm_stream,
            child: wm_child,
            ..
        } = xwm;
        // the child owns these now
        drop(wayland_child);
        drop(wm_child);

        let on_ready = on_ready(wm_stream, number, config.export_display, wm);
        let ready_token = match handle.insert_source(ready, on_ready) {
            Ok(token) => token,
            Err(err) => {
                abort_child(&mut child);
                return Err(BootstrapError::Ready(ReadyError::Loop(err.error)));
            }
        };
        let client = match compositor.insert_xwayland_client(wayland_stream, number) {
            Ok(client) => client,
            Err(err) => {
                handle.remove(ready_token);
                abort_child(&mut child);
                return Err(BootstrapError::ClientInsertion(Box::new(err)));
            }
        };

        info!(display = number, pid = child.id(), "XWayland spawned");
        Ok(XWayland {
            display_lock,
            listeners,
            client,
            child_pid: child.id(),
            ready_token,
        })
    }

    /// The display number XWayland is listening on
    pub fn display_number(&self) -> u32 {
        self.display_lock.display_number()
    }

    /// The value of `DISPLAY` for X11 clients
    pub fn display_name(&self) -> String {
        format!(":{}", self.display_number())
    }

    /// Path of the display lock file
    pub fn lock_path(&self) -> &Path {
        self.display_lock.path()
    }

    /// The sockets X11 clients connect to
    pub fn listeners(&self) -> &[ListenerSocket] {
        &self.listeners
    }

    /// The XWayland wayland client
    pub fn client(&self) -> &C {
        &self.client
    }

    /// PID of the XWayland process
    pub fn pid(&self) -> u32 {
        self.child_pid
    }

    /// Token of the readiness source in the event loop
    ///
    /// The source stays registered to swallow repeated signals, remove it once the
    /// session is over.
    pub fn ready_token(&self) -> RegistrationToken {
        self.ready_token
    }
}

/// Kill and reap a child whose session could not be completed
fn abort_child(child: &mut Child) {
    warn!(pid = child.id(), "Terminating XWayland after a failed launch");
    if let Err(err) = child.kill() {
        warn!(error = ?err, "Failed to kill XWayland");
    }
    let _ = child.wait();
}

fn on_ready<D, H>(
    wm_stream: UnixStream,
    number: u32,
    export_display: bool,
    mut wm: H,
) -> impl FnMut(Signal, &mut (), &mut D)
where
    H: XwmHandler<D>,
{
    let mut wm_stream = Some(wm_stream);
    move |_, _, data| {
        let Some(stream) = wm_stream.take() else {
            return;
        };
        info!(display = number, "XWayland is ready");
        if export_display {
            std::env::set_var("DISPLAY", format!(":{}", number));
        }
        wm.xwayland_ready(stream, number, data);
    }
}
