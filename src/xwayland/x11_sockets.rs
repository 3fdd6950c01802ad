use std::{
    fmt,
    io::{Read, Write},
    ops::Range,
    os::unix::{
        io::{AsFd, BorrowedFd, OwnedFd},
        net::UnixStream,
    },
    path::{Path, PathBuf},
    sync::atomic::{AtomicUsize, Ordering},
};

use rustix::{io::Errno, net::SocketAddrUnix, process::Pid};
use tracing::{debug, info, warn};

use super::xserver::{BindFailurePolicy, BootstrapError, XWaylandConfig};

/// Error emitted while trying to lock an X11 display number.
#[derive(Debug, thiserror::Error)]
pub enum LockError {
    /// Another X server holds the lock for this display.
    #[error("Display :{display} is locked by another X server")]
    AlreadyLocked {
        /// The contended display number.
        display: u32,
    },
    /// The lock file could not be created or inspected.
    #[error("Failed to access the lock file {path:?}")]
    Io {
        /// Path of the lock file.
        path: PathBuf,
        /// The underlying error.
        #[source]
        source: std::io::Error,
    },
    /// Every display number of the searched range is locked.
    #[error("No free X11 display in range {start}..{end}")]
    ExhaustedRange {
        /// First display number tried.
        start: u32,
        /// End (exclusive) of the searched range.
        end: u32,
    },
}

/// Find a free X11 display slot and open its listening sockets
///
/// Lock contention is absorbed by moving on to the next display. A failure to bind
/// the sockets of a display we hold the lock for is handled according to
/// [`XWaylandConfig::bind_failure`].
pub(crate) fn prepare_x11_sockets(
    config: &XWaylandConfig,
) -> Result<(X11Lock, Vec<ListenerSocket>), BootstrapError> {
    let range = config.display_range();
    let mut next = range.start;
    loop {
        let lock = X11Lock::acquire(next..range.end, &config.lock_dir).map_err(|err| match err {
            LockError::ExhaustedRange { .. } => LockError::ExhaustedRange {
                start: range.start,
                end: range.end,
            },
            err => err,
        })?;
        let number = lock.display_number();
        match open_x11_sockets_for_display(number, &config.socket_dir, config.open_abstract_socket) {
            Ok(sockets) => return Ok((lock, sockets)),
            Err(err) => match config.bind_failure {
                BindFailurePolicy::NextDisplay => {
                    warn!(display = number, error = %err, "Failed to create sockets, trying the next display");
                    next = number + 1;
                }
                BindFailurePolicy::Abort => return Err(err),
            },
        }
    }
}

/// An exclusive lock on an X11 display number
///
/// The lock is materialized by the file `<lock_dir>/.X<n>-lock`, holding the PID of
/// the locking process. It is respected by every cooperating X server on the host.
/// The lock file is removed when this value is dropped.
#[derive(Debug)]
pub struct X11Lock {
    display: u32,
    path: PathBuf,
}

impl X11Lock {
    /// Lock the first free display number of `range`
    ///
    /// Numbers are tried in ascending order. Contention and I/O errors on a given number
    /// both move the search on to the next one.
    pub fn acquire(range: Range<u32>, lock_dir: &Path) -> Result<X11Lock, LockError> {
        for number in range.clone() {
            match X11Lock::grab(number, lock_dir) {
                Ok(lock) => return Ok(lock),
                Err(err) => debug!(display = number, error = %err, "Display unavailable"),
            }
        }
        Err(LockError::ExhaustedRange {
            start: range.start,
            end: range.end,
        })
    }

    /// Try to grab a lockfile for given X display number
    ///
    /// A lock file left behind by a process that no longer exists is reclaimed.
    pub fn grab(number: u32, lock_dir: &Path) -> Result<X11Lock, LockError> {
        debug!(display = number, "Attempting to aquire an X11 display lock");
        let path = lock_path(lock_dir, number);
        let io_err = |source| LockError::Io {
            path: path.clone(),
            source,
        };

        match std::fs::OpenOptions::new().write(true).create_new(true).open(&path) {
            Ok(mut file) => {
                // we got it, write our PID in it and we're good
                let pid = Pid::as_raw(Some(rustix::process::getpid()));
                if let Err(err) = file.write_fmt(format_args!("{:>10}\n", pid)) {
                    // a lock file without a PID would look stale to everyone else
                    drop(file);
                    let _ = std::fs::remove_file(&path);
                    return Err(io_err(err));
                }
                info!(display = number, "X11 lock acquired");
                Ok(X11Lock { display: number, path })
            }
            Err(err) if err.kind() == std::io::ErrorKind::AlreadyExists => {
                // The lock may have been left behind by an X server that did not exit
                // gracefully. If its PID no longer exists, we claim it.
                match lock_holder(&path) {
                    Some(pid) if rustix::process::test_kill_process(pid) == Err(Errno::SRCH) => {
                        debug!(display = number, "Lock was blocked by a defunct X11 server, trying again");
                        if reclaim_stale_lock(&path, pid).map_err(io_err)? {
                            X11Lock::grab(number, lock_dir)
                        } else {
                            Err(LockError::AlreadyLocked { display: number })
                        }
                    }
                    _ => Err(LockError::AlreadyLocked { display: number }),
                }
            }
            Err(err) => Err(io_err(err)),
        }
    }

    /// The locked display number
    pub fn display_number(&self) -> u32 {
        self.display
    }

    /// Path of the lock file
    pub fn path(&self) -> &Path {
        &self.path
    }
}

impl Drop for X11Lock {
    fn drop(&mut self) {
        info!(display = self.display, "Cleaning up X11 lock.");
        if let Err(e) = std::fs::remove_file(&self.path) {
            warn!(error = ?e, "Failed to remove X11 lockfile");
        }
    }
}

/// Read the PID recorded in an existing lock file
fn lock_holder(path: &Path) -> Option<Pid> {
    let mut file = std::fs::File::open(path).ok()?;
    let mut spid = [0u8; 11];
    file.read_exact(&mut spid).ok()?;
    let pid = std::str::from_utf8(&spid).ok()?.trim().parse::<i32>().ok()?;
    Pid::from_raw(pid)
}

/// Move a lock file recorded as held by `stale` out of the way
///
/// The file is first renamed to a name private to this call, so among concurrent
/// reclaimers only one removes it. If the renamed file holds another PID, a
/// concurrent reclaimer already replaced it with a live lock, which is linked back.
/// Returns whether the lock was reclaimed.
fn reclaim_stale_lock(path: &Path, stale: Pid) -> std::io::Result<bool> {
    static RECLAIMS: AtomicUsize = AtomicUsize::new(0);

    let mut private = path.as_os_str().to_owned();
    private.push(format!(
        ".{}-{}.stale",
        std::process::id(),
        RECLAIMS.fetch_add(1, Ordering::Relaxed)
    ));
    let private = PathBuf::from(private);

    match std::fs::rename(path, &private) {
        Ok(()) => {}
        // removed by someone else, creating it again decides who wins
        Err(err) if err.kind() == std::io::ErrorKind::NotFound => return Ok(true),
        Err(err) => return Err(err),
    }

    let reclaimed = lock_holder(&private) == Some(stale);
    if !reclaimed {
        // unlike rename, linking never replaces a lock created in the meantime
        if let Err(err) = std::fs::hard_link(&private, path) {
            warn!(error = ?err, path = ?path, "Failed to restore a live X11 lockfile");
        }
    }
    std::fs::remove_file(&private)?;
    Ok(reclaimed)
}

pub(crate) fn lock_path(lock_dir: &Path, display: u32) -> PathBuf {
    lock_dir.join(format!(".X{}-lock", display))
}

pub(crate) fn socket_path(socket_dir: &Path, display: u32) -> PathBuf {
    socket_dir.join(format!("X{}", display))
}

/// Role of a [`ChannelPair`]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ChannelRole {
    /// Carries the wayland protocol between the compositor and XWayland
    CoreProtocol,
    /// Carries the X11 window manager connection
    WindowManager,
}

/// A connected pair of anonymous unix stream sockets
///
/// One end stays in the compositor, the other one is handed to XWayland.
#[derive(Debug)]
pub struct ChannelPair {
    /// End retained by the compositor
    pub parent: UnixStream,
    /// End inherited by XWayland
    pub child: UnixStream,
    /// What this channel carries
    pub role: ChannelRole,
}

impl ChannelPair {
    /// Create a new pair, both ends are close-on-exec
    pub fn new(role: ChannelRole) -> std::io::Result<ChannelPair> {
        let (parent, child) = UnixStream::pair()?;
        debug!(?role, "Created channel pair");
        Ok(ChannelPair { parent, child, role })
    }
}

/// Namespace a [`ListenerSocket`] is bound in
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SocketNamespace {
    /// Backed by a file in the filesystem
    Filesystem,
    /// Linux abstract namespace
    Abstract,
}

/// A listening socket X11 clients connect to
///
/// Filesystem sockets unlink their path when dropped.
pub struct ListenerSocket {
    fd: OwnedFd,
    path: PathBuf,
    namespace: SocketNamespace,
}

impl fmt::Debug for ListenerSocket {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ListenerSocket")
            .field("fd", &self.fd)
            .field("name", &self.display_name())
            .finish()
    }
}

impl ListenerSocket {
    /// Open an unix socket for listening and bind it to given path
    ///
    /// A stale file at `path` is removed first for filesystem sockets. The socket is
    /// created close-on-exec, it is up to the launcher to let XWayland inherit it.
    pub fn bind(path: &Path, namespace: SocketNamespace) -> Result<ListenerSocket, BootstrapError> {
        let bind_err = |source: std::io::Error| BootstrapError::SocketBind {
            path: path.to_path_buf(),
            source,
        };

        let addr = match namespace {
            SocketNamespace::Filesystem => {
                if let Some(dir) = path.parent() {
                    std::fs::create_dir_all(dir).map_err(bind_err)?;
                }
                match std::fs::remove_file(path) {
                    Ok(()) => debug!(?path, "Removed stale X11 socket"),
                    Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
                    Err(e) => return Err(bind_err(e)),
                }
                SocketAddrUnix::new(path).map_err(|e| bind_err(e.into()))?
            }
            #[cfg(any(target_os = "linux", target_os = "android"))]
            SocketNamespace::Abstract => {
                use std::os::unix::ffi::OsStrExt;
                SocketAddrUnix::new_abstract_name(path.as_os_str().as_bytes())
                    .map_err(|e| bind_err(e.into()))?
            }
            #[cfg(not(any(target_os = "linux", target_os = "android")))]
            SocketNamespace::Abstract => {
                return Err(bind_err(std::io::Error::from(std::io::ErrorKind::Unsupported)))
            }
        };

        let fd = rustix::net::socket_with(
            rustix::net::AddressFamily::UNIX,
            rustix::net::SocketType::STREAM,
            rustix::net::SocketFlags::CLOEXEC,
            None,
        )
        .map_err(|e| bind_err(e.into()))?;
        rustix::net::bind_unix(&fd, &addr).map_err(|e| bind_err(e.into()))?;
        rustix::net::listen(&fd, 1).map_err(|e| bind_err(e.into()))?;

        let socket = ListenerSocket {
            fd,
            path: path.to_path_buf(),
            namespace,
        };
        debug!(name = %socket.display_name(), "Listening for X11 clients");
        Ok(socket)
    }

    /// The path this socket is bound to
    pub fn path(&self) -> &Path {
        &self.path
    }

    /// The namespace this socket lives in
    pub fn namespace(&self) -> SocketNamespace {
        self.namespace
    }

    /// Human readable name, abstract sockets are prefixed with `@`
    pub fn display_name(&self) -> String {
        match self.namespace {
            SocketNamespace::Filesystem => self.path.display().to_string(),
            SocketNamespace::Abstract => format!("@{}", self.path.display()),
        }
    }
}

impl AsFd for ListenerSocket {
    fn as_fd(&self) -> BorrowedFd<'_> {
        self.fd.as_fd()
    }
}

impl Drop for ListenerSocket {
    fn drop(&mut self) {
        if self.namespace == SocketNamespace::Filesystem {
            if let Err(e) = std::fs::remove_file(&self.path) {
                warn!(error = ?e, path = ?self.path, "Failed to remove X11 socket");
            }
        }
    }
}

/// Open the unix sockets an X server listens on
///
/// Should only be done after the associated lockfile is acquired!
pub(crate) fn open_x11_sockets_for_display(
    display: u32,
    socket_dir: &Path,
    open_abstract_socket: bool,
) -> Result<Vec<ListenerSocket>, BootstrapError> {
    let path = socket_path(socket_dir, display);
    let mut sockets = vec![ListenerSocket::bind(&path, SocketNamespace::Filesystem)?];
    if open_abstract_socket && cfg!(any(target_os = "linux", target_os = "android")) {
        sockets.push(ListenerSocket::bind(&path, SocketNamespace::Abstract)?);
    }
    Ok(sockets)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::{
        collections::HashSet,
        io::{Read, Write},
        sync::{Arc, Barrier},
    };

    #[test]
    fn grab_writes_pid() {
        let dir = tempfile::tempdir().unwrap();
        let lock = X11Lock::grab(0, dir.path()).unwrap();
        assert_eq!(lock.display_number(), 0);
        let content = std::fs::read_to_string(dir.path().join(".X0-lock")).unwrap();
        assert_eq!(content, format!("{:>10}\n", std::process::id()));
    }

    #[test]
    fn grab_contended() {
        let dir = tempfile::tempdir().unwrap();
        let _held = X11Lock::grab(3, dir.path()).unwrap();
        assert!(matches!(
            X11Lock::grab(3, dir.path()),
            Err(LockError::AlreadyLocked { display: 3 })
        ));
    }

    #[test]
    fn drop_releases_lock() {
        let dir = tempfile::tempdir().unwrap();
        drop(X11Lock::grab(0, dir.path()).unwrap());
        assert!(!dir.path().join(".X0-lock").exists());
        assert!(X11Lock::grab(0, dir.path()).is_ok());
    }

    #[test]
    fn stale_lock_is_reclaimed() {
        let dir = tempfile::tempdir().unwrap();
        let mut child = std::process::Command::new("true").spawn().unwrap();
        let dead_pid = child.id();
        child.wait().unwrap();
        std::fs::write(dir.path().join(".X0-lock"), format!("{:>10}\n", dead_pid)).unwrap();

        let lock = X11Lock::grab(0, dir.path()).unwrap();
        assert_eq!(lock.display_number(), 0);

        let entries: Vec<_> = std::fs::read_dir(dir.path())
            .unwrap()
            .map(|e| e.unwrap().file_name())
            .collect();
        assert_eq!(entries, vec![std::ffi::OsString::from(".X0-lock")]);
    }

    fn dead_pid() -> u32 {
        let mut child = std::process::Command::new("true").spawn().unwrap();
        let pid = child.id();
        child.wait().unwrap();
        pid
    }

    #[test]
    fn concurrent_stale_reclaim_has_one_winner() {
        for _ in 0..20 {
            let dir = Arc::new(tempfile::tempdir().unwrap());
            std::fs::write(dir.path().join(".X0-lock"), format!("{:>10}\n", dead_pid())).unwrap();
            let barrier = Arc::new(Barrier::new(2));

            let handles: Vec<_> = (0..2)
                .map(|_| {
                    let dir = dir.clone();
                    let barrier = barrier.clone();
                    std::thread::spawn(move || {
                        barrier.wait();
                        X11Lock::grab(0, dir.path())
                    })
                })
                .collect();
            let results: Vec<_> = handles.into_iter().map(|h| h.join().unwrap()).collect();

            assert_eq!(results.iter().filter(|r| r.is_ok()).count(), 1);
            assert!(results
                .iter()
                .any(|r| matches!(r, Err(LockError::AlreadyLocked { display: 0 }))));
        }
    }

    #[test]
    fn reclaim_restores_a_replaced_lock() {
        let dir = tempfile::tempdir().unwrap();
        let path = lock_path(dir.path(), 0);
        // another reclaimer already replaced the stale lock with its own
        let live = format!("{:>10}\n", std::process::id());
        std::fs::write(&path, &live).unwrap();

        let stale = Pid::from_raw(dead_pid() as i32).unwrap();
        assert!(!reclaim_stale_lock(&path, stale).unwrap());

        assert_eq!(std::fs::read_to_string(&path).unwrap(), live);
        assert_eq!(std::fs::read_dir(dir.path()).unwrap().count(), 1);
    }

    #[test]
    fn garbage_lock_is_respected() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(dir.path().join(".X0-lock"), "not a pid\n").unwrap();
        assert!(matches!(
            X11Lock::grab(0, dir.path()),
            Err(LockError::AlreadyLocked { display: 0 })
        ));
    }

    #[test]
    fn acquire_skips_locked_displays() {
        let dir = tempfile::tempdir().unwrap();
        let _zero = X11Lock::grab(0, dir.path()).unwrap();
        let _two = X11Lock::grab(2, dir.path()).unwrap();

        let lock = X11Lock::acquire(0..33, dir.path()).unwrap();
        assert_eq!(lock.display_number(), 1);
        let lock = X11Lock::acquire(0..33, dir.path()).unwrap();
        assert_eq!(lock.display_number(), 3);
    }

    #[test]
    fn acquire_is_bounded() {
        let dir = tempfile::tempdir().unwrap();
        let _held: Vec<_> = (0..2).map(|d| X11Lock::grab(d, dir.path()).unwrap()).collect();
        assert!(matches!(
            X11Lock::acquire(0..2, dir.path()),
            Err(LockError::ExhaustedRange { start: 0, end: 2 })
        ));
    }

    #[test]
    fn concurrent_acquire_is_injective() {
        const THREADS: usize = 8;
        let dir = Arc::new(tempfile::tempdir().unwrap());
        let barrier = Arc::new(Barrier::new(THREADS));

        let handles: Vec<_> = (0..THREADS)
            .map(|_| {
                let dir = dir.clone();
                let barrier = barrier.clone();
                std::thread::spawn(move || {
                    barrier.wait();
                    X11Lock::acquire(0..33, dir.path()).unwrap()
                })
            })
            .collect();
        let locks: Vec<X11Lock> = handles.into_iter().map(|h| h.join().unwrap()).collect();

        let numbers: HashSet<u32> = locks.iter().map(X11Lock::display_number).collect();
        assert_eq!(numbers.len(), THREADS);
        assert_eq!(numbers, (0..THREADS as u32).collect::<HashSet<u32>>());
    }

    #[test]
    fn rebind_over_stale_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = socket_path(dir.path(), 0);
        std::fs::write(&path, b"").unwrap();

        let socket = ListenerSocket::bind(&path, SocketNamespace::Filesystem).unwrap();
        assert_eq!(socket.path(), path);

        // A listener closed without unlinking leaves its file behind.
        drop(std::os::unix::net::UnixListener::bind(socket_path(dir.path(), 1)).unwrap());
        ListenerSocket::bind(&socket_path(dir.path(), 1), SocketNamespace::Filesystem).unwrap();
    }

    #[test]
    fn listener_accepts_and_unlinks_on_drop() {
        let dir = tempfile::tempdir().unwrap();
        let path = socket_path(&dir.path().join(".X11-unix"), 4);
        let socket = ListenerSocket::bind(&path, SocketNamespace::Filesystem).unwrap();
        assert!(std::os::unix::net::UnixStream::connect(&path).is_ok());

        drop(socket);
        assert!(!path.exists());
    }

    #[cfg(target_os = "linux")]
    #[test]
    fn sockets_for_display() {
        let dir = tempfile::tempdir().unwrap();
        let sockets = open_x11_sockets_for_display(0, dir.path(), true).unwrap();
        let expected = dir.path().join("X0");

        assert_eq!(sockets.len(), 2);
        assert_eq!(sockets[0].namespace(), SocketNamespace::Filesystem);
        assert_eq!(sockets[0].display_name(), expected.display().to_string());
        assert_eq!(sockets[1].namespace(), SocketNamespace::Abstract);
        assert_eq!(sockets[1].display_name(), format!("@{}", expected.display()));

        // Binding the same abstract name twice must fail.
        assert!(matches!(
            ListenerSocket::bind(&expected, SocketNamespace::Abstract),
            Err(BootstrapError::SocketBind { .. })
        ));
    }

    #[test]
    fn abstract_socket_is_optional() {
        let dir = tempfile::tempdir().unwrap();
        let sockets = open_x11_sockets_for_display(7, dir.path(), false).unwrap();
        assert_eq!(sockets.len(), 1);
        assert_eq!(sockets[0].path(), dir.path().join("X7"));
    }

    #[test]
    fn bind_failure_aborts_by_default() {
        let dir = tempfile::tempdir().unwrap();
        let socket_dir = dir.path().join("sockets");
        // A directory at the socket path cannot be removed by `remove_file`.
        std::fs::create_dir_all(socket_path(&socket_dir, 0)).unwrap();

        let config = XWaylandConfig {
            lock_dir: dir.path().to_path_buf(),
            socket_dir: socket_dir.clone(),
            open_abstract_socket: false,
            ..XWaylandConfig::default()
        };
        assert!(matches!(
            prepare_x11_sockets(&config),
            Err(BootstrapError::SocketBind { .. })
        ));
        // no partial state: the lock was released
        assert!(!lock_path(dir.path(), 0).exists());

        let config = XWaylandConfig {
            bind_failure: BindFailurePolicy::NextDisplay,
            ..config
        };
        let (lock, sockets) = prepare_x11_sockets(&config).unwrap();
        assert_eq!(lock.display_number(), 1);
        assert_eq!(sockets[0].path(), socket_path(&socket_dir, 1));
    }

    #[test]
    fn channel_pair_is_connected() {
        let mut pair = ChannelPair::new(ChannelRole::WindowManager).unwrap();
        pair.child.write_all(b"ping").unwrap();
        let mut buf = [0u8; 4];
        pair.parent.read_exact(&mut buf).unwrap();
        assert_eq!(&buf, b"ping");
        assert_eq!(pair.role, ChannelRole::WindowManager);
    }
}
