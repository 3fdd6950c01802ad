use std::{
    ffi::{OsStr, OsString},
    io,
    os::unix::{
        io::{AsFd, AsRawFd, BorrowedFd, RawFd},
        process::CommandExt,
    },
    process::{Child, Command, Stdio},
};

use calloop::signals::Signal;
use rustix::io::FdFlags;
use tracing::{debug, info};

/// Spawns a process with an explicit set of inherited descriptors
///
/// Every descriptor created by this crate is close-on-exec. The child keeps exactly the
/// descriptors declared with [`inherit`](LaunchHelper::inherit), and closes the ones
/// declared with [`close_in_child`](LaunchHelper::close_in_child) before exec. Descriptor
/// numbers are the same on both sides of the fork, so the raw values may be passed on
/// the command line.
///
/// Spawning consumes the helper, a launch cannot be retried with the same instance.
#[derive(Debug)]
pub struct LaunchHelper<'a> {
    command: Command,
    inherit: Vec<BorrowedFd<'a>>,
    close: Vec<BorrowedFd<'a>>,
    ready_signal: Option<Signal>,
}

impl<'a> LaunchHelper<'a> {
    /// Prepare to launch `program`, resolved through `PATH` if it is not a path
    pub fn new(program: impl AsRef<OsStr>) -> LaunchHelper<'a> {
        LaunchHelper {
            command: Command::new(program),
            inherit: Vec::new(),
            close: Vec::new(),
            ready_signal: None,
        }
    }

    /// Append an argument
    pub fn arg(mut self, arg: impl AsRef<OsStr>) -> Self {
        self.command.arg(arg);
        self
    }

    /// Set an environment variable for the child, on top of the inherited environment
    pub fn env(mut self, key: impl AsRef<OsStr>, value: impl AsRef<OsStr>) -> Self {
        self.command.env(key, value);
        self
    }

    /// Where the child's standard output goes
    pub fn stdout(mut self, stdout: impl Into<Stdio>) -> Self {
        self.command.stdout(stdout);
        self
    }

    /// Where the child's standard error goes
    pub fn stderr(mut self, stderr: impl Into<Stdio>) -> Self {
        self.command.stderr(stderr);
        self
    }

    /// Let the child inherit `fd`
    pub fn inherit(mut self, fd: BorrowedFd<'a>) -> Self {
        self.inherit.push(fd);
        self
    }

    /// Let the child inherit `fd` and pass its number after `flag`
    pub fn inherit_arg(self, flag: &str, fd: BorrowedFd<'a>) -> Self {
        let raw = fd.as_raw_fd();
        self.inherit(fd).arg(flag).arg(raw.to_string())
    }

    /// Close `fd` in the child before exec
    ///
    /// The descriptor is borrowed until [`spawn`](LaunchHelper::spawn) returns, so its
    /// number cannot be reused by an unrelated descriptor in the meantime.
    pub fn close_in_child(mut self, fd: BorrowedFd<'a>) -> Self {
        self.close.push(fd);
        self
    }

    /// Unblock `signal` and set it to ignored in the child
    ///
    /// An X server started with `SIGUSR1` ignored sends `SIGUSR1` to its parent once
    /// it is ready.
    pub fn ready_signal(mut self, signal: Signal) -> Self {
        self.ready_signal = Some(signal);
        self
    }

    /// Arguments passed to the program, excluding the program name
    pub fn args(&self) -> Vec<OsString> {
        self.command.get_args().map(OsStr::to_os_string).collect()
    }

    /// Environment variables explicitly set for the child
    pub fn envs(&self) -> Vec<(OsString, OsString)> {
        self.command
            .get_envs()
            .filter_map(|(k, v)| Some((k.to_os_string(), v?.to_os_string())))
            .collect()
    }

    /// Fork and exec the program
    ///
    /// A failure to find or execute the program terminates the child and is returned
    /// here, the parent never continues on behalf of the child.
    pub fn spawn(self) -> io::Result<Child> {
        let LaunchHelper {
            mut command,
            inherit,
            close,
            ready_signal,
        } = self;
        let inherit: Vec<RawFd> = inherit.iter().map(AsRawFd::as_raw_fd).collect();
        let close: Vec<RawFd> = close.iter().map(AsRawFd::as_raw_fd).collect();
        let signal = ready_signal.map(|s| s as libc::c_int);

        debug!(
            program = ?command.get_program(),
            ?inherit,
            ?close,
            "Spawning with declared descriptors"
        );
        // SAFETY: `setup_child` only issues async-signal-safe syscalls
        // and does not allocate.
        unsafe {
            command.pre_exec(move || setup_child(&inherit, &close, signal));
        }
        let child = command.spawn()?;
        info!(pid = child.id(), program = ?command.get_program(), "Process spawned");
        Ok(child)
    }
}

/// Runs in the child between fork and exec
fn setup_child(inherit: &[RawFd], close: &[RawFd], signal: Option<libc::c_int>) -> io::Result<()> {
    for &fd in close {
        // SAFETY: these are borrowed for the whole spawn in the parent, the child
        // closes its own copies.
        unsafe { rustix::io::close(fd) };
    }

    if let Some(signal) = signal {
        // SAFETY: plain libc calls on a stack allocated set.
        unsafe {
            let mut set = std::mem::MaybeUninit::<libc::sigset_t>::uninit();
            libc::sigemptyset(set.as_mut_ptr());
            libc::sigaddset(set.as_mut_ptr(), signal);
            let ret = libc::pthread_sigmask(libc::SIG_UNBLOCK, set.as_ptr(), std::ptr::null_mut());
            if ret != 0 {
                return Err(io::Error::from_raw_os_error(ret));
            }
            if libc::signal(signal, libc::SIG_IGN) == libc::SIG_ERR {
                return Err(io::Error::last_os_error());
            }
        }
    }

    for &fd in inherit {
        // SAFETY: the descriptor is borrowed for the whole spawn in the parent, so it is
        // open in the child.
        let fd = unsafe { BorrowedFd::borrow_raw(fd) };
        rustix::io::fcntl_setfd(fd, FdFlags::empty())?;
    }
    Ok(())
}

/// Build the launcher for XWayland
///
/// `<binary> :<display> -rootless -terminate -listen <fd>... -wm <fd>`, with
/// `WAYLAND_SOCKET` pointing to the child end of the wayland connection.
#[allow(clippy::too_many_arguments)]
pub(crate) fn xwayland_launcher<'a>(
    binary: &'a OsStr,
    display: u32,
    wayland_socket: BorrowedFd<'a>,
    wm_socket: BorrowedFd<'a>,
    listen_sockets: &'a [impl AsFd],
    parent_ends: [BorrowedFd<'a>; 2],
    ready_signal: Signal,
    envs: &'a [(OsString, OsString)],
) -> LaunchHelper<'a> {
    let mut helper = LaunchHelper::new(binary)
        .arg(format!(":{}", display))
        .arg("-rootless")
        .arg("-terminate");
    for socket in listen_sockets {
        helper = helper.inherit_arg("-listen", socket.as_fd());
    }
    helper = helper
        .inherit_arg("-wm", wm_socket)
        .inherit(wayland_socket)
        .close_in_child(parent_ends[0])
        .close_in_child(parent_ends[1])
        .ready_signal(ready_signal);

    for (key, value) in envs {
        helper = helper.env(key, value);
    }
    // the WAYLAND_SOCKET var tells Xwayland where to connect as a wayland client
    helper
        .env("WAYLAND_SOCKET", wayland_socket.as_raw_fd().to_string())
        .env("DISPLAY", format!(":{}", display))
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::os::unix::net::UnixStream;

    fn fd_is_open(fd: RawFd) -> bool {
        unsafe { libc::fcntl(fd, libc::F_GETFD) != -1 }
    }

    #[test]
    fn xwayland_argv_layout() {
        let (wl_me, wl_x11) = UnixStream::pair().unwrap();
        let (wm_me, wm_x11) = UnixStream::pair().unwrap();
        let (listen_a, listen_b) = UnixStream::pair().unwrap();
        let listeners = [listen_a, listen_b];
        let envs = vec![(OsString::from("XDG_RUNTIME_DIR"), OsString::from("/run/user/1000"))];

        let helper = xwayland_launcher(
            OsStr::new("Xwayland"),
            0,
            wl_x11.as_fd(),
            wm_x11.as_fd(),
            &listeners,
            [wl_me.as_fd(), wm_me.as_fd()],
            Signal::SIGUSR1,
            &envs,
        );

        let expected: Vec<OsString> = vec![
            ":0".into(),
            "-rootless".into(),
            "-terminate".into(),
            "-listen".into(),
            listeners[0].as_raw_fd().to_string().into(),
            "-listen".into(),
            listeners[1].as_raw_fd().to_string().into(),
            "-wm".into(),
            wm_x11.as_raw_fd().to_string().into(),
        ];
        assert_eq!(helper.args(), expected);

        let envs = helper.envs();
        assert!(envs.contains(&("WAYLAND_SOCKET".into(), wl_x11.as_raw_fd().to_string().into())));
        assert!(envs.contains(&("DISPLAY".into(), ":0".into())));
        assert!(envs.contains(&("XDG_RUNTIME_DIR".into(), "/run/user/1000".into())));
    }

    #[cfg(target_os = "linux")]
    #[test]
    fn child_sees_only_declared_descriptors() {
        let (keep_me, keep_child) = UnixStream::pair().unwrap();
        let (close_me, _close_peer) = UnixStream::pair().unwrap();
        let (stray, _stray_peer) = UnixStream::pair().unwrap();

        let script = "for fd in \"$@\"; do \
                      if [ -e /proc/self/fd/$fd ]; then echo open; else echo closed; fi; \
                      done";
        let helper = LaunchHelper::new("sh")
            .arg("-c")
            .arg(script)
            .arg("sh")
            .arg(keep_child.as_raw_fd().to_string())
            .arg(close_me.as_raw_fd().to_string())
            .arg(stray.as_raw_fd().to_string())
            .inherit(keep_child.as_fd())
            .close_in_child(close_me.as_fd())
            .stdout(Stdio::piped());

        let output = helper.spawn().unwrap().wait_with_output().unwrap();
        assert!(output.status.success());
        assert_eq!(String::from_utf8(output.stdout).unwrap(), "open\nclosed\nclosed\n");

        // the parent still holds all of its descriptors
        assert!(fd_is_open(keep_me.as_raw_fd()));
        assert!(fd_is_open(close_me.as_raw_fd()));
        assert!(fd_is_open(keep_child.as_raw_fd()));
    }

    #[test]
    fn missing_binary_is_reported() {
        let err = LaunchHelper::new("/nonexistent/xwayland-bootstrap-test")
            .arg(":0")
            .spawn()
            .unwrap_err();
        assert_eq!(err.kind(), io::ErrorKind::NotFound);
    }
}
