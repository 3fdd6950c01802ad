//! Readiness signal source.
//!
//! XWayland notifies its parent that it is ready to accept a window manager
//! by raising `SIGUSR1`, provided the signal was ignored when it started.
//! [`ReadySignal`] turns the first occurrence of such a signal into a calloop event.
//!
//! The signal is caught by a process-wide handler writing to a socket pair, so it
//! does not matter which thread the kernel delivers it to. Once armed, the signal no
//! longer takes its default action in this process, even after the source is dropped.
//!
//! A signal number can only be armed by one [`ReadySignal`] at a time, so that two
//! subsystems never silently steal each other's notification.

use std::{
    fmt,
    io::{self, Read},
    os::unix::net::UnixStream,
    sync::{Mutex, PoisonError},
};

use calloop::{
    generic::Generic, signals::Signal, EventSource, Interest, Mode, Poll, PostAction, Readiness, Token,
    TokenFactory,
};
use signal_hook_registry::SigId;
use tracing::{debug, trace};

/// Signals currently armed by a [`ReadySignal`]
static CLAIMED: Mutex<Vec<Signal>> = Mutex::new(Vec::new());

/// Error emitted while arming a [`ReadySignal`]
#[derive(Debug, thiserror::Error)]
pub enum ReadyError {
    /// The signal is already armed elsewhere in this process
    #[error("Signal {0:?} is already claimed by another readiness source")]
    AlreadyClaimed(Signal),
    /// The signal handler could not be installed
    #[error("Failed to install a handler for {signal:?}")]
    Handler {
        /// The signal
        signal: Signal,
        /// The underlying error
        #[source]
        source: io::Error,
    },
    /// Inserting the signal source failed
    #[error("Failed to setup the signal source")]
    Loop(#[from] calloop::Error),
}

/// An event source firing the first time a given signal is received
///
/// Arming installs the handler, a signal raised between arming and the first dispatch
/// is thus not lost. Later occurrences of the signal are swallowed for as long as the
/// source lives.
pub struct ReadySignal {
    pipe: Generic<UnixStream>,
    signal: Signal,
    id: SigId,
    fired: bool,
}

impl fmt::Debug for ReadySignal {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ReadySignal")
            .field("signal", &self.signal)
            .field("fired", &self.fired)
            .finish()
    }
}

impl ReadySignal {
    /// Arm a readiness source for `signal`
    pub fn arm(signal: Signal) -> Result<ReadySignal, ReadyError> {
        {
            let mut claimed = CLAIMED.lock().unwrap_or_else(PoisonError::into_inner);
            if claimed.contains(&signal) {
                return Err(ReadyError::AlreadyClaimed(signal));
            }
            claimed.push(signal);
        }

        match install(signal) {
            Ok((pipe, id)) => {
                debug!(?signal, "Readiness signal armed");
                Ok(ReadySignal {
                    pipe: Generic::new(pipe, Interest::READ, Mode::Level),
                    signal,
                    id,
                    fired: false,
                })
            }
            Err(source) => {
                release(signal);
                Err(ReadyError::Handler { signal, source })
            }
        }
    }

    /// The signal this source waits for
    pub fn signal(&self) -> Signal {
        self.signal
    }

    /// Whether the signal was already delivered
    pub fn has_fired(&self) -> bool {
        self.fired
    }
}

/// Signals the registry refuses to handle
const FORBIDDEN: [Signal; 5] = [
    Signal::SIGKILL,
    Signal::SIGSTOP,
    Signal::SIGILL,
    Signal::SIGFPE,
    Signal::SIGSEGV,
];

fn install(signal: Signal) -> io::Result<(UnixStream, SigId)> {
    if FORBIDDEN.contains(&signal) {
        return Err(io::Error::new(
            io::ErrorKind::InvalidInput,
            format!("{:?} cannot be caught", signal),
        ));
    }

    let (read, write) = UnixStream::pair()?;
    read.set_nonblocking(true)?;
    write.set_nonblocking(true)?;

    // SAFETY: the action only issues a write(2), which is async-signal-safe. A full
    // buffer already guarantees a wakeup, so a failed write is ignored.
    let id = unsafe {
        signal_hook_registry::register(signal as libc::c_int, move || {
            let _ = rustix::io::write(&write, &[1]);
        })
    }?;
    Ok((read, id))
}

fn release(signal: Signal) {
    CLAIMED
        .lock()
        .unwrap_or_else(PoisonError::into_inner)
        .retain(|s| *s != signal);
}

impl Drop for ReadySignal {
    fn drop(&mut self) {
        signal_hook_registry::unregister(self.id);
        release(self.signal);
    }
}

impl EventSource for ReadySignal {
    /// The received signal
    type Event = Signal;
    type Metadata = ();
    type Ret = ();
    type Error = io::Error;

    fn process_events<F>(
        &mut self,
        readiness: Readiness,
        token: Token,
        mut callback: F,
    ) -> Result<PostAction, Self::Error>
    where
        F: FnMut(Self::Event, &mut Self::Metadata) -> Self::Ret,
    {
        let signal = self.signal;
        let fired = &mut self.fired;
        self.pipe.process_events(readiness, token, |_, pipe| {
            let mut stream: &UnixStream = &**pipe;
            let mut buf = [0u8; 32];
            let mut received = false;
            loop {
                match stream.read(&mut buf) {
                    Ok(0) => break,
                    Ok(_) => received = true,
                    Err(e) if e.kind() == io::ErrorKind::WouldBlock => break,
                    Err(e) if e.kind() == io::ErrorKind::Interrupted => continue,
                    Err(e) => return Err(e),
                }
            }

            if received {
                if *fired {
                    trace!(?signal, "Ignoring repeated readiness signal");
                } else {
                    *fired = true;
                    debug!(?signal, "Readiness signal received");
                    callback(signal, &mut ());
                }
            }
            Ok(PostAction::Continue)
        })
    }

    fn register(&mut self, poll: &mut Poll, token_factory: &mut TokenFactory) -> calloop::Result<()> {
        self.pipe.register(poll, token_factory)
    }

    fn reregister(&mut self, poll: &mut Poll, token_factory: &mut TokenFactory) -> calloop::Result<()> {
        self.pipe.reregister(poll, token_factory)
    }

    fn unregister(&mut self, poll: &mut Poll) -> calloop::Result<()> {
        self.pipe.unregister(poll)
    }
}
