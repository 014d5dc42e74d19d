use crate::util::lock;
use mio::{Events, Interest, Poll, Registry, Token, Waker, unix::SourceFd};
use std::{
    collections::HashMap,
    io,
    os::fd::RawFd,
    sync::{
        Arc, Mutex, Weak,
        atomic::{AtomicBool, AtomicUsize, Ordering},
    },
    thread,
};

const SHUTDOWN: Token = Token(usize::MAX);

struct Watch {
    fd: RawFd,
    on_readable: Box<dyn FnOnce() + Send>,
}

struct Shared {
    registry: Registry,
    waker: Waker,
    running: AtomicBool,
    next_token: AtomicUsize,
    watches: Mutex<HashMap<Token, Watch>>,
}

/// Readiness-driven event loop on a dedicated thread.
///
/// Sockets are watched for readability through [`Reactor::watch`]; the
/// handler runs on the reactor thread, at most once, after its watch has been
/// detached. Cloning shares the same loop.
#[derive(Clone)]
pub struct Reactor {
    shared: Arc<Shared>,
}

/// Handle to one readability watch.
///
/// The watch fires at most once: the reactor removes and deregisters it
/// before invoking the handler, so no re-entrant notification is possible.
/// Dropping the registration detaches it if it has not fired yet.
pub struct Registration {
    token: Token,
    fd: RawFd,
    shared: Weak<Shared>,
}

impl Reactor {
    /// Start the poll loop on its own thread.
    pub fn start() -> io::Result<Self> {
        let poll = Poll::new()?;
        let registry = poll.registry().try_clone()?;
        let waker = Waker::new(poll.registry(), SHUTDOWN)?;
        let shared = Arc::new(Shared {
            registry,
            waker,
            running: AtomicBool::new(true),
            next_token: AtomicUsize::new(0),
            watches: Mutex::new(HashMap::new()),
        });
        let loop_shared = Arc::clone(&shared);
        thread::Builder::new()
            .name("pontoon-reactor".into())
            .spawn(move || run_loop(poll, loop_shared))?;
        Ok(Self { shared })
    }

    pub fn is_running(&self) -> bool {
        self.shared.running.load(Ordering::Acquire)
    }

    /// Watch `fd` for readability. `on_readable` runs once on the reactor
    /// thread, strictly after the watch has been detached.
    pub fn watch(
        &self,
        fd: RawFd,
        on_readable: impl FnOnce() + Send + 'static,
    ) -> io::Result<Registration> {
        let token = Token(self.shared.next_token.fetch_add(1, Ordering::Relaxed));
        self.shared
            .registry
            .register(&mut SourceFd(&fd), token, Interest::READABLE)?;
        lock(&self.shared.watches).insert(
            token,
            Watch {
                fd,
                on_readable: Box::new(on_readable),
            },
        );
        Ok(Registration {
            token,
            fd,
            shared: Arc::downgrade(&self.shared),
        })
    }

    /// Stop the loop. Watches that have not fired are dropped silently.
    pub fn shutdown(&self) {
        self.shared.running.store(false, Ordering::Release);
        if let Err(e) = self.shared.waker.wake() {
            log::error!("reactor wakeup failed: {}", e);
        }
    }
}

fn run_loop(mut poll: Poll, shared: Arc<Shared>) {
    let mut events = Events::with_capacity(64);
    loop {
        if let Err(e) = poll.poll(&mut events, None) {
            if e.kind() == io::ErrorKind::Interrupted {
                continue;
            }
            log::error!("reactor poll failed: {}", e);
            shared.running.store(false, Ordering::Release);
            return;
        }
        for event in events.iter() {
            if event.token() == SHUTDOWN {
                continue;
            }
            // Detach before invoking: the watch cannot fire a second time
            // while the handler is still draining the socket.
            let watch = lock(&shared.watches).remove(&event.token());
            if let Some(watch) = watch {
                let _ = shared.registry.deregister(&mut SourceFd(&watch.fd));
                (watch.on_readable)();
            }
        }
        if !shared.running.load(Ordering::Acquire) {
            for (_, watch) in lock(&shared.watches).drain() {
                let _ = shared.registry.deregister(&mut SourceFd(&watch.fd));
            }
            return;
        }
    }
}

impl Registration {
    /// Remove the watch if it has not fired yet. Idempotent.
    pub fn detach(&self) {
        let Some(shared) = self.shared.upgrade() else {
            return;
        };
        if lock(&shared.watches).remove(&self.token).is_some() {
            let _ = shared.registry.deregister(&mut SourceFd(&self.fd));
        }
    }
}

impl Drop for Registration {
    fn drop(&mut self) {
        self.detach();
    }
}
