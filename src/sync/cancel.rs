//! Statement timeouts and server-side query cancellation.

use std::collections::BTreeMap;
use std::sync::{Arc, Condvar, LazyLock, Mutex, PoisonError, TryLockError};
use std::thread;
use std::time::{Duration, Instant};

use tracing::{debug, warn};

use crate::error::Result;
use crate::opts::Opts;
use crate::protocol::command::Command;
use crate::statement::StatementOptions;

use super::conn::{Control, ConnInner, lock};

/// Run one statement on a short-lived side connection, typically `KILL`.
pub(crate) fn kill(opts: &Arc<Opts>, sql: &str) -> Result<()> {
    debug!(sql, "cancelling through a side connection");
    let mut aux = ConnInner::connect(Arc::clone(opts), Arc::new(Control::default()), false)?;
    let result = aux.execute(&Command::Query(sql.to_owned()), StatementOptions::default());
    aux.quit();
    result.map(drop)
}

/// Tear a connection down from any thread.
///
/// An idle connection quits gracefully. When a statement holds the lock,
/// `kill_session` first kills the server session through a side connection;
/// then the socket is shut down under the blocked reader.
pub(crate) fn shutdown(
    inner: &Mutex<ConnInner>,
    control: &Control,
    opts: &Arc<Opts>,
    kill_session: bool,
) {
    match inner.try_lock() {
        Ok(mut inner) => inner.quit(),
        Err(TryLockError::Poisoned(poisoned)) => poisoned.into_inner().quit(),
        Err(TryLockError::WouldBlock) => {
            if kill_session {
                let thread_id = control.thread_id();
                if let Err(e) = kill(opts, &format!("KILL {thread_id}")) {
                    warn!(thread_id, error = %e, "could not kill the server session");
                }
            }
            control.kill_socket();
        }
    }
}

/// Connection to cancel when its deadline passes.
struct Expiry {
    inner: Arc<Mutex<ConnInner>>,
    control: Arc<Control>,
    opts: Arc<Opts>,
    timeout: Duration,
}

impl Expiry {
    fn fire(self) {
        let thread_id = self.control.thread_id();
        warn!(thread_id, timeout = ?self.timeout, "statement timed out, closing the connection");
        self.control.mark_timed_out();
        shutdown(&self.inner, &self.control, &self.opts, true);
    }
}

#[derive(Default)]
struct Deadlines {
    next_id: u64,
    armed: BTreeMap<(Instant, u64), Expiry>,
    started: bool,
}

/// Deadline queue served by one long-lived timer thread.
///
/// Expired deadlines are handed to a short-lived thread, since killing a
/// session opens a side connection and must not delay other deadlines.
#[derive(Default)]
struct Timer {
    deadlines: Mutex<Deadlines>,
    wake: Condvar,
}

static TIMER: LazyLock<Timer> = LazyLock::new(Timer::default);

impl Timer {
    fn arm(&'static self, deadline: Instant, expiry: Expiry) -> Result<(Instant, u64)> {
        let mut deadlines = lock(&self.deadlines);
        if !deadlines.started {
            thread::Builder::new()
                .name("singlestore-timer".into())
                .spawn(move || self.run())?;
            deadlines.started = true;
        }
        let key = (deadline, deadlines.next_id);
        deadlines.next_id += 1;
        deadlines.armed.insert(key, expiry);
        drop(deadlines);
        self.wake.notify_one();
        Ok(key)
    }

    fn disarm(&self, key: &(Instant, u64)) {
        lock(&self.deadlines).armed.remove(key);
    }

    fn run(&self) {
        let mut deadlines = lock(&self.deadlines);
        loop {
            let now = Instant::now();
            let next = deadlines.armed.first_key_value().map(|(&(deadline, _), _)| deadline);
            match next {
                None => {
                    deadlines = self.wake.wait(deadlines).unwrap_or_else(PoisonError::into_inner);
                }
                Some(deadline) if deadline > now => {
                    deadlines = self
                        .wake
                        .wait_timeout(deadlines, deadline - now)
                        .map_or_else(|poisoned| poisoned.into_inner().0, |(guard, _)| guard);
                }
                Some(_) => {
                    let Some((_, expiry)) = deadlines.armed.pop_first() else {
                        continue;
                    };
                    drop(deadlines);
                    Self::dispatch(expiry);
                    deadlines = lock(&self.deadlines);
                }
            }
        }
    }

    fn dispatch(expiry: Expiry) {
        let expiry = Arc::new(Mutex::new(Some(expiry)));
        let handoff = Arc::clone(&expiry);
        let spawned = thread::Builder::new()
            .name("singlestore-timeout".into())
            .spawn(move || {
                if let Some(expiry) = lock(&handoff).take() {
                    expiry.fire();
                }
            });
        if let Err(e) = spawned {
            debug!(error = %e, "expiring on the timer thread");
            if let Some(expiry) = lock(&expiry).take() {
                expiry.fire();
            }
        }
    }
}

/// Cancels the running statement when it outlives its timeout.
///
/// Dropping the watchdog disarms it.
#[derive(Debug)]
pub(crate) struct Watchdog {
    key: (Instant, u64),
}

impl Watchdog {
    pub(crate) fn arm(
        timeout: Duration,
        inner: &Arc<Mutex<ConnInner>>,
        control: &Arc<Control>,
        opts: &Arc<Opts>,
    ) -> Result<Self> {
        let expiry = Expiry {
            inner: Arc::clone(inner),
            control: Arc::clone(control),
            opts: Arc::clone(opts),
            timeout,
        };
        let key = TIMER.arm(Instant::now() + timeout, expiry)?;
        Ok(Self { key })
    }
}

impl Drop for Watchdog {
    fn drop(&mut self) {
        TIMER.disarm(&self.key);
    }
}
