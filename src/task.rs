//! Background task plumbing: an interruptible stop flag and a join handle
//! that stops and joins in one call.

use std::sync::{Arc, Condvar, Mutex, MutexGuard};
use std::thread::JoinHandle;
use std::time::{Duration, Instant};

use anyhow::{anyhow, Result};

/// Shared stop flag. Sleeping on it wakes immediately when stop is requested.
#[derive(Clone, Default)]
pub struct StopSignal {
    inner: Arc<(Mutex<bool>, Condvar)>,
}

impl StopSignal {
    pub fn new() -> Self {
        Self::default()
    }

    fn flag(&self) -> MutexGuard<'_, bool> {
        self.inner.0.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    pub fn stop(&self) {
        *self.flag() = true;
        self.inner.1.notify_all();
    }

    pub fn is_stopped(&self) -> bool {
        *self.flag()
    }

    /// Sleep for up to `timeout`. Returns `true` if stop was requested.
    pub fn wait_timeout(&self, timeout: Duration) -> bool {
        let deadline = Instant::now() + timeout;
        let mut stopped = self.flag();
        while !*stopped {
            let now = Instant::now();
            if now >= deadline {
                return false;
            }
            stopped = match self.inner.1.wait_timeout(stopped, deadline - now) {
                Ok((guard, _)) => guard,
                Err(poisoned) => poisoned.into_inner().0,
            };
        }
        true
    }
}

impl std::fmt::Debug for StopSignal {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("StopSignal")
            .field("stopped", &self.is_stopped())
            .finish()
    }
}

#[derive(Debug)]
pub struct TaskHandle {
    name: String,
    stop: StopSignal,
    join: Option<JoinHandle<()>>,
}

impl TaskHandle {
    /// Run `body` on a named thread. `body` must return once `stop` fires.
    pub fn spawn<F>(name: &str, stop: StopSignal, body: F) -> Result<Self>
    where
        F: FnOnce(StopSignal) + Send + 'static,
    {
        let thread_stop = stop.clone();
        let join = std::thread::Builder::new()
            .name(name.to_string())
            .spawn(move || body(thread_stop))
            .map_err(|e| anyhow!("failed to spawn {} thread: {}", name, e))?;
        Ok(Self {
            name: name.to_string(),
            stop,
            join: Some(join),
        })
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn signal(&self) -> StopSignal {
        self.stop.clone()
    }

    pub fn is_finished(&self) -> bool {
        self.join.as_ref().map_or(true, |j| j.is_finished())
    }

    pub fn stop(mut self) -> Result<()> {
        self.stop.stop();
        if let Some(join) = self.join.take() {
            join.join()
                .map_err(|_| anyhow!("{} thread panicked", self.name))?;
        }
        Ok(())
    }
}
