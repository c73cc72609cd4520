//! Background worker plumbing shared by every pipeline stage.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Condvar, Mutex, PoisonError};
use std::thread::JoinHandle;
use std::time::{Duration, Instant};

use anyhow::{anyhow, Context, Result};

/// Cooperative stop request. Cloning shares the same flag.
///
/// Waiting on the signal doubles as the worker's idle sleep, so a stop
/// request interrupts the sleep immediately.
#[derive(Clone, Default)]
pub struct StopSignal {
    inner: Arc<(Mutex<bool>, Condvar)>,
}

impl StopSignal {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn request_stop(&self) {
        let (flag, cvar) = &*self.inner;
        *flag.lock().unwrap_or_else(PoisonError::into_inner) = true;
        cvar.notify_all();
    }

    pub fn is_stopped(&self) -> bool {
        *self.inner.0.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Sleep for up to `timeout`. Returns `true` if a stop was requested.
    pub fn wait_timeout(&self, timeout: Duration) -> bool {
        let (flag, cvar) = &*self.inner;
        let deadline = Instant::now() + timeout;
        let mut stopped = flag.lock().unwrap_or_else(PoisonError::into_inner);
        while !*stopped {
            let now = Instant::now();
            if now >= deadline {
                break;
            }
            stopped = cvar
                .wait_timeout(stopped, deadline - now)
                .unwrap_or_else(PoisonError::into_inner)
                .0;
        }
        *stopped
    }
}

struct RunningGuard(Arc<AtomicBool>);

impl Drop for RunningGuard {
    fn drop(&mut self) {
        self.0.store(false, Ordering::SeqCst);
    }
}

/// A named worker thread with its own stop signal.
pub struct WorkerHandle {
    name: String,
    stop: StopSignal,
    running: Arc<AtomicBool>,
    join: Option<JoinHandle<()>>,
}

impl WorkerHandle {
    /// Spawn `body` on a named thread. An `Err` from the body is logged and
    /// the worker reports itself as no longer running.
    pub fn spawn<F>(name: &str, stop: StopSignal, body: F) -> Result<Self>
    where
        F: FnOnce(StopSignal) -> Result<()> + Send + 'static,
    {
        let running = Arc::new(AtomicBool::new(true));
        let guard = RunningGuard(running.clone());
        let thread_stop = stop.clone();
        let thread_name = name.to_string();
        let join = std::thread::Builder::new()
            .name(name.to_string())
            .spawn(move || {
                let _guard = guard;
                log::info!("{} worker started", thread_name);
                match body(thread_stop) {
                    Ok(()) => log::info!("{} worker exited", thread_name),
                    Err(err) => log::error!("{} worker stopped: {:#}", thread_name, err),
                }
            })
            .with_context(|| format!("spawn {} worker", name))?;

        Ok(Self {
            name: name.to_string(),
            stop,
            running,
            join: Some(join),
        })
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn request_stop(&self) {
        self.stop.request_stop();
    }

    pub fn is_running(&self) -> bool {
        self.running.load(Ordering::SeqCst)
    }

    /// Wait for the thread to finish without requesting a stop.
    pub fn join(mut self) -> Result<()> {
        self.join_inner()
    }

    pub fn stop(mut self) -> Result<()> {
        self.stop.request_stop();
        self.join_inner()
    }

    fn join_inner(&mut self) -> Result<()> {
        if let Some(join) = self.join.take() {
            join.join()
                .map_err(|_| anyhow!("{} worker thread panicked", self.name))?;
        }
        Ok(())
    }
}

impl Drop for WorkerHandle {
    fn drop(&mut self) {
        if self.join.is_some() {
            self.stop.request_stop();
            if let Err(err) = self.join_inner() {
                log::error!("{}", err);
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn stop_interrupts_idle_wait() {
        let stop = StopSignal::new();
        let handle = WorkerHandle::spawn("idle", stop, |stop| {
            while !stop.wait_timeout(Duration::from_secs(30)) {}
            Ok(())
        })
        .unwrap();
        assert!(handle.is_running());
        let started = Instant::now();
        handle.stop().unwrap();
        assert!(started.elapsed() < Duration::from_secs(5));
    }

    #[test]
    fn failing_worker_reports_not_running() {
        let handle =
            WorkerHandle::spawn("failing", StopSignal::new(), |_| Err(anyhow!("boom"))).unwrap();
        let deadline = Instant::now() + Duration::from_secs(5);
        while handle.is_running() && Instant::now() < deadline {
            std::thread::sleep(Duration::from_millis(5));
        }
        assert!(!handle.is_running());
        handle.join().unwrap();
    }

    #[test]
    fn panicking_worker_surfaces_on_join() {
        let handle = WorkerHandle::spawn("panicky", StopSignal::new(), |_| -> Result<()> {
            panic!("worker panic")
        })
        .unwrap();
        assert!(handle.join().is_err());
    }

    #[test]
    fn wait_timeout_reports_prior_stop() {
        let stop = StopSignal::new();
        stop.request_stop();
        assert!(stop.is_stopped());
        assert!(stop.wait_timeout(Duration::from_secs(10)));
    }
}
