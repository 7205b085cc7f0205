//! Cooperative scheduler - one thread, many suspended commands
//!
//! Everything the driver does runs on a single-threaded runtime. While an
//! experiment awaits one command, output of every other command keeps
//! flowing into its sinks. Each experiment invocation runs inside an
//! [`Invocation`] scope that supplies its `raise_on_rc` default and records
//! the commands it started, so the controller can kill the ones left running.

use super::command::Command;
use std::future::Future;
use std::io;
use std::sync::{Arc, Mutex};
use std::time::Duration;

tokio::task_local! {
    static INVOCATION: Arc<Invocation>;
}

/// Bookkeeping for one call of an experiment body
#[derive(Debug)]
pub struct Invocation {
    raise_on_rc: bool,
    commands: Mutex<Vec<Command>>,
}

impl Invocation {
    pub fn new(raise_on_rc: bool) -> Arc<Self> {
        Arc::new(Self {
            raise_on_rc,
            commands: Mutex::new(Vec::new()),
        })
    }

    pub fn raise_on_rc(&self) -> bool {
        self.raise_on_rc
    }

    /// Run `fut` with this invocation as the ambient context
    pub async fn scope<F: Future>(self: &Arc<Self>, fut: F) -> F::Output {
        INVOCATION.scope(self.clone(), fut).await
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, Vec<Command>> {
        self.commands.lock().unwrap_or_else(|e| e.into_inner())
    }

    /// Commands started so far
    pub fn started(&self) -> usize {
        self.lock().len()
    }

    /// Commands that have not finished yet
    pub fn running(&self) -> Vec<Command> {
        self.lock()
            .iter()
            .filter(|c| !c.is_finished())
            .cloned()
            .collect()
    }

    /// Kill every command still running; returns how many were signalled
    pub async fn kill_running(&self) -> usize {
        let running = self.running();
        let mut killed = 0;
        for cmd in &running {
            log::warn!(
                "[{}] `{}` outlived its experiment, killing it",
                cmd.server_id(),
                cmd.command()
            );
            match cmd.kill().await {
                Ok(()) => killed += 1,
                Err(e) => log::warn!("[{}] {}", cmd.server_id(), e),
            }
        }
        killed
    }
}

/// `raise_on_rc` for commands started outside any experiment
const DEFAULT_RAISE_ON_RC: bool = true;

pub(crate) fn default_raise_on_rc() -> bool {
    INVOCATION
        .try_with(|inv| inv.raise_on_rc)
        .unwrap_or(DEFAULT_RAISE_ON_RC)
}

pub(crate) fn track(cmd: &Command) {
    // outside an invocation nobody cleans up after the caller
    let _ = INVOCATION.try_with(|inv| inv.lock().push(cmd.clone()));
}

/// Suspend the current task without blocking the others
pub async fn sleep(duration: Duration) {
    tokio::time::sleep(duration).await
}

/// The single-threaded runtime the driver runs on
pub struct Scheduler {
    runtime: tokio::runtime::Runtime,
}

impl Scheduler {
    pub fn new() -> io::Result<Self> {
        let runtime = tokio::runtime::Builder::new_current_thread()
            .enable_all()
            .build()?;
        Ok(Self { runtime })
    }

    /// Drive `fut` and everything it spawns to completion
    pub fn block_on<F: Future>(&self, fut: F) -> F::Output {
        self.runtime.block_on(fut)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Instant;

    #[test]
    fn test_defaults_outside_invocation() {
        assert!(default_raise_on_rc());
    }

    #[tokio::test]
    async fn test_invocation_supplies_default() {
        let inv = Invocation::new(false);
        let seen = inv.scope(async { default_raise_on_rc() }).await;
        assert!(!seen);
        assert_eq!(inv.started(), 0);
        assert_eq!(inv.kill_running().await, 0);
    }

    #[tokio::test]
    async fn test_sleep_is_pending_until_due() {
        let mut fut = tokio_test::task::spawn(sleep(Duration::from_secs(60)));
        tokio_test::assert_pending!(fut.poll());
    }

    #[test]
    fn test_sleeps_interleave_on_one_thread() {
        let scheduler = Scheduler::new().unwrap();
        let start = Instant::now();
        scheduler.block_on(async {
            let a = tokio::spawn(sleep(Duration::from_millis(200)));
            let b = tokio::spawn(sleep(Duration::from_millis(200)));
            a.await.unwrap();
            b.await.unwrap();
        });
        assert!(start.elapsed() < Duration::from_millis(390));
    }
}
