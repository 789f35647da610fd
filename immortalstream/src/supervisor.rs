//! Background health loop for one stream.
//!
//! Every `poll_interval` the supervisor checks the stream and, if it is not
//! connected, forces one reconnect. Transient failures are logged and retried
//! on a later tick (optionally after a backoff delay). The loop ends when the
//! stream is permanently closed or the handle asks it to stop.

use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio::time::{self, MissedTickBehavior};

use crate::config::SupervisorConfig;
use crate::stream::{Link, ReliableStream, StreamState};

/// Drives reconnects for a `ReliableStream`.
pub struct Supervisor {
    stream: ReliableStream,
    config: SupervisorConfig,
}

/// Control handle for a spawned supervisor task.
///
/// Dropping the handle detaches the task; it keeps running until the stream
/// closes.
#[derive(Debug)]
pub struct SupervisorHandle {
    shutdown: watch::Sender<bool>,
    task: JoinHandle<()>,
}

impl SupervisorHandle {
    /// Ask the loop to stop without waiting for it.
    pub fn shutdown(&self) {
        self.shutdown.send_replace(true);
    }

    /// Stop the loop and wait until it has exited.
    pub async fn stop(self) {
        self.shutdown();
        self.join().await;
    }

    /// Wait for the loop to exit on its own.
    pub async fn join(self) {
        if let Err(err) = self.task.await {
            tracing::error!(error = %err, "supervisor task failed");
        }
    }

    pub fn is_finished(&self) -> bool {
        self.task.is_finished()
    }
}

/// Resolves when shutdown is requested. Never resolves once the handle is
/// gone.
async fn shutdown_requested(rx: &mut watch::Receiver<bool>) {
    if rx.wait_for(|stop| *stop).await.is_err() {
        std::future::pending::<()>().await;
    }
}

/// Resolves on the next move into `Disconnected`.
async fn disconnect_event(rx: &mut watch::Receiver<Link>) {
    loop {
        if rx.changed().await.is_err() {
            std::future::pending::<()>().await;
        }
        if rx.borrow_and_update().state == StreamState::Disconnected {
            return;
        }
    }
}

impl Supervisor {
    pub fn new(stream: ReliableStream, config: SupervisorConfig) -> Self {
        Self { stream, config }
    }

    /// Start the loop on the current runtime.
    pub fn spawn(stream: ReliableStream, config: SupervisorConfig) -> SupervisorHandle {
        let (shutdown, rx) = watch::channel(false);
        let task = tokio::spawn(Self::new(stream, config).run(rx));
        SupervisorHandle { shutdown, task }
    }

    /// Run the loop until the stream closes or `shutdown` turns true.
    pub async fn run(self, mut shutdown: watch::Receiver<bool>) {
        let stream = &self.stream;
        let mut ticker = time::interval(self.config.poll_interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
        // The first tick completes immediately; the stream was just connected.
        ticker.tick().await;

        let mut link_rx = stream.subscribe();
        let mut failures: u32 = 0;
        tracing::debug!(poll_interval = ?self.config.poll_interval, "supervisor started");

        loop {
            // Reacting to every disconnect while failing would turn a dead
            // peer into a dial storm, so events only count after a success.
            let wake = self.config.wake_on_disconnect && failures == 0;
            tokio::select! {
                _ = shutdown_requested(&mut shutdown) => break,
                _ = stream.closed() => break,
                _ = ticker.tick() => {}
                _ = disconnect_event(&mut link_rx), if wake => {}
            }

            if stream.is_connected() {
                failures = 0;
                continue;
            }

            let res = tokio::select! {
                res = stream.force_reconnect() => res,
                _ = shutdown_requested(&mut shutdown) => break,
            };
            match res {
                Ok(()) => {
                    if failures > 0 {
                        tracing::info!(failures, "stream recovered");
                    }
                    failures = 0;
                }
                Err(err) if err.is_closed() => {
                    tracing::debug!(error = %err, "stream closed, supervisor exiting");
                    break;
                }
                Err(err) => {
                    failures = failures.saturating_add(1);
                    tracing::warn!(error = %err, failures, "reconnect failed");
                    let delay = self.config.backoff.delay(failures);
                    if !delay.is_zero() {
                        tokio::select! {
                            _ = time::sleep(delay) => {}
                            _ = shutdown_requested(&mut shutdown) => break,
                            _ = stream.closed() => break,
                        }
                        ticker.reset();
                    }
                }
            }
        }
        tracing::debug!("supervisor stopped");
    }
}
