use crate::api::PipelineApi;
use crate::config::ClientConfig;
use crate::transport::{send_update, StreamTransport, TransportExit, TransportSettings};
use deckpipe_core::{parse_history, RemoteStatus, ResumeStore, RunStatus, RunUpdate};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio::time::{Instant, MissedTickBehavior};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

struct ActiveRun {
    cancel: CancellationToken,
    handle: JoinHandle<()>,
}

/// Owns the lifecycle of one observed run at a time.
pub struct RunOrchestrator {
    api: Arc<dyn PipelineApi>,
    store: Arc<dyn ResumeStore>,
    config: ClientConfig,
    active: Option<ActiveRun>,
    last: Option<(String, mpsc::Sender<RunUpdate>)>,
}

impl RunOrchestrator {
    pub fn new(
        api: Arc<dyn PipelineApi>,
        store: Arc<dyn ResumeStore>,
        config: ClientConfig,
    ) -> Self {
        Self {
            api,
            store,
            config,
            active: None,
            last: None,
        }
    }

    /// Starts a fresh cycle for `run_id`, stopping and awaiting any previous
    /// one first. Updates arrive on `tx` until the run settles or `stop()`.
    pub async fn start(&mut self, run_id: impl Into<String>, tx: mpsc::Sender<RunUpdate>) {
        self.stop().await;
        let run_id = run_id.into();
        let cancel = CancellationToken::new();
        let driver = Driver {
            run_id: run_id.clone(),
            api: self.api.clone(),
            store: self.store.clone(),
            config: self.config.clone(),
            tx: tx.clone(),
            cancel: cancel.clone(),
        };
        let handle = tokio::spawn(driver.run());
        self.active = Some(ActiveRun { cancel, handle });
        self.last = Some((run_id, tx));
    }

    /// Cancels timers, requests and the transport, then waits for the
    /// driver to exit. Idempotent.
    pub async fn stop(&mut self) {
        if let Some(active) = self.active.take() {
            active.cancel.cancel();
            if let Err(err) = active.handle.await {
                if !err.is_cancelled() {
                    warn!("orchestrator_task_error: {err}");
                }
            }
        }
    }

    /// Restarts the last run from `checking`. Returns false if nothing was
    /// ever started.
    pub async fn retry(&mut self) -> bool {
        match self.last.clone() {
            Some((run_id, tx)) => {
                info!("orchestrator_retry: run_id={run_id}");
                self.start(run_id, tx).await;
                true
            }
            None => false,
        }
    }

    /// True while a driver task is still working on the run.
    pub fn is_running(&self) -> bool {
        self.active
            .as_ref()
            .map_or(false, |active| !active.handle.is_finished())
    }

    /// Waits for the current driver to settle on its own.
    pub async fn wait(&mut self) {
        if let Some(active) = self.active.take() {
            if let Err(err) = active.handle.await {
                warn!("orchestrator_task_error: {err}");
            }
        }
    }
}

enum Attached {
    Stream(TransportExit),
    Remote(RemoteStatus),
    Cancelled,
}

struct Driver {
    run_id: String,
    api: Arc<dyn PipelineApi>,
    store: Arc<dyn ResumeStore>,
    config: ClientConfig,
    tx: mpsc::Sender<RunUpdate>,
    cancel: CancellationToken,
}

impl Driver {
    async fn run(self) {
        if !self.publish(RunUpdate::status(RunStatus::Checking)).await {
            return;
        }

        let status = tokio::select! {
            biased;
            _ = self.cancel.cancelled() => return,
            status = self.api.fetch_status(&self.run_id) => status,
        };
        let status = match status {
            Ok(status) => status,
            Err(err) => {
                warn!("status_check_error: run_id={} {err}", self.run_id);
                self.publish(RunUpdate::failure(
                    RunStatus::Error,
                    format!("status check failed: {err}"),
                ))
                .await;
                return;
            }
        };
        info!("run_status: run_id={} remote={status}", self.run_id);

        match status {
            RemoteStatus::Completed | RemoteStatus::Failed => {
                self.settle(status).await;
                return;
            }
            RemoteStatus::Processing => {
                if !self.publish(RunUpdate::status(RunStatus::Streaming)).await {
                    return;
                }
                tokio::select! {
                    biased;
                    _ = self.cancel.cancelled() => return,
                    _ = tokio::time::sleep(self.config.resume_delay) => {}
                }
            }
            RemoteStatus::Queued | RemoteStatus::Unknown => {
                if !self.publish(RunUpdate::status(RunStatus::Queued)).await {
                    return;
                }
            }
        }

        match self.attach().await {
            Attached::Stream(TransportExit::Completed) => {
                self.clear_marker();
                self.publish(RunUpdate::status(RunStatus::Completed)).await;
            }
            Attached::Stream(TransportExit::GaveUp(reason)) => {
                self.publish(RunUpdate::failure(RunStatus::Error, reason)).await;
            }
            Attached::Remote(status) => self.settle(status).await,
            Attached::Stream(TransportExit::Cancelled) | Attached::Cancelled => {}
        }
    }

    /// Runs the transport alongside the status poller until one of them
    /// decides the outcome.
    async fn attach(&self) -> Attached {
        let transport_cancel = self.cancel.child_token();
        let poll_cancel = self.cancel.child_token();
        let (poll_tx, mut poll_rx) = mpsc::channel(1);
        let poller = tokio::spawn(poll_until_terminal(
            self.api.clone(),
            self.run_id.clone(),
            self.config.poll_interval,
            poll_cancel.clone(),
            poll_tx,
        ));

        let mut transport = StreamTransport::new(
            self.api.clone(),
            self.store.clone(),
            TransportSettings::from(&self.config),
        );
        let mut stream = Box::pin(transport.connect(
            &self.run_id,
            &self.tx,
            transport_cancel.clone(),
        ));

        let mut poll_open = true;
        let outcome = loop {
            tokio::select! {
                biased;
                _ = self.cancel.cancelled() => break Attached::Cancelled,
                exit = &mut stream => break Attached::Stream(exit),
                remote = poll_rx.recv(), if poll_open => match remote {
                    Some(status) => {
                        transport_cancel.cancel();
                        break Attached::Remote(status);
                    }
                    None => {
                        debug!("status_poll_closed");
                        poll_open = false;
                    }
                },
            }
        };
        drop(stream);
        transport.disconnect();
        poll_cancel.cancel();
        poller.abort();
        outcome
    }

    /// Terminal path: load history, replace state, publish the final status.
    async fn settle(&self, remote: RemoteStatus) {
        let terminal = if remote == RemoteStatus::Completed {
            RunStatus::Completed
        } else {
            RunStatus::Failed
        };

        let history = tokio::select! {
            biased;
            _ = self.cancel.cancelled() => return,
            history = self.api.fetch_history(&self.run_id) => history,
        };
        match history {
            Ok(snapshot) => {
                let outcome = parse_history(&snapshot);
                debug!(
                    "history_loaded: run_id={} logs={} slides={}",
                    self.run_id,
                    outcome.logs.len(),
                    outcome.slides.len()
                );
                if !self.publish(RunUpdate::Replace(outcome.into())).await {
                    return;
                }
                self.publish(RunUpdate::status(terminal)).await;
            }
            Err(err) => {
                warn!("history_load_error: run_id={} {err}", self.run_id);
                self.publish(RunUpdate::failure(
                    terminal,
                    format!("history load failed: {err}"),
                ))
                .await;
            }
        }
        self.clear_marker();
    }

    fn clear_marker(&self) {
        if let Err(err) = self.store.clear(&self.run_id) {
            warn!("resume_clear_error: run_id={} {err}", self.run_id);
        }
    }

    async fn publish(&self, update: RunUpdate) -> bool {
        send_update(&self.tx, &self.cancel, update).await
    }
}

async fn send_status(
    tx: &mpsc::Sender<RemoteStatus>,
    cancel: &CancellationToken,
    status: RemoteStatus,
) {
    tokio::select! {
        biased;
        _ = cancel.cancelled() => {}
        _ = tx.send(status) => {}
    }
}

/// Re-checks status every `interval` and reports the first terminal one.
/// Poll failures and non-terminal results are ignored.
async fn poll_until_terminal(
    api: Arc<dyn PipelineApi>,
    run_id: String,
    interval: Duration,
    cancel: CancellationToken,
    tx: mpsc::Sender<RemoteStatus>,
) {
    let mut ticker = tokio::time::interval_at(Instant::now() + interval, interval);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
    loop {
        tokio::select! {
            biased;
            _ = cancel.cancelled() => return,
            _ = ticker.tick() => {}
        }
        let status = tokio::select! {
            biased;
            _ = cancel.cancelled() => return,
            status = api.fetch_status(&run_id) => status,
        };
        match status {
            Ok(status) if status.is_terminal() => {
                info!("status_poll_terminal: run_id={run_id} remote={status}");
                send_status(&tx, &cancel, status).await;
                return;
            }
            Ok(status) => debug!("status_poll: run_id={run_id} remote={status}"),
            Err(err) => debug!("status_poll_error: run_id={run_id} {err}"),
        }
    }
}
