//! Single-worker loop around the orchestrator.
//!
//! Callers never wait for a pass: they queue a [`Request`] through the
//! [`OrchestratorHandle`] and observe progress on the status channel.

use super::{
    access_point::AccessPointDriver,
    client::ClientDriver,
    orchestrator::Orchestrator,
    probe::NetworkProbe,
    types::{NetworkMode, NetworkStatus, SavedNetwork},
};
use log::{debug, info, warn};
use std::{
    future,
    sync::{
        Arc,
        atomic::{AtomicBool, Ordering},
    },
};
use thiserror::Error;
use tokio::{
    sync::{mpsc, watch},
    task::JoinHandle,
    time::{Instant, sleep_until},
};

pub const DEFAULT_QUEUE_DEPTH: usize = 8;

#[derive(Clone, Debug, PartialEq, Eq)]
pub enum Request {
    EnsureConnectivity,
    ForceApMode,
    ConnectTo(SavedNetwork),
}

#[derive(Error, Debug, PartialEq, Eq)]
pub enum RequestError {
    #[error("request queue is full")]
    QueueFull,
    #[error("network supervisor is not running")]
    Stopped,
}

/// Cloneable access to the supervisor for the HTTP surface and `main`.
#[derive(Clone)]
pub struct OrchestratorHandle {
    requests: mpsc::Sender<Request>,
    status: watch::Receiver<NetworkStatus>,
    cancel: Arc<AtomicBool>,
    ensure_queued: Arc<AtomicBool>,
}

impl OrchestratorHandle {
    pub fn new(
        requests: mpsc::Sender<Request>,
        status: watch::Receiver<NetworkStatus>,
        cancel: Arc<AtomicBool>,
    ) -> Self {
        Self {
            requests,
            status,
            cancel,
            ensure_queued: Arc::new(AtomicBool::new(false)),
        }
    }

    pub fn status(&self) -> NetworkStatus {
        self.status.borrow().clone()
    }

    pub fn subscribe(&self) -> watch::Receiver<NetworkStatus> {
        self.status.clone()
    }

    /// Queue a connectivity pass. A pass that is already queued absorbs
    /// this request.
    pub fn ensure_connectivity(&self) -> Result<(), RequestError> {
        if self.ensure_queued.swap(true, Ordering::SeqCst) {
            debug!("connectivity pass already queued");
            return Ok(());
        }

        self.submit(Request::EnsureConnectivity).inspect_err(|_| {
            self.ensure_queued.store(false, Ordering::SeqCst);
        })
    }

    /// Abort a running pass at the next candidate and switch to AP mode.
    pub fn force_ap_mode(&self) -> Result<(), RequestError> {
        self.cancel.store(true, Ordering::SeqCst);

        self.submit(Request::ForceApMode).inspect_err(|_| {
            self.cancel.store(false, Ordering::SeqCst);
        })
    }

    pub fn connect_to(&self, network: SavedNetwork) -> Result<(), RequestError> {
        self.submit(Request::ConnectTo(network))
    }

    fn submit(&self, request: Request) -> Result<(), RequestError> {
        self.requests.try_send(request).map_err(|e| match e {
            mpsc::error::TrySendError::Full(request) => {
                warn!("dropping {request:?}: queue full");
                RequestError::QueueFull
            }
            mpsc::error::TrySendError::Closed(_) => RequestError::Stopped,
        })
    }
}

impl<P, C, A> Orchestrator<P, C, A>
where
    P: NetworkProbe + Send + 'static,
    C: ClientDriver + Send + 'static,
    A: AccessPointDriver + Send + 'static,
{
    /// Move the orchestrator into its worker task.
    pub fn spawn(self, queue_depth: usize) -> (OrchestratorHandle, JoinHandle<()>) {
        let (tx, rx) = mpsc::channel(queue_depth);
        let handle = OrchestratorHandle::new(tx, self.subscribe(), self.cancel_flag());
        let ensure_queued = handle.ensure_queued.clone();

        let task = tokio::spawn(self.run(rx, ensure_queued));

        (handle, task)
    }

    async fn run(mut self, mut requests: mpsc::Receiver<Request>, ensure_queued: Arc<AtomicBool>) {
        info!("network supervisor started");

        let mode = self.initialize().await;
        info!("initial network mode: {mode}");

        loop {
            let deadline = self.next_wakeup().map(|delay| Instant::now() + delay);

            tokio::select! {
                biased;

                request = requests.recv() => {
                    let Some(request) = request else {
                        info!("request channel closed");
                        break;
                    };

                    debug!("handle {request:?}");

                    let outcome = match request {
                        Request::EnsureConnectivity => {
                            ensure_queued.store(false, Ordering::SeqCst);
                            self.ensure_connectivity().await
                        }
                        Request::ForceApMode => self.force_ap_mode().await,
                        Request::ConnectTo(network) => self.connect_to(network).await,
                    };

                    info!("request finished: {outcome:?}");
                }
                _ = wait_until(deadline) => {
                    if self.mode() == NetworkMode::ClientConnected {
                        self.check_connectivity().await;
                    } else {
                        let outcome = self.ensure_connectivity().await;
                        info!("scheduled pass finished: {outcome:?}");
                    }
                }
            }
        }

        info!("network supervisor stopped");
    }
}

async fn wait_until(deadline: Option<Instant>) {
    match deadline {
        Some(deadline) => sleep_until(deadline).await,
        None => future::pending().await,
    }
}
