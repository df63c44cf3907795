//! Control-manager adapter: lifecycle control through an in-process request
//! channel, mirroring hosts whose service manager issues discrete control
//! codes and expects an acknowledging status per request.
//!
//! Requests are processed strictly in arrival order. Each request is
//! acknowledged with a pending status before the transition runs; the settled
//! status is observable through a later `Interrogate`.

use core::time::Duration;
use std::sync::Arc;

use thiserror::Error;
use tokio::sync::{mpsc, oneshot};
use tokio::time::{self, MissedTickBehavior};
use tracing::{debug, error, info, warn};

use crate::app::{AppState, Controller, LifecycleError};
use crate::bridge::BridgeError;
use crate::service::{RestartPolicy, ServiceHost, ServiceStatus, spawn_resume};

/// Control codes a host can issue.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ControlCode {
    Stop,
    Shutdown,
    Pause,
    Continue,
    Interrogate,
}

/// One control request and its acknowledgement slot.
pub struct ControlRequest {
    code: ControlCode,
    reply: oneshot::Sender<ServiceStatus>,
}

/// The submitting side of the control channel.
#[derive(Clone)]
pub struct ControlHandle {
    requests: mpsc::Sender<ControlRequest>,
}

#[derive(Debug, Error)]
#[error("service control loop is closed")]
pub struct ControlLoopClosed;

impl ControlHandle {
    /// Submits one control code and waits for its acknowledging status.
    ///
    /// # Errors
    ///
    /// Fails with [`ControlLoopClosed`] once the adapter has exited.
    pub async fn submit(&self, code: ControlCode) -> Result<ServiceStatus, ControlLoopClosed> {
        let (reply_tx, reply_rx) = oneshot::channel();
        self.requests
            .send(ControlRequest {
                code,
                reply: reply_tx,
            })
            .await
            .map_err(|_| ControlLoopClosed)?;
        reply_rx.await.map_err(|_| ControlLoopClosed)
    }
}

/// Creates the control channel pair for one adapter instance.
pub fn control_channel(capacity: usize) -> (ControlHandle, mpsc::Receiver<ControlRequest>) {
    let (requests_tx, requests_rx) = mpsc::channel(capacity);
    (
        ControlHandle {
            requests: requests_tx,
        },
        requests_rx,
    )
}

/// The control-manager service adapter.
pub struct ControlManagerService {
    controller: Arc<Controller>,
    requests: mpsc::Receiver<ControlRequest>,
    faults: mpsc::Receiver<BridgeError>,
    policy: RestartPolicy,
    heartbeat: Duration,
}

impl ControlManagerService {
    pub fn new(
        controller: Arc<Controller>,
        requests: mpsc::Receiver<ControlRequest>,
        faults: mpsc::Receiver<BridgeError>,
        policy: RestartPolicy,
        heartbeat: Duration,
    ) -> Self {
        Self {
            controller,
            requests,
            faults,
            policy,
            heartbeat,
        }
    }
}

impl ServiceHost for ControlManagerService {
    /// Runs until the host requests a stop, the control channel closes, or the
    /// restart budget is exhausted.
    async fn run(self) -> eyre::Result<()> {
        let Self {
            controller,
            mut requests,
            mut faults,
            mut policy,
            heartbeat,
        } = self;

        let (result_tx, mut result_rx) = mpsc::channel(4);
        let mut last_status = ServiceStatus::StartPending;
        spawn_resume(&controller, &result_tx, None);

        let mut heartbeat = time::interval(heartbeat);
        heartbeat.set_missed_tick_behavior(MissedTickBehavior::Delay);

        loop {
            tokio::select! {
                request = requests.recv() => {
                    let Some(ControlRequest { code, reply }) = request else {
                        // Every handle is gone; nothing can ever stop us now,
                        // so shut down instead of running unsupervised.
                        info!("control channel closed, shutting down");
                        if let Err(error) = controller.stop().await {
                            warn!(%error, "stop during shutdown failed");
                        }
                        return Ok(());
                    };
                    match code {
                        ControlCode::Stop | ControlCode::Shutdown => {
                            let _ = reply.send(ServiceStatus::StopPending);
                            info!(?code, "host requested stop");
                            if let Err(error) = controller.stop().await {
                                warn!(%error, "stop request against a stopped service");
                            }
                            // Requests already queued behind the stop get a
                            // terminal status instead of a closed channel.
                            while let Ok(ControlRequest { reply, .. }) = requests.try_recv() {
                                let _ = reply.send(ServiceStatus::Stopped);
                            }
                            return Ok(());
                        }
                        ControlCode::Pause => {
                            let _ = reply.send(ServiceStatus::PausePending);
                            match controller.pause().await {
                                Ok(()) => last_status = ServiceStatus::Paused,
                                // A pause outside Running means the host lost
                                // track of our state; refuse, keep the status.
                                Err(error) => warn!(%error, "pause request refused"),
                            }
                        }
                        ControlCode::Continue => {
                            let _ = reply.send(ServiceStatus::ContinuePending);
                            last_status = ServiceStatus::ContinuePending;
                            spawn_resume(&controller, &result_tx, None);
                        }
                        ControlCode::Interrogate => {
                            // Pure status probe, no transition.
                            let _ = reply.send(last_status);
                        }
                    }
                }
                Some(outcome) = result_rx.recv() => match outcome {
                    Ok(()) => {
                        info!("service is up");
                        last_status = ServiceStatus::Running;
                    }
                    Err(error) => {
                        register_failure(&mut policy, &controller, &result_tx, error)?;
                    }
                },
                Some(fault) = faults.recv() => {
                    warn!(%fault, "event bridge fault");
                    match controller.pause().await {
                        Ok(()) => last_status = ServiceStatus::Paused,
                        Err(error) => warn!(%error, "pause after bridge fault failed"),
                    }
                    register_failure(&mut policy, &controller, &result_tx, fault.into())?;
                }
                _ = heartbeat.tick() => {
                    if controller.state() == AppState::Running {
                        debug!("service heartbeat");
                    }
                }
            }
        }
    }
}

/// Spends restart budget on a retryable failure; anything else, or an
/// exhausted budget, ends the adapter with an error.
fn register_failure(
    policy: &mut RestartPolicy,
    controller: &Arc<Controller>,
    results: &mpsc::Sender<Result<(), LifecycleError>>,
    error: LifecycleError,
) -> eyre::Result<()> {
    if !error.is_retryable() {
        error!(%error, "unrecoverable failure");
        return Err(error.into());
    }
    match policy.next_attempt() {
        Some(delay) => {
            warn!(%error, attempt = policy.restarts(), ?delay, "connection failed, scheduling restart");
            spawn_resume(controller, results, Some(delay));
            Ok(())
        }
        None => {
            error!(%error, "restart budget exhausted, giving up");
            Err(eyre::eyre!("restart budget exhausted: {error}"))
        }
    }
}

#[cfg(test)]
mod tests {
    use std::path::PathBuf;
    use std::sync::atomic::{AtomicUsize, Ordering};

    use secrecy::SecretString;

    use super::*;
    use crate::bridge::test_server as server;
    use crate::config::{Config, SensorConfig, ServerConfig, ServiceConfig, TrayConfig};
    use crate::tray::Tray;
    use crate::tray::test_surfaces::RecordingSurface;

    const ENTITY: &str = "binary_sensor.front_door";
    const TOKEN: &str = "t0ken";

    fn test_config(address: &str) -> Arc<Config> {
        Arc::new(Config {
            server: ServerConfig {
                address: address.to_string(),
                token: Some(SecretString::from(TOKEN)),
                connect_timeout_secs: 1,
            },
            sensor: SensorConfig {
                entity: ENTITY.to_string(),
            },
            service: ServiceConfig::default(),
            tray: TrayConfig {
                title: "test".to_string(),
                ready_timeout_secs: 1,
            },
        })
    }

    fn test_service(
        address: &str,
        policy: RestartPolicy,
        heartbeat: Duration,
    ) -> (ControlManagerService, ControlHandle) {
        let (surface, _icons) = RecordingSurface::new();
        let tray = Tray::new(Arc::new(surface), Duration::from_secs(1));
        let (fault_tx, fault_rx) = mpsc::channel(4);
        let controller = Arc::new(Controller::new(
            test_config(address),
            PathBuf::from("/nonexistent/doortray.toml"),
            tray,
            fault_tx,
        ));
        let (handle, requests) = control_channel(4);
        let service = ControlManagerService::new(controller, requests, fault_rx, policy, heartbeat);
        (service, handle)
    }

    /// Serves well-behaved sessions forever, with "off" as the initial state.
    fn spawn_scripted_source(listener: tokio::net::TcpListener) {
        tokio::spawn(async move {
            loop {
                let mut ws = server::accept(&listener).await;
                tokio::spawn(async move {
                    server::handshake(&mut ws, TOKEN, ENTITY, "off").await;
                    use futures::StreamExt as _;
                    while let Some(Ok(message)) = ws.next().await {
                        if matches!(message, tokio_tungstenite::tungstenite::Message::Close(_)) {
                            break;
                        }
                    }
                });
            }
        });
    }

    /// Polls `Interrogate` until `expected` is observed.
    async fn await_status(handle: &ControlHandle, expected: ServiceStatus) {
        time::timeout(Duration::from_secs(5), async {
            loop {
                if handle.submit(ControlCode::Interrogate).await.unwrap() == expected {
                    return;
                }
                time::sleep(Duration::from_millis(20)).await;
            }
        })
        .await
        .unwrap_or_else(|_| panic!("never reached {expected:?}"));
    }

    #[tokio::test]
    async fn interrogate_echoes_status_without_side_effects() {
        // Restarts are scheduled far in the future, so the status stays
        // StartPending while we probe it.
        let policy = RestartPolicy::new(3, Duration::from_secs(60), None);
        let (service, handle) = test_service("ws://127.0.0.1:1", policy, Duration::from_secs(30));
        let task = tokio::spawn(service.run());

        for _ in 0..3 {
            let status = handle.submit(ControlCode::Interrogate).await.unwrap();
            assert_eq!(status, ServiceStatus::StartPending);
        }

        let ack = handle.submit(ControlCode::Stop).await.unwrap();
        assert_eq!(ack, ServiceStatus::StopPending);
        task.await.unwrap().unwrap();
    }

    #[tokio::test]
    async fn pause_continue_stop_flow() {
        let (listener, address) = server::bind().await;
        spawn_scripted_source(listener);
        let policy = RestartPolicy::new(3, Duration::from_millis(10), None);
        let (service, handle) = test_service(&address, policy, Duration::from_secs(30));
        let task = tokio::spawn(service.run());

        await_status(&handle, ServiceStatus::Running).await;

        let ack = handle.submit(ControlCode::Pause).await.unwrap();
        assert_eq!(ack, ServiceStatus::PausePending);
        await_status(&handle, ServiceStatus::Paused).await;

        let ack = handle.submit(ControlCode::Continue).await.unwrap();
        assert_eq!(ack, ServiceStatus::ContinuePending);
        await_status(&handle, ServiceStatus::Running).await;

        let ack = handle.submit(ControlCode::Shutdown).await.unwrap();
        assert_eq!(ack, ServiceStatus::StopPending);
        task.await.unwrap().unwrap();

        // The adapter is gone; further submissions fail cleanly.
        assert!(handle.submit(ControlCode::Interrogate).await.is_err());
    }

    #[tokio::test]
    async fn interrogate_answers_while_a_connect_hangs() {
        // A source that accepts the TCP connection and never answers keeps
        // the initial resume in flight until the connect timeout.
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let address = format!("ws://{}", listener.local_addr().unwrap());
        tokio::spawn(async move {
            let mut held = Vec::new();
            loop {
                let (stream, _) = listener.accept().await.unwrap();
                held.push(stream);
            }
        });

        let policy = RestartPolicy::new(3, Duration::from_secs(60), None);
        let (service, handle) = test_service(&address, policy, Duration::from_millis(50));
        let task = tokio::spawn(service.run());
        time::sleep(Duration::from_millis(100)).await;

        let status =
            time::timeout(Duration::from_secs(1), handle.submit(ControlCode::Interrogate))
                .await
                .expect("control loop stalled behind the connect")
                .unwrap();
        assert_eq!(status, ServiceStatus::StartPending);

        // Stop queues behind the transition lock for at most the bounded
        // connect attempt.
        let ack = time::timeout(Duration::from_secs(3), handle.submit(ControlCode::Stop))
            .await
            .expect("stop stalled behind the connect")
            .unwrap();
        assert_eq!(ack, ServiceStatus::StopPending);
        task.await.unwrap().unwrap();
    }

    #[tokio::test]
    async fn requests_queued_behind_stop_are_answered_stopped() {
        let policy = RestartPolicy::new(3, Duration::from_secs(60), None);
        let (service, handle) = test_service("ws://127.0.0.1:1", policy, Duration::from_secs(30));

        // Enqueue a stop and a trailing interrogate before the loop starts,
        // so both sit in the channel when the stop is processed.
        let stop_handle = handle.clone();
        let stop = tokio::spawn(async move { stop_handle.submit(ControlCode::Stop).await });
        time::sleep(Duration::from_millis(50)).await;
        let trailing = tokio::spawn(async move { handle.submit(ControlCode::Interrogate).await });
        time::sleep(Duration::from_millis(50)).await;

        let task = tokio::spawn(service.run());

        assert_eq!(stop.await.unwrap().unwrap(), ServiceStatus::StopPending);
        assert_eq!(trailing.await.unwrap().unwrap(), ServiceStatus::Stopped);
        task.await.unwrap().unwrap();
    }

    #[tokio::test]
    async fn restart_budget_bounds_connection_attempts() {
        // A listener that accepts and immediately drops every connection, so
        // each attempt fails during the websocket handshake.
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let address = format!("ws://{}", listener.local_addr().unwrap());
        let attempts = Arc::new(AtomicUsize::new(0));
        let attempt_counter = Arc::clone(&attempts);
        tokio::spawn(async move {
            loop {
                let (stream, _) = listener.accept().await.unwrap();
                attempt_counter.fetch_add(1, Ordering::SeqCst);
                drop(stream);
            }
        });

        let policy = RestartPolicy::new(3, Duration::from_millis(10), None);
        let (service, _handle) = test_service(&address, policy, Duration::from_secs(30));
        let outcome = time::timeout(Duration::from_secs(10), service.run())
            .await
            .unwrap();

        assert!(outcome.is_err(), "exhausted budget must end the adapter");
        // The initial attempt plus exactly max_restarts retries.
        assert_eq!(attempts.load(Ordering::SeqCst), 4);
    }
}
