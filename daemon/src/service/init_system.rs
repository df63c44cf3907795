//! Init-system adapter: readiness/liveness notification over the init
//! system's notification socket plus signal-driven lifecycle control.
//!
//! Wire format: newline-separated `KEY=VALUE` assignments in a single
//! datagram, sent to the socket named by `NOTIFY_SOCKET` (filesystem path, or
//! abstract-namespace when prefixed with `@`). Watchdog expectations arrive
//! via `WATCHDOG_USEC`/`WATCHDOG_PID`.
//!
//! Signal mapping: TERM/INT stop, HUP reloads, USR1 pauses, USR2 resumes.

use core::time::Duration;
use std::ffi::{OsStr, OsString};
use std::os::unix::ffi::OsStrExt as _;
use std::os::unix::net::UnixDatagram;
use std::path::Path;
use std::sync::Arc;
use std::time::Instant;

use eyre::eyre;
use tokio::signal::unix::{SignalKind, signal};
use tokio::sync::mpsc;
use tokio::time::{self, MissedTickBehavior};
use tracing::{debug, error, info, warn};

use crate::app::{AppState, Controller, LifecycleError};
use crate::bridge::BridgeError;
use crate::service::{RestartPolicy, ServiceHost, spawn_resume};

/// Notification-socket client. All sends are best effort; a daemon started
/// outside the init system simply has no socket and every send is a no-op.
pub struct SdNotifier {
    socket: Option<UnixDatagram>,
    watchdog_interval: Option<Duration>,
}

impl SdNotifier {
    /// Reads `NOTIFY_SOCKET` and the watchdog variables from the environment.
    pub fn from_env() -> Self {
        let socket = std::env::var_os("NOTIFY_SOCKET")
            .and_then(|path| connect_notify_socket(&path));
        let watchdog_interval = watchdog_interval_from(
            std::env::var_os("WATCHDOG_USEC"),
            std::env::var_os("WATCHDOG_PID"),
        );
        Self {
            socket,
            watchdog_interval,
        }
    }

    /// Half the watchdog deadline, which is the recommended ping cadence.
    /// `None` when the host did not ask for watchdog pings.
    pub fn watchdog_interval(&self) -> Option<Duration> {
        self.watchdog_interval
    }

    pub fn ready(&self) {
        self.notify("READY=1");
    }

    pub fn reloading(&self) {
        self.notify("RELOADING=1");
    }

    pub fn stopping(&self) {
        self.notify("STOPPING=1");
    }

    pub fn watchdog_ping(&self) {
        self.notify("WATCHDOG=1");
    }

    pub fn status(&self, message: &str) {
        self.notify(&format!("STATUS={message}"));
    }

    fn notify(&self, assignment: &str) {
        let Some(socket) = &self.socket else { return };
        if let Err(error) = socket.send(assignment.as_bytes()) {
            debug!(%error, assignment, "notification send failed");
        }
    }

    #[cfg(test)]
    fn connected_to(path: &Path) -> Self {
        Self {
            socket: connect_notify_socket(path.as_os_str()),
            watchdog_interval: None,
        }
    }
}

fn connect_notify_socket(path: &OsStr) -> Option<UnixDatagram> {
    let socket = UnixDatagram::unbound().ok()?;
    if let Some(name) = path.as_bytes().strip_prefix(b"@") {
        #[cfg(target_os = "linux")]
        {
            use std::os::linux::net::SocketAddrExt as _;
            let addr = std::os::unix::net::SocketAddr::from_abstract_name(name).ok()?;
            socket.connect_addr(&addr).ok()?;
            return Some(socket);
        }
        #[cfg(not(target_os = "linux"))]
        {
            let _ = name;
            return None;
        }
    }
    socket.connect(Path::new(path)).ok()?;
    Some(socket)
}

/// Parses the watchdog deadline, honoring it only when `WATCHDOG_PID` is
/// absent or names this process. Returns half the deadline.
fn watchdog_interval_from(usec: Option<OsString>, pid: Option<OsString>) -> Option<Duration> {
    if let Some(pid) = pid {
        let ours = std::process::id().to_string();
        if pid.to_str() != Some(ours.as_str()) {
            return None;
        }
    }
    let usec: u64 = usec?.to_str()?.parse().ok()?;
    if usec == 0 {
        return None;
    }
    Some(Duration::from_micros(usec / 2))
}

/// The init-system service adapter.
pub struct InitSystemService {
    controller: Arc<Controller>,
    faults: mpsc::Receiver<BridgeError>,
    policy: RestartPolicy,
    heartbeat: Duration,
    notifier: SdNotifier,
}

impl InitSystemService {
    pub fn new(
        controller: Arc<Controller>,
        faults: mpsc::Receiver<BridgeError>,
        policy: RestartPolicy,
        heartbeat: Duration,
    ) -> Self {
        Self {
            controller,
            faults,
            policy,
            heartbeat,
            notifier: SdNotifier::from_env(),
        }
    }
}

impl ServiceHost for InitSystemService {
    /// Runs until a stop signal arrives or the restart budget is exhausted.
    /// Readiness is notified only once the initial resume succeeds.
    async fn run(self) -> eyre::Result<()> {
        let Self {
            controller,
            mut faults,
            mut policy,
            heartbeat,
            notifier,
        } = self;

        let mut terminate = signal(SignalKind::terminate())?;
        let mut interrupt = signal(SignalKind::interrupt())?;
        let mut hangup = signal(SignalKind::hangup())?;
        let mut pause_request = signal(SignalKind::user_defined1())?;
        let mut resume_request = signal(SignalKind::user_defined2())?;

        let (result_tx, mut result_rx) = mpsc::channel(4);
        notifier.status("starting");
        spawn_resume(&controller, &result_tx, None);

        let mut heartbeat = time::interval(heartbeat);
        heartbeat.set_missed_tick_behavior(MissedTickBehavior::Delay);
        let watchdog_interval = notifier.watchdog_interval();
        let mut watchdog =
            time::interval(watchdog_interval.unwrap_or(Duration::from_secs(3600)));
        watchdog.set_missed_tick_behavior(MissedTickBehavior::Delay);

        let started = Instant::now();

        loop {
            tokio::select! {
                _ = terminate.recv() => {
                    info!("received SIGTERM, shutting down");
                    shutdown(&controller, &notifier).await;
                    return Ok(());
                }
                _ = interrupt.recv() => {
                    info!("received SIGINT, shutting down");
                    shutdown(&controller, &notifier).await;
                    return Ok(());
                }
                _ = hangup.recv() => {
                    info!("received SIGHUP, reloading configuration");
                    notifier.reloading();
                    match controller.reload().await {
                        Ok(()) => {
                            notifier.ready();
                            notifier.status("running");
                        }
                        Err(error) if error.is_retryable() => {
                            warn!(%error, "reload failed");
                            notifier.ready();
                            register_failure(
                                &mut policy,
                                &notifier,
                                &controller,
                                &result_tx,
                                error,
                            )?;
                        }
                        // A reload refused in the wrong state, or a broken
                        // config file, keeps the previous service alive; the
                        // operator fixes the file and sends another SIGHUP.
                        Err(error) => {
                            warn!(%error, "reload rejected, keeping previous state");
                            notifier.ready();
                            notifier.status("reload failed");
                        }
                    }
                }
                _ = pause_request.recv() => {
                    info!("received SIGUSR1, pausing");
                    match controller.pause().await {
                        Ok(()) => notifier.status("paused"),
                        Err(error) => warn!(%error, "pause request refused"),
                    }
                }
                _ = resume_request.recv() => {
                    info!("received SIGUSR2, resuming");
                    notifier.status("resuming");
                    spawn_resume(&controller, &result_tx, None);
                }
                Some(outcome) = result_rx.recv() => match outcome {
                    Ok(()) => {
                        info!("service is up");
                        notifier.ready();
                        notifier.status("running");
                    }
                    Err(error) => {
                        register_failure(&mut policy, &notifier, &controller, &result_tx, error)?;
                    }
                },
                Some(fault) = faults.recv() => {
                    warn!(%fault, "event bridge fault");
                    if let Err(error) = controller.pause().await {
                        warn!(%error, "pause after bridge fault failed");
                    }
                    register_failure(
                        &mut policy,
                        &notifier,
                        &controller,
                        &result_tx,
                        fault.into(),
                    )?;
                }
                _ = heartbeat.tick() => {
                    if controller.state() == AppState::Running {
                        notifier.status(&format!(
                            "running for {}s",
                            started.elapsed().as_secs()
                        ));
                    }
                }
                _ = watchdog.tick(), if watchdog_interval.is_some() => {
                    notifier.watchdog_ping();
                }
            }
        }
    }
}

async fn shutdown(controller: &Arc<Controller>, notifier: &SdNotifier) {
    notifier.stopping();
    if let Err(error) = controller.stop().await {
        warn!(%error, "stop during shutdown failed");
    }
    notifier.status("stopped");
}

/// Spends restart budget on a retryable failure; anything else, or an
/// exhausted budget, ends the adapter with an error.
fn register_failure(
    policy: &mut RestartPolicy,
    notifier: &SdNotifier,
    controller: &Arc<Controller>,
    results: &mpsc::Sender<Result<(), LifecycleError>>,
    error: LifecycleError,
) -> eyre::Result<()> {
    if !error.is_retryable() {
        error!(%error, "unrecoverable failure");
        notifier.status("failed");
        return Err(error.into());
    }
    match policy.next_attempt() {
        Some(delay) => {
            warn!(%error, attempt = policy.restarts(), ?delay, "connection failed, scheduling restart");
            notifier.status("reconnecting");
            spawn_resume(controller, results, Some(delay));
            Ok(())
        }
        None => {
            error!(%error, "restart budget exhausted, giving up");
            notifier.status("restart budget exhausted");
            Err(eyre!("restart budget exhausted: {error}"))
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn recv_assignment(socket: &UnixDatagram) -> String {
        let mut buf = [0_u8; 256];
        let len = socket.recv(&mut buf).unwrap();
        String::from_utf8(buf.get(..len).unwrap().to_vec()).unwrap()
    }

    #[test]
    fn notifications_arrive_on_the_socket() {
        let dir = std::env::temp_dir().join(format!("doortray_notify_{}", std::process::id()));
        std::fs::create_dir_all(&dir).unwrap();
        let socket_path = dir.join("notify.sock");
        drop(std::fs::remove_file(&socket_path));
        let receiver = UnixDatagram::bind(&socket_path).unwrap();
        receiver
            .set_read_timeout(Some(Duration::from_secs(2)))
            .unwrap();

        let notifier = SdNotifier::connected_to(&socket_path);
        notifier.ready();
        notifier.status("running");
        notifier.stopping();

        assert_eq!(recv_assignment(&receiver), "READY=1");
        assert_eq!(recv_assignment(&receiver), "STATUS=running");
        assert_eq!(recv_assignment(&receiver), "STOPPING=1");

        drop(std::fs::remove_file(&socket_path));
    }

    #[test]
    fn missing_socket_makes_sends_a_no_op() {
        let notifier = SdNotifier {
            socket: None,
            watchdog_interval: None,
        };
        notifier.ready();
        notifier.watchdog_ping();
        assert_eq!(notifier.watchdog_interval(), None);
    }

    #[test]
    fn watchdog_interval_is_half_the_deadline() {
        let interval = watchdog_interval_from(Some(OsString::from("60000000")), None);
        assert_eq!(interval, Some(Duration::from_secs(30)));
    }

    #[test]
    fn watchdog_for_another_pid_is_ignored() {
        let interval = watchdog_interval_from(
            Some(OsString::from("60000000")),
            Some(OsString::from("999999999")),
        );
        assert_eq!(interval, None);
    }

    #[test]
    fn watchdog_honors_our_own_pid() {
        let interval = watchdog_interval_from(
            Some(OsString::from("2000000")),
            Some(OsString::from(std::process::id().to_string())),
        );
        assert_eq!(interval, Some(Duration::from_secs(1)));
    }

    #[test]
    fn garbage_watchdog_values_are_ignored() {
        assert_eq!(watchdog_interval_from(Some(OsString::from("soon")), None), None);
        assert_eq!(watchdog_interval_from(Some(OsString::from("0")), None), None);
        assert_eq!(watchdog_interval_from(None, None), None);
    }

    mod control_loop {
        use std::path::PathBuf;

        use nix::sys::signal::{Signal, raise};
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

        /// Serves well-behaved sessions forever, with "off" as the initial state.
        fn spawn_scripted_source(listener: tokio::net::TcpListener) {
            tokio::spawn(async move {
                loop {
                    let mut ws = server::accept(&listener).await;
                    tokio::spawn(async move {
                        server::handshake(&mut ws, TOKEN, ENTITY, "off").await;
                        use futures::StreamExt as _;
                        while let Some(Ok(message)) = ws.next().await {
                            if matches!(
                                message,
                                tokio_tungstenite::tungstenite::Message::Close(_)
                            ) {
                                break;
                            }
                        }
                    });
                }
            });
        }

        async fn await_state(controller: &Arc<Controller>, expected: AppState) {
            time::timeout(Duration::from_secs(5), async {
                while controller.state() != expected {
                    time::sleep(Duration::from_millis(20)).await;
                }
            })
            .await
            .unwrap_or_else(|_| panic!("never reached {expected:?}"));
        }

        #[tokio::test]
        async fn failed_reload_keeps_the_control_loop_alive() {
            let (listener, address) = server::bind().await;
            spawn_scripted_source(listener);

            let (surface, _icons) = RecordingSurface::new();
            let tray = Tray::new(Arc::new(surface), Duration::from_secs(1));
            let (fault_tx, fault_rx) = mpsc::channel(4);
            let controller = Arc::new(Controller::new(
                test_config(&address),
                PathBuf::from("/nonexistent/doortray.toml"),
                tray,
                fault_tx,
            ));
            let policy = RestartPolicy::new(3, Duration::from_secs(60), None);
            let service = InitSystemService::new(
                Arc::clone(&controller),
                fault_rx,
                policy,
                Duration::from_secs(30),
            );
            let task = tokio::spawn(service.run());

            await_state(&controller, AppState::Running).await;

            raise(Signal::SIGUSR1).unwrap();
            await_state(&controller, AppState::Paused).await;

            // Reloading while paused is refused by the controller; the
            // adapter must report that and keep serving signals.
            raise(Signal::SIGHUP).unwrap();
            time::sleep(Duration::from_millis(200)).await;
            assert!(!task.is_finished(), "control loop died on a rejected reload");
            assert_eq!(controller.state(), AppState::Paused);

            raise(Signal::SIGUSR2).unwrap();
            await_state(&controller, AppState::Running).await;

            raise(Signal::SIGTERM).unwrap();
            time::timeout(Duration::from_secs(5), task)
                .await
                .unwrap()
                .unwrap()
                .unwrap();
            assert_eq!(controller.state(), AppState::Stopped);
        }
    }
}
