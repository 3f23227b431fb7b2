//! Session Controller
//!
//! Drives one tunnel session through
//! `Idle -> PreflightChecking -> Provisioning -> Forwarding -> Terminating -> Idle`
//! and stops or restarts a session owned by another process.

use std::fmt;
use std::net::{IpAddr, ToSocketAddrs};
use std::time::Duration;

use tokio_util::sync::CancellationToken;

use super::registry::{ProcessControl, ProcessLiveness, SessionRegistry, SystemProcesses};
use super::status::{Role, SessionStatus};
use crate::auth::PasswordGate;
use crate::config::Settings;
use crate::error::{Error, Result};
use crate::forwarder::{ForwardReport, PacketForwarder};
use crate::tls::{CertificateStore, Fingerprint, Initiator, Responder, SecureStream};
use crate::tun::{self, InterfaceSpec, TunDevice};

/// How long `stop` waits for the old process to exit
pub const STOP_TIMEOUT: Duration = Duration::from_secs(5);

/// Controller state
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionPhase {
    Idle,
    PreflightChecking,
    Provisioning,
    Forwarding,
    Terminating,
}

/// Where the initiator's password comes from
#[derive(Clone, Default)]
pub enum PasswordSource {
    /// No password; fails if the responder asks for one
    #[default]
    None,
    Given(String),
    /// Ask only when the responder requires it
    Prompt(fn() -> Option<String>),
}

impl PasswordSource {
    async fn resolve(self) -> Option<String> {
        match self {
            PasswordSource::None => None,
            PasswordSource::Given(password) => Some(password),
            PasswordSource::Prompt(prompt) => {
                // Plain thread: an abandoned prompt must not hold the runtime open
                let (tx, rx) = tokio::sync::oneshot::channel();
                std::thread::spawn(move || {
                    let _ = tx.send(prompt());
                });
                rx.await.ok().flatten()
            }
        }
    }
}

impl fmt::Debug for PasswordSource {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            PasswordSource::None => write!(f, "None"),
            PasswordSource::Given(_) => write!(f, "Given(<redacted>)"),
            PasswordSource::Prompt(_) => write!(f, "Prompt"),
        }
    }
}

/// Everything one session start needs
#[derive(Debug, Clone)]
pub struct SessionContext {
    pub role: Role,
    pub process_id: u32,
    pub host_address: String,
    pub settings: Settings,
    /// Responder address dialled by an initiator
    pub peer: Option<String>,
    pub password: PasswordSource,
    /// Overrides `[tls] pinned_fingerprint`
    pub pin: Option<Fingerprint>,
}

impl SessionContext {
    pub fn responder(settings: Settings) -> Self {
        Self {
            role: Role::Responder,
            process_id: std::process::id(),
            host_address: local_host_address(),
            settings,
            peer: None,
            password: PasswordSource::None,
            pin: None,
        }
    }

    pub fn initiator(settings: Settings, peer: impl Into<String>, password: PasswordSource) -> Self {
        Self {
            role: Role::Initiator,
            process_id: std::process::id(),
            host_address: local_host_address(),
            settings,
            peer: Some(peer.into()),
            password,
            pin: None,
        }
    }

    pub fn with_pin(mut self, pin: Option<Fingerprint>) -> Self {
        self.pin = pin;
        self
    }

    /// The record saved when provisioning begins
    pub fn status_record(&self) -> SessionStatus {
        let mut record = SessionStatus::new(self.role, self.process_id, self.host_address.clone());
        record.password_required = self.role == Role::Responder && self.settings.server.require_password;
        record.peer_address = self.peer.clone();
        record
    }
}

/// Facts about the host that gate which roles may run
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HostEnvironment {
    pub platform: String,
    pub privileged: bool,
}

impl HostEnvironment {
    pub fn detect() -> Self {
        Self {
            platform: std::env::consts::OS.to_string(),
            privileged: nix::unistd::Uid::effective().is_root(),
        }
    }
}

/// Result of a stop request
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum StopOutcome {
    NothingToStop,
    /// The operator declined the confirmation
    Declined,
    Stopped { role: Role, pid: u32 },
    /// The recorded process had already exited; its record was removed
    AlreadyGone { role: Role, pid: u32 },
    /// Signalled but still alive at the deadline; the record is kept
    StillRunning { role: Role, pid: u32 },
}

/// What `restart` should start again
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RestartPlan {
    pub role: Role,
    pub peer: Option<String>,
}

/// Orchestrates session start, stop and restart
pub struct SessionController<P = SystemProcesses> {
    registry: SessionRegistry<P>,
    environment: HostEnvironment,
    phase: SessionPhase,
    stop_timeout: Duration,
}

impl SessionController<SystemProcesses> {
    /// Controller for this host using the configured status file
    pub fn for_host(settings: &Settings) -> Self {
        Self::new(
            SessionRegistry::system(settings.paths.status_file.clone()),
            HostEnvironment::detect(),
        )
    }
}

impl<P: ProcessLiveness> SessionController<P> {
    pub fn new(registry: SessionRegistry<P>, environment: HostEnvironment) -> Self {
        Self {
            registry,
            environment,
            phase: SessionPhase::Idle,
            stop_timeout: STOP_TIMEOUT,
        }
    }

    pub fn with_stop_timeout(mut self, timeout: Duration) -> Self {
        self.stop_timeout = timeout;
        self
    }

    pub fn registry(&self) -> &SessionRegistry<P> {
        &self.registry
    }

    pub fn phase(&self) -> SessionPhase {
        self.phase
    }

    fn enter(&mut self, next: SessionPhase) {
        tracing::debug!("Session phase {:?} -> {:?}", self.phase, next);
        self.phase = next;
    }

    /// Platform, privilege and singleton checks. Never touches the record
    /// of an active session.
    pub fn preflight(&self, role: Role) -> Result<()> {
        match role {
            Role::Responder => {
                if self.environment.platform != "linux" {
                    return Err(Error::PlatformUnsupported(format!(
                        "hosting a tunnel requires Linux (this host runs {})",
                        self.environment.platform
                    )));
                }
                if !self.environment.privileged {
                    return Err(Error::PermissionDenied(
                        "hosting a tunnel requires root to create the virtual interface; run with sudo".into(),
                    ));
                }
            }
            Role::Initiator => {
                if !matches!(self.environment.platform.as_str(), "linux" | "macos") {
                    return Err(Error::PlatformUnsupported(format!(
                        "connecting requires Linux or macOS (this host runs {})",
                        self.environment.platform
                    )));
                }
            }
        }

        if let Some(active) = self.registry.status(Some(role))? {
            return Err(Error::AlreadyRunning {
                role: active.role,
                pid: active.process_id,
            });
        }
        // One session per host regardless of role
        if let Some(active) = self.registry.status(None)? {
            return Err(Error::AlreadyRunning {
                role: active.role,
                pid: active.process_id,
            });
        }
        Ok(())
    }

    /// Run a session until `shutdown` fires or the forwarder stops.
    ///
    /// Every failure after the record is saved clears it again before
    /// returning.
    pub async fn start(&mut self, ctx: SessionContext, shutdown: CancellationToken) -> Result<ForwardReport> {
        self.enter(SessionPhase::PreflightChecking);
        if let Err(e) = self.preflight(ctx.role) {
            self.enter(SessionPhase::Idle);
            return Err(e);
        }

        self.enter(SessionPhase::Provisioning);
        let (device, stream, record) = match self.provision(&ctx, &shutdown).await {
            Ok(provisioned) => provisioned,
            Err(e) => {
                if let Err(clear) = self.registry.clear_owned(ctx.process_id) {
                    tracing::warn!("Failed to clear session record: {}", clear);
                }
                self.enter(SessionPhase::Idle);
                return Err(e);
            }
        };

        self.enter(SessionPhase::Forwarding);
        tracing::info!(
            "Tunnel up: {} {} via {}",
            ctx.role,
            device.name(),
            record.peer_address.as_deref().unwrap_or("peer")
        );
        let forwarder = PacketForwarder::new(ctx.settings.transport.framing);
        let report = forwarder.run(device, stream, shutdown).await;

        self.enter(SessionPhase::Terminating);
        self.registry.clear_owned(ctx.process_id)?;
        tracing::info!("Tunnel closed");
        self.enter(SessionPhase::Idle);
        Ok(report)
    }

    async fn provision(
        &self,
        ctx: &SessionContext,
        shutdown: &CancellationToken,
    ) -> Result<(TunDevice, SecureStream, SessionStatus)> {
        let settings = &ctx.settings;
        let timeout = settings.handshake_timeout();

        let responder = match ctx.role {
            Role::Responder => {
                let store = CertificateStore::new(settings.tls.cert_path.clone(), settings.tls.key_path.clone());
                let identity = tokio::task::spawn_blocking(move || {
                    store.ensure()?;
                    store.load()
                })
                .await
                .map_err(|e| Error::Certificate(e.to_string()))??;
                tracing::info!("Certificate fingerprint {}", identity.fingerprint()?);
                Some((identity, PasswordGate::from_settings(settings)?))
            }
            Role::Initiator => None,
        };

        let mut record = ctx.status_record();
        self.registry.save(&record)?;

        let mut spec = InterfaceSpec::new(
            match ctx.role {
                Role::Responder => settings.server_address()?,
                Role::Initiator => settings.client_address()?,
            },
            settings.netmask()?,
        );
        spec.name = Some(settings.interface.name.clone());
        spec.mtu = settings.interface.mtu;

        let establish = async {
            match responder {
                Some((identity, gate)) => {
                    let listener = Responder::bind(settings.listen_address()?, identity, timeout)
                        .await?
                        .with_password_timeout(settings.password_timeout());
                    tracing::info!("Waiting for a peer on port {}", settings.server.port);
                    let (device, (stream, peer)) = tokio::try_join!(open_device(spec), listener.accept(&gate))?;
                    Ok::<_, Error>((device, stream, peer.to_string()))
                }
                None => {
                    let peer = ctx
                        .peer
                        .clone()
                        .ok_or_else(|| Error::Config("no responder address given".into()))?;
                    let pin = match ctx.pin {
                        Some(pin) => Some(pin),
                        None => settings.pinned_fingerprint()?,
                    };
                    let initiator = Initiator::new(pin, timeout);
                    let password = ctx.password.clone();
                    let (device, stream) = tokio::try_join!(
                        open_device(spec),
                        initiator.connect(&peer, settings.server.port, password.resolve())
                    )?;
                    Ok((device, stream, peer))
                }
            }
        };

        let (device, stream, peer) = tokio::select! {
            biased;
            _ = shutdown.cancelled() => return Err(Error::Cancelled),
            result = establish => result?,
        };

        record.peer_address = Some(peer);
        record.interface = Some(device.name().to_string());
        record.peer_count = 1;
        if let Err(e) = self.registry.save(&record) {
            tracing::warn!("Failed to update session record: {}", e);
        }
        Ok((device, stream, record))
    }

    /// Latest recorded session, or `None` if no session is running
    pub fn status(&self) -> Result<Option<SessionStatus>> {
        self.registry.status(None)
    }
}

impl<P: ProcessControl> SessionController<P> {
    /// Terminate the session owned by another process.
    ///
    /// `only` restricts the stop to one role. `confirm` sees the record
    /// before any signal is sent.
    pub async fn stop<F>(&self, only: Option<Role>, confirm: F) -> Result<StopOutcome>
    where
        F: FnOnce(&SessionStatus) -> bool,
    {
        let Some(active) = self.registry.status(only)? else {
            tracing::info!("No active session to stop");
            return Ok(StopOutcome::NothingToStop);
        };
        let (role, pid) = (active.role, active.process_id);

        if !confirm(&active) {
            return Ok(StopOutcome::Declined);
        }

        if !self.registry.processes().terminate(pid)? {
            self.registry.clear_owned(pid)?;
            return Ok(StopOutcome::AlreadyGone { role, pid });
        }
        tracing::info!("Sent SIGTERM to {} session (PID {})", role, pid);

        let deadline = tokio::time::Instant::now() + self.stop_timeout;
        while self.registry.processes().exists(pid) {
            if tokio::time::Instant::now() >= deadline {
                tracing::warn!("PID {} still running after {:?}", pid, self.stop_timeout);
                return Ok(StopOutcome::StillRunning { role, pid });
            }
            tokio::time::sleep(Duration::from_millis(100)).await;
        }

        self.registry.clear_owned(pid)?;
        Ok(StopOutcome::Stopped { role, pid })
    }

    /// Stop whatever ran last and report what to start again.
    ///
    /// Works from the stored record even if its process has already died.
    pub async fn plan_restart(&self) -> Result<Option<RestartPlan>> {
        let Some(last) = self.registry.last_record()? else {
            return Ok(None);
        };
        let plan = RestartPlan {
            role: last.role,
            peer: last.peer_address.filter(|_| last.role == Role::Initiator),
        };

        match self.stop(None, |_| true).await? {
            StopOutcome::Stopped { pid, .. } => tracing::info!("Stopped PID {} for restart", pid),
            StopOutcome::StillRunning { role, pid } => return Err(Error::StillRunning { role, pid }),
            other => tracing::debug!("Restart stop: {:?}", other),
        }
        Ok(Some(plan))
    }
}

async fn open_device(spec: InterfaceSpec) -> Result<TunDevice> {
    tokio::task::spawn_blocking(move || tun::open(&spec))
        .await
        .map_err(|e| Error::Interface(e.to_string()))?
}

/// First IPv4 address the host name resolves to
pub fn local_host_address() -> String {
    let resolved = hostname::get().ok().and_then(|name| {
        let name = name.to_string_lossy().into_owned();
        (name.as_str(), 0)
            .to_socket_addrs()
            .ok()?
            .map(|addr| addr.ip())
            .find(IpAddr::is_ipv4)
    });
    resolved
        .map(|ip| ip.to_string())
        .unwrap_or_else(|| "127.0.0.1".to_string())
}
