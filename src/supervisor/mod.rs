//! Connection Supervisor
//!
//! Owns the transport and keeps exactly one session alive. Three retry
//! budgets are tracked independently:
//!
//! - startup: failed initial connects, separated by the backoff
//! - loop reconnect: failed ticks, each followed by a reconnect before the
//!   next tick
//! - disconnect reconnect: reconnects after an unexpected disconnect,
//!   separated by the backoff
//!
//! Exhausting any budget ends the run with a [`Termination`] that maps to a
//! process exit status. There is no error return beyond that.


use std::fmt;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use tracing::{debug, error, info, warn};

use crate::config::BridgeConfig;
use crate::router::MessageRouter;
use crate::transport::{Transport, TransportError, TransportEvent, DISCONNECT_NORMAL};

/// Cooperative stop flag, the only state shared with the signal handler
#[derive(Debug, Clone)]
pub struct StopFlag(Arc<AtomicBool>);

impl StopFlag {
    pub fn new() -> Self {
        Self(Arc::new(AtomicBool::new(true)))
    }

    pub fn request_stop(&self) {
        self.0.store(false, Ordering::SeqCst);
    }

    pub fn is_running(&self) -> bool {
        self.0.load(Ordering::SeqCst)
    }
}

impl Default for StopFlag {
    fn default() -> Self {
        Self::new()
    }
}

/// Mutable run state, owned by the run loop
#[derive(Debug, Default)]
pub struct SupervisorState {
    pub running: StopFlag,
    /// Loop iterations, wrapping
    pub heartbeat: u16,
    pub startup_attempts: u32,
    pub loop_reconnect_attempts: u32,
    pub disconnect_reconnect_attempts: u32,
    /// Reconnect before the next tick
    pub pending_reconnect: bool,
}

impl SupervisorState {
    pub fn new(running: StopFlag) -> Self {
        Self {
            running,
            ..Default::default()
        }
    }
}

/// Waits out a backoff interval
#[async_trait]
pub trait Sleeper: Send + Sync {
    async fn sleep(&self, duration: Duration);
}

/// [`Sleeper`] backed by the tokio timer
#[derive(Debug, Clone, Copy, Default)]
pub struct TokioSleeper;

#[async_trait]
impl Sleeper for TokioSleeper {
    async fn sleep(&self, duration: Duration) {
        tokio::time::sleep(duration).await;
    }
}

/// How a supervisor run ended
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Termination {
    /// Stop flag honored
    Shutdown,
    /// A retry ceiling is below 1
    InvalidConfig(String),
    StartupExhausted { attempts: u32 },
    LoopReconnectsExhausted { attempts: u32 },
    DisconnectReconnectsExhausted { attempts: u32 },
    /// A fault that no reconnect can cure
    UnexpectedFault(String),
}

impl Termination {
    /// Process exit status for this outcome
    pub fn exit_code(&self) -> i32 {
        match self {
            Termination::Shutdown => 0,
            Termination::InvalidConfig(_)
            | Termination::StartupExhausted { .. }
            | Termination::LoopReconnectsExhausted { .. }
            | Termination::DisconnectReconnectsExhausted { .. } => 1,
            Termination::UnexpectedFault(_) => 2,
        }
    }
}

impl fmt::Display for Termination {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Termination::Shutdown => write!(f, "clean shutdown"),
            Termination::InvalidConfig(msg) => write!(f, "invalid configuration: {}", msg),
            Termination::StartupExhausted { attempts } => {
                write!(f, "startup failed after {} connection attempts", attempts)
            }
            Termination::LoopReconnectsExhausted { attempts } => {
                write!(f, "network loop failed {} times in a row", attempts)
            }
            Termination::DisconnectReconnectsExhausted { attempts } => {
                write!(f, "reconnect after disconnect failed {} times", attempts)
            }
            Termination::UnexpectedFault(msg) => write!(f, "unexpected fault: {}", msg),
        }
    }
}

/// Retry ceilings and timing the supervisor enforces
#[derive(Debug, Clone)]
pub struct RetryPolicy {
    pub max_startup: u32,
    pub max_loop_reconnect: u32,
    pub max_reconnects: u32,
    pub backoff: Duration,
}

impl RetryPolicy {
    pub fn from_config(config: &BridgeConfig) -> Self {
        Self {
            max_startup: config.max_startup,
            max_loop_reconnect: config.max_loop_reconnect,
            max_reconnects: config.max_reconnects,
            backoff: config.retry_backoff,
        }
    }

    fn validate(&self) -> Result<(), String> {
        for (name, ceiling) in [
            ("max_startup", self.max_startup),
            ("max_loop_reconnect", self.max_loop_reconnect),
            ("max_reconnects", self.max_reconnects),
        ] {
            if ceiling < 1 {
                return Err(format!("{} must be at least 1, got {}", name, ceiling));
            }
        }
        Ok(())
    }
}

/// Drives a [`Transport`] through startup, steady state and shutdown
pub struct ConnectionSupervisor<T, S = TokioSleeper> {
    broker: String,
    port: u16,
    keep_alive: Duration,
    policy: RetryPolicy,
    transport: T,
    router: MessageRouter,
    sleeper: S,
    state: SupervisorState,
}

impl<T: Transport, S: Sleeper> ConnectionSupervisor<T, S> {
    pub fn new(config: &BridgeConfig, transport: T, sleeper: S, running: StopFlag) -> Self {
        Self {
            broker: config.broker.clone(),
            port: config.port,
            keep_alive: Duration::from_secs(u64::from(config.keep_alive_secs())),
            policy: RetryPolicy::from_config(config),
            transport,
            router: MessageRouter::from_config(config),
            sleeper,
            state: SupervisorState::new(running),
        }
    }

    pub fn state(&self) -> &SupervisorState {
        &self.state
    }

    pub fn transport(&self) -> &T {
        &self.transport
    }

    /// Run until stopped or until a retry budget runs out
    pub async fn run(&mut self) -> Termination {
        if let Err(msg) = self.policy.validate() {
            error!("CRITICAL: Invalid retry configuration: {}", msg);
            return Termination::InvalidConfig(msg);
        }

        if let Err(termination) = self.startup().await {
            return termination;
        }

        let termination = self.steady_state().await;
        self.transport.disconnect().await;
        match &termination {
            Termination::Shutdown => info!("Disconnected from MQTT broker, clean shutdown"),
            other => debug!("Disconnected from MQTT broker: {}", other),
        }
        termination
    }

    async fn startup(&mut self) -> Result<(), Termination> {
        let ceiling = self.policy.max_startup;
        loop {
            if !self.state.running.is_running() {
                info!("Stop requested during startup");
                return Err(Termination::Shutdown);
            }

            match self
                .transport
                .connect(&self.broker, self.port, self.keep_alive)
                .await
            {
                Ok(()) => {
                    self.state.startup_attempts = 0;
                    info!("Connected to MQTT broker {}:{}", self.broker, self.port);
                    return Ok(());
                }
                Err(e) if !e.is_transient() => {
                    error!("CRITICAL: Unexpected error while connecting: {}", e);
                    return Err(Termination::UnexpectedFault(e.to_string()));
                }
                Err(e) => {
                    self.state.startup_attempts += 1;
                    let attempts = self.state.startup_attempts;
                    error!(
                        "Failed to connect to MQTT broker {}:{} (attempt {}/{}): {}",
                        self.broker, self.port, attempts, ceiling, e
                    );
                    if attempts >= ceiling {
                        error!(
                            "CRITICAL: Could not connect to MQTT broker after {}/{} attempts. Exiting.",
                            attempts, ceiling
                        );
                        return Err(Termination::StartupExhausted { attempts });
                    }
                    self.sleeper.sleep(self.policy.backoff).await;
                }
            }
        }
    }

    async fn steady_state(&mut self) -> Termination {
        loop {
            if !self.state.running.is_running() {
                info!("Stop requested, leaving network loop");
                return Termination::Shutdown;
            }
            self.state.heartbeat = self.state.heartbeat.wrapping_add(1);

            if self.state.pending_reconnect {
                match self.transport.reconnect().await {
                    Ok(()) => {
                        self.state.pending_reconnect = false;
                        info!("Reconnected to MQTT broker");
                    }
                    Err(e) => {
                        if let Some(termination) = self.loop_failure(e) {
                            return termination;
                        }
                        continue;
                    }
                }
            }

            match self.transport.tick().await {
                Ok(events) => {
                    self.state.loop_reconnect_attempts = 0;
                    for event in events {
                        if let Some(termination) = self.dispatch(event).await {
                            return termination;
                        }
                    }
                }
                Err(e) => {
                    if let Some(termination) = self.loop_failure(e) {
                        return termination;
                    }
                }
            }
        }
    }

    /// Account for a failed tick or pre-tick reconnect
    fn loop_failure(&mut self, e: TransportError) -> Option<Termination> {
        if !e.is_transient() {
            error!(
                "CRITICAL: Unexpected error in network loop (heartbeat {}): {}",
                self.state.heartbeat, e
            );
            return Some(Termination::UnexpectedFault(e.to_string()));
        }

        let ceiling = self.policy.max_loop_reconnect;
        self.state.loop_reconnect_attempts += 1;
        self.state.pending_reconnect = true;
        let attempts = self.state.loop_reconnect_attempts;
        error!(
            "Network loop error, reconnecting (attempt {}/{}): {}",
            attempts, ceiling, e
        );

        if attempts >= ceiling {
            error!(
                "CRITICAL: Network loop failed {}/{} times in a row. Exiting.",
                attempts, ceiling
            );
            return Some(Termination::LoopReconnectsExhausted { attempts });
        }
        None
    }

    async fn dispatch(&mut self, event: TransportEvent) -> Option<Termination> {
        match event {
            TransportEvent::Connected { return_code } => {
                self.router
                    .on_connect(return_code, &mut self.transport)
                    .await;
            }
            TransportEvent::Message { topic, payload } => {
                self.router
                    .on_message(&topic, &payload, &mut self.transport)
                    .await;
            }
            TransportEvent::Log { level, message } => self.router.on_log(level, &message),
            TransportEvent::Disconnected { reason } => {
                self.router.on_disconnect(reason);
                if reason != DISCONNECT_NORMAL {
                    return self.recover_from_disconnect().await.err();
                }
            }
        }
        None
    }

    /// Bounded reconnect after an unexpected disconnect
    async fn recover_from_disconnect(&mut self) -> Result<(), Termination> {
        error!("Unexpected disconnection. Attempting reconnection.");
        let ceiling = self.policy.max_reconnects;
        self.state.disconnect_reconnect_attempts = 0;

        loop {
            if !self.state.running.is_running() {
                return Ok(());
            }

            match self.transport.reconnect().await {
                Ok(()) => {
                    self.state.disconnect_reconnect_attempts = 0;
                    return Ok(());
                }
                Err(e) if !e.is_transient() => {
                    error!("CRITICAL: Unexpected error while reconnecting: {}", e);
                    return Err(Termination::UnexpectedFault(e.to_string()));
                }
                Err(e) => {
                    self.state.disconnect_reconnect_attempts += 1;
                    let attempts = self.state.disconnect_reconnect_attempts;
                    warn!(
                        "Connection error while trying to reconnect (attempt {}/{}): {}",
                        attempts, ceiling, e
                    );
                    if attempts >= ceiling {
                        error!(
                            "CRITICAL: Too many reconnect tries ({}/{}). Exiting.",
                            attempts, ceiling
                        );
                        return Err(Termination::DisconnectReconnectsExhausted { attempts });
                    }
                    self.sleeper.sleep(self.policy.backoff).await;
                }
            }
        }
    }
}
