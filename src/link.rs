//! Link connectivity supervision.
//!
//! The meter sits behind an unreliable wireless hop. The supervisor
//! owns the link-layer connection state, re-drives reconnection forever
//! in the background, and answers `is_connected()` without blocking.
//! It is the only component allowed to retry without an overall cap.

use std::net::SocketAddr;
use std::sync::Arc;
use std::sync::atomic::{AtomicU8, Ordering};
use std::time::Duration;

use async_trait::async_trait;
use tokio::net::TcpStream;
use tracing::{debug, info, warn};

use crate::ShutdownFlag;

/// Link-layer connection state.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum ConnectionState {
    Idle = 0,
    Connecting = 1,
    Connected = 2,
    Backoff = 3,
    Failed = 4,
}

impl ConnectionState {
    pub fn is_connected(self) -> bool {
        self == ConnectionState::Connected
    }

    fn from_u8(raw: u8) -> Self {
        match raw {
            1 => ConnectionState::Connecting,
            2 => ConnectionState::Connected,
            3 => ConnectionState::Backoff,
            4 => ConnectionState::Failed,
            _ => ConnectionState::Idle,
        }
    }
}

/// Synchronized holder for the shared connection state.
///
/// Written only by the supervisor; read from other tasks. Readers may
/// lag the true link status by up to one monitor tick.
#[derive(Debug)]
pub struct LinkStateCell(AtomicU8);

impl LinkStateCell {
    fn new() -> Self {
        Self(AtomicU8::new(ConnectionState::Idle as u8))
    }

    pub fn get(&self) -> ConnectionState {
        ConnectionState::from_u8(self.0.load(Ordering::SeqCst))
    }

    fn set(&self, state: ConnectionState) {
        self.0.store(state as u8, Ordering::SeqCst);
    }
}

/// Read-only handle on the link state, handed to the register reader.
#[derive(Debug, Clone)]
pub struct LinkStatus(Arc<LinkStateCell>);

impl LinkStatus {
    pub fn state(&self) -> ConnectionState {
        self.0.get()
    }

    pub fn is_connected(&self) -> bool {
        self.0.get().is_connected()
    }
}

/// Probe for the actual link status.
#[async_trait]
pub trait LinkProbe: Send + Sync {
    async fn is_up(&self) -> bool;
}

/// Probes the link by dialing a TCP endpoint with a bounded timeout.
///
/// Defaults to the meter itself: the nearest observable point on the
/// wireless path.
pub struct TcpProbe {
    addr: SocketAddr,
    timeout: Duration,
}

impl TcpProbe {
    pub fn new(addr: SocketAddr, timeout: Duration) -> Self {
        Self { addr, timeout }
    }
}

#[async_trait]
impl LinkProbe for TcpProbe {
    async fn is_up(&self) -> bool {
        matches!(
            tokio::time::timeout(self.timeout, TcpStream::connect(self.addr)).await,
            Ok(Ok(_))
        )
    }
}

/// Reconnection policy.
#[derive(Debug, Clone, Copy)]
pub struct LinkPolicy {
    /// Probe attempts per reconnection round.
    pub max_attempts: u32,
    /// Delay between attempts within a round.
    pub backoff: Duration,
    /// Background monitor tick.
    pub monitor_interval: Duration,
}

/// Owns the link state and its reconnection lifecycle.
pub struct LinkSupervisor<P: LinkProbe> {
    probe: P,
    state: Arc<LinkStateCell>,
    policy: LinkPolicy,
}

impl<P: LinkProbe> LinkSupervisor<P> {
    pub fn new(probe: P, policy: LinkPolicy) -> Self {
        Self {
            probe,
            state: Arc::new(LinkStateCell::new()),
            policy,
        }
    }

    /// Handle for other components to observe the state.
    pub fn status(&self) -> LinkStatus {
        LinkStatus(self.state.clone())
    }

    pub fn is_connected(&self) -> bool {
        self.state.get().is_connected()
    }

    /// Drive one reconnection round: Connecting, then up to
    /// `max_attempts` probes with Backoff in between, ending Connected
    /// or Failed. Failed is not terminal; the monitor starts new rounds
    /// for as long as the process runs.
    async fn drive_connect(&self) -> ConnectionState {
        self.state.set(ConnectionState::Connecting);

        for attempt in 1..=self.policy.max_attempts {
            if self.probe.is_up().await {
                self.state.set(ConnectionState::Connected);
                info!(attempt, "Link up");
                return ConnectionState::Connected;
            }

            if attempt < self.policy.max_attempts {
                warn!(
                    attempt,
                    max_attempts = self.policy.max_attempts,
                    "Link probe failed, backing off"
                );
                self.state.set(ConnectionState::Backoff);
                tokio::time::sleep(self.policy.backoff).await;
                self.state.set(ConnectionState::Connecting);
            }
        }

        self.state.set(ConnectionState::Failed);
        warn!(
            attempts = self.policy.max_attempts,
            "Link still down after a full round of attempts"
        );
        ConnectionState::Failed
    }

    /// Drive Idle to Connecting and block up to `timeout` for a
    /// Connected or Failed transition. Returns the state reached when
    /// the wait ends. Used once at startup; a non-Connected result is
    /// not fatal.
    pub async fn connect_and_wait(&self, timeout: Duration) -> ConnectionState {
        match tokio::time::timeout(timeout, self.drive_connect()).await {
            Ok(state) => state,
            Err(_) => {
                warn!(?timeout, "Startup connect still pending at deadline");
                self.state.get()
            }
        }
    }

    /// Background monitor. Every tick it probes the actual link and
    /// reconciles the state cell with reality: the cell may claim
    /// Connected while the link has dropped (or the reverse), and the
    /// probe is the authority.
    pub async fn run_monitor(self, shutdown: ShutdownFlag) {
        info!(
            interval_ms = self.policy.monitor_interval.as_millis() as u64,
            "Link monitor started"
        );

        loop {
            if shutdown.is_requested() {
                break;
            }

            tokio::time::sleep(self.policy.monitor_interval).await;

            if shutdown.is_requested() {
                break;
            }

            let up = self.probe.is_up().await;
            let state = self.state.get();

            if up {
                if !state.is_connected() {
                    info!(?state, "Link is up again");
                    self.state.set(ConnectionState::Connected);
                } else {
                    debug!("Link healthy");
                }
            } else {
                warn!(?state, "Link is down, reconnecting");
                self.drive_connect().await;
            }
        }

        info!("Link monitor stopped");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicU32;

    /// Probe that reports down for the first `down_for` calls and up
    /// afterwards.
    struct FlakyProbe {
        calls: AtomicU32,
        down_for: u32,
    }

    impl FlakyProbe {
        fn new(down_for: u32) -> Self {
            Self {
                calls: AtomicU32::new(0),
                down_for,
            }
        }
    }

    #[async_trait]
    impl LinkProbe for FlakyProbe {
        async fn is_up(&self) -> bool {
            self.calls.fetch_add(1, Ordering::SeqCst) >= self.down_for
        }
    }

    fn quick_policy(max_attempts: u32) -> LinkPolicy {
        LinkPolicy {
            max_attempts,
            backoff: Duration::from_millis(1),
            monitor_interval: Duration::from_millis(5),
        }
    }

    #[tokio::test]
    async fn test_connect_and_wait_reaches_connected() {
        let supervisor = LinkSupervisor::new(FlakyProbe::new(0), quick_policy(3));
        let state = supervisor
            .connect_and_wait(Duration::from_secs(1))
            .await;
        assert_eq!(state, ConnectionState::Connected);
        assert!(supervisor.is_connected());
    }

    #[tokio::test]
    async fn test_connect_and_wait_recovers_within_round() {
        let supervisor = LinkSupervisor::new(FlakyProbe::new(2), quick_policy(5));
        let state = supervisor
            .connect_and_wait(Duration::from_secs(1))
            .await;
        assert_eq!(state, ConnectionState::Connected);
    }

    #[tokio::test]
    async fn test_budget_exhaustion_sets_failed() {
        let supervisor = LinkSupervisor::new(FlakyProbe::new(u32::MAX), quick_policy(2));
        let state = supervisor
            .connect_and_wait(Duration::from_secs(1))
            .await;
        assert_eq!(state, ConnectionState::Failed);
        assert!(!supervisor.is_connected());
    }

    #[tokio::test]
    async fn test_status_handle_tracks_state() {
        let supervisor = LinkSupervisor::new(FlakyProbe::new(0), quick_policy(1));
        let status = supervisor.status();
        assert_eq!(status.state(), ConnectionState::Idle);
        assert!(!status.is_connected());

        supervisor.connect_and_wait(Duration::from_secs(1)).await;
        assert!(status.is_connected());
    }

    #[tokio::test]
    async fn test_monitor_revives_failed_link() {
        // Down long enough for the first round to fail, then up.
        let supervisor = LinkSupervisor::new(FlakyProbe::new(3), quick_policy(2));
        let status = supervisor.status();
        let shutdown = ShutdownFlag::new();

        let state = supervisor
            .connect_and_wait(Duration::from_secs(1))
            .await;
        assert_eq!(state, ConnectionState::Failed);

        let monitor = tokio::spawn(supervisor.run_monitor(shutdown.clone()));

        // A couple of monitor ticks later the probe answers up again.
        tokio::time::sleep(Duration::from_millis(50)).await;
        assert!(status.is_connected());

        shutdown.request();
        tokio::time::sleep(Duration::from_millis(20)).await;
        monitor.abort();
    }
}
