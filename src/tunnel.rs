//! Coordinates the two local processes of a tunnel session.
//!
//! The destination process is started first and given a grace period to
//! connect before the source process starts. The source's exit decides the
//! result; the destination is then killed and the session closed. The
//! session is closed on every path once it has been opened.

use std::fmt;
use std::future::Future;
use std::time::Duration;

use camino::Utf8Path;
use thiserror::Error;
use tokio::time::sleep;
use tracing::{field::display, info, warn};

use crate::launcher::{BackgroundProcess, LaunchError, LaunchSpec, ProcessSpawner};
use crate::service::{ServiceError, SessionHandle, TunnelService};

/// Default delay between starting the destination and the source.
pub const DEFAULT_GRACE_PERIOD: Duration = Duration::from_secs(10);

/// Which end of the tunnel a process plays.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum Role {
    /// Accepts the tunnelled connection.
    Destination,
    /// Opens the local proxy.
    Source,
}

impl fmt::Display for Role {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Self::Destination => "destination",
            Self::Source => "source",
        })
    }
}

/// Errors raised while coordinating a session.
#[derive(Debug, Error)]
pub enum SessionError {
    /// The session could not be opened.
    #[error("failed to open tunnel session: {0}")]
    Open(#[source] ServiceError),
    /// A role process could not be started or awaited.
    #[error("{role} process failed: {source}")]
    Process {
        /// Role of the failing process.
        role: Role,
        /// Launcher error.
        #[source]
        source: LaunchError,
    },
    /// Closing the session failed after the source succeeded.
    #[error("failed to close tunnel session {session_id}: {source}")]
    Close {
        /// Session that may still be open.
        session_id: String,
        /// Provider error.
        #[source]
        source: ServiceError,
    },
    /// The run was interrupted before the source exited.
    #[error("tunnel session {session_id} interrupted")]
    Interrupted {
        /// Session that was closed after the interruption.
        session_id: String,
    },
}

/// Result of a completed session.
#[derive(Clone, Debug, Eq, PartialEq)]
pub struct SessionOutcome {
    /// Closed session identifier.
    pub session_id: String,
    /// Exit code of the source process.
    pub source_exit_code: Option<i32>,
}

impl SessionOutcome {
    /// Returns `true` when the source exited with code zero.
    #[must_use]
    pub const fn is_success(&self) -> bool {
        matches!(self.source_exit_code, Some(0))
    }

    /// Process exit code to report: the source's code, or 1 when it was
    /// terminated by a signal.
    #[must_use]
    pub fn exit_code(&self) -> i32 {
        self.source_exit_code.unwrap_or(1)
    }
}

/// Runs the destination and source processes against one session.
#[derive(Debug)]
pub struct SessionCoordinator<'a, T: ?Sized, P> {
    tunnel: &'a T,
    spawner: &'a P,
    grace_period: Duration,
}

impl<'a, T, P> SessionCoordinator<'a, T, P>
where
    T: TunnelService + ?Sized,
    P: ProcessSpawner,
{
    /// Creates a coordinator with the default grace period.
    #[must_use]
    pub const fn new(tunnel: &'a T, spawner: &'a P) -> Self {
        Self {
            tunnel,
            spawner,
            grace_period: DEFAULT_GRACE_PERIOD,
        }
    }

    /// Overrides the grace period.
    #[must_use]
    pub const fn with_grace_period(mut self, grace_period: Duration) -> Self {
        self.grace_period = grace_period;
        self
    }

    /// Opens a session and runs both roles of `executable` against it.
    ///
    /// When `interrupt` resolves first, running processes are killed and the
    /// session is closed before [`SessionError::Interrupted`] is returned.
    ///
    /// # Errors
    ///
    /// Returns [`SessionError`] when the session cannot be opened, a process
    /// fails to start, or closing fails after a successful source run.
    pub async fn run_session<F>(
        &self,
        executable: &Utf8Path,
        region: &str,
        interrupt: F,
    ) -> Result<SessionOutcome, SessionError>
    where
        F: Future<Output = ()> + Send,
    {
        let handle = self.tunnel.open_session().await.map_err(SessionError::Open)?;
        info!(session = display(&handle.session_id), "tunnel session opened");

        let driven = tokio::select! {
            outcome = self.drive(&handle, executable, region) => outcome,
            () = interrupt => Err(SessionError::Interrupted {
                session_id: handle.session_id.clone(),
            }),
        };

        let closed = self.tunnel.close_session(&handle.session_id).await;
        match (driven, closed) {
            (Ok(outcome), Err(source)) if outcome.is_success() => Err(SessionError::Close {
                session_id: handle.session_id,
                source,
            }),
            (driven_result, Err(err)) => {
                warn!(
                    session = display(&handle.session_id),
                    error = display(&err),
                    "failed to close tunnel session"
                );
                driven_result
            }
            (driven_result, Ok(())) => {
                info!(session = display(&handle.session_id), "tunnel session closed");
                driven_result
            }
        }
    }

    async fn drive(
        &self,
        handle: &SessionHandle,
        executable: &Utf8Path,
        region: &str,
    ) -> Result<SessionOutcome, SessionError> {
        let mut destination = self
            .spawner
            .spawn(&destination_spec(executable, region, handle))
            .map_err(|source| SessionError::Process {
                role: Role::Destination,
                source,
            })?;
        info!(grace_secs = self.grace_period.as_secs(), "destination started");
        sleep(self.grace_period).await;

        let source_result = match self.spawner.spawn(&source_spec(executable, region, handle)) {
            Ok(mut source) => source.wait().await,
            Err(err) => Err(err),
        };

        if let Err(err) = destination.kill().await {
            warn!(error = display(&err), "failed to kill destination process");
        }

        let outcome = source_result.map_err(|source| SessionError::Process {
            role: Role::Source,
            source,
        })?;
        info!(exit_code = ?outcome.exit_code, "source exited");
        Ok(SessionOutcome {
            session_id: handle.session_id.clone(),
            source_exit_code: outcome.exit_code,
        })
    }
}

/// Arguments for the destination role.
#[must_use]
pub fn destination_spec(executable: &Utf8Path, region: &str, handle: &SessionHandle) -> LaunchSpec {
    LaunchSpec::new(executable)
        .arg("--test")
        .flag("--signing-region", region)
        .flag("--access_token", handle.destination_access_token.as_str())
}

/// Arguments for the source role.
#[must_use]
pub fn source_spec(executable: &Utf8Path, region: &str, handle: &SessionHandle) -> LaunchSpec {
    LaunchSpec::new(executable)
        .arg("--local_proxy_mode_source")
        .flag("--region", region)
        .flag("--access_token", handle.source_access_token.as_str())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_support::{EventLog, FakeCloud, FakeSpawner};
    use rstest::{fixture, rstest};
    use std::future::pending;

    struct Rig {
        log: EventLog,
        cloud: FakeCloud,
        spawner: FakeSpawner,
    }

    #[fixture]
    fn rig() -> Rig {
        let log = EventLog::new();
        Rig {
            cloud: FakeCloud::with_event_log(log.clone()),
            spawner: FakeSpawner::with_event_log(log.clone()),
            log,
        }
    }

    async fn run(rig: &Rig) -> Result<SessionOutcome, SessionError> {
        SessionCoordinator::new(&rig.cloud, &rig.spawner)
            .with_grace_period(Duration::from_millis(10))
            .run_session(Utf8Path::new("build/secure_tunnel"), "us-east-1", pending())
            .await
    }

    #[rstest]
    #[tokio::test]
    async fn roles_run_in_order_and_session_closes_last(rig: Rig) {
        let outcome = run(&rig).await.expect("session should succeed");

        assert!(outcome.is_success());
        assert_eq!(
            rig.log.entries(),
            vec![
                "open-tunnel",
                "spawn destination",
                "spawn source",
                "exit source",
                "kill destination",
                "close-tunnel tunnel-1",
            ]
        );
        assert_eq!(rig.cloud.inventory().sessions, 0);
    }

    #[rstest]
    #[tokio::test]
    async fn roles_receive_their_own_tokens(rig: Rig) {
        run(&rig).await.expect("session should succeed");

        let spawned = rig.spawner.spawned();
        let destination = spawned.first().expect("destination spawned");
        let source = spawned.get(1).expect("source spawned");
        assert!(destination.has_arg("--test"));
        assert_eq!(destination.flag_value("--signing-region"), Some("us-east-1"));
        assert_eq!(
            destination.flag_value("--access_token"),
            Some("destination-token-1")
        );
        assert!(source.has_arg("--local_proxy_mode_source"));
        assert_eq!(source.flag_value("--region"), Some("us-east-1"));
        assert_eq!(source.flag_value("--access_token"), Some("source-token-1"));
    }

    #[rstest]
    #[tokio::test]
    async fn failing_source_propagates_its_exit_code(rig: Rig) {
        rig.spawner.set_exit_code("source", 3);

        let outcome = run(&rig).await.expect("session completes");

        assert!(!outcome.is_success());
        assert_eq!(outcome.exit_code(), 3);
        assert_eq!(rig.cloud.count("close-tunnel"), 1);
    }

    #[rstest]
    #[tokio::test]
    async fn close_failure_after_success_is_an_error(rig: Rig) {
        rig.cloud.fail_on("close-tunnel");

        let err = run(&rig).await.expect_err("close failure should surface");

        assert!(matches!(err, SessionError::Close { .. }), "got {err:?}");
    }

    #[rstest]
    #[tokio::test]
    async fn close_failure_after_failing_source_keeps_source_result(rig: Rig) {
        rig.cloud.fail_on("close-tunnel");
        rig.spawner.set_exit_code("source", 4);

        let outcome = run(&rig).await.expect("source failure wins");

        assert_eq!(outcome.exit_code(), 4);
    }

    #[rstest]
    #[tokio::test]
    async fn destination_spawn_failure_still_closes_the_session(rig: Rig) {
        rig.spawner.fail_spawn("destination");

        let err = run(&rig).await.expect_err("spawn should fail");

        assert!(
            matches!(err, SessionError::Process { role: Role::Destination, .. }),
            "got {err:?}"
        );
        assert!(rig.spawner.spawned().is_empty());
        assert_eq!(rig.cloud.inventory().sessions, 0);
    }

    #[rstest]
    #[tokio::test]
    async fn source_spawn_failure_kills_destination(rig: Rig) {
        rig.spawner.fail_spawn("source");

        let err = run(&rig).await.expect_err("spawn should fail");

        assert!(
            matches!(err, SessionError::Process { role: Role::Source, .. }),
            "got {err:?}"
        );
        let kill = rig.log.position("kill destination").expect("destination killed");
        let close = rig.log.position("close-tunnel tunnel-1").expect("session closed");
        assert!(kill < close);
    }

    #[rstest]
    #[tokio::test]
    async fn open_failure_spawns_nothing(rig: Rig) {
        rig.cloud.fail_on("open-tunnel");

        let err = run(&rig).await.expect_err("open should fail");

        assert!(matches!(err, SessionError::Open(_)), "got {err:?}");
        assert!(rig.spawner.spawned().is_empty());
        assert_eq!(rig.cloud.count("close-tunnel"), 0);
    }

    #[rstest]
    #[tokio::test]
    async fn interruption_closes_the_session(rig: Rig) {
        let err = SessionCoordinator::new(&rig.cloud, &rig.spawner)
            .with_grace_period(Duration::from_secs(60))
            .run_session(Utf8Path::new("build/secure_tunnel"), "us-east-1", async {})
            .await
            .expect_err("interrupt should win");

        assert!(matches!(err, SessionError::Interrupted { .. }), "got {err:?}");
        assert_eq!(rig.cloud.count("close-tunnel"), 1);
    }
}
