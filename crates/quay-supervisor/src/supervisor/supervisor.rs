//! The supervisor capability set.

use crate::supervisor::error::SupervisorResult;
use crate::supervisor::events::EventStream;
use crate::supervisor::types::*;
use async_trait::async_trait;

/// Uniform contract every daemon kind implements.
///
/// Lifecycle methods are safe to call concurrently: implementations
/// serialise them internally and `start` on a running daemon is a no-op.
/// `execute` is rejected unless the daemon is `Running`. `restart` is
/// atomic from the caller's perspective: `status` observes `Stopping`
/// then `Starting`, never a resting intermediate.
#[async_trait]
pub trait Supervisor: Send + Sync {
    fn kind(&self) -> DaemonKind;

    async fn start(&self) -> SupervisorResult<()>;

    async fn stop(&self) -> SupervisorResult<()>;

    async fn restart(&self) -> SupervisorResult<()>;

    async fn status(&self) -> DaemonDescriptor;

    /// Kind-specific command dispatch. Failures never change the
    /// supervisor state.
    async fn execute(&self, request: CommandRequest) -> SupervisorResult<CommandOutput>;

    /// Subscribe to this supervisor's event stream, replaying recent
    /// events for late subscribers.
    fn events(&self) -> EventStream;

    /// Health probe used by the periodic checker; default healthy.
    async fn probe(&self) -> bool {
        true
    }
}
