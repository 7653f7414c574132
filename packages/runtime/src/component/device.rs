//! Device lifecycle built on top of [`ComponentCore`].

use async_trait::async_trait;
use tokio_util::sync::CancellationToken;
use verdant_core::{ComponentState, FabricError, Result};

use crate::component::core::ComponentCore;

/// A long-lived component with a managed lifecycle.
///
/// Concrete devices (pumps, sensors, controllers) embed a [`ComponentCore`]
/// and override [`Device::run`] with their behavior; the lifecycle methods
/// are provided and drive the shared state machine:
/// Created -> Initializing -> Ready -> Running -> Stopping -> Ready.
#[async_trait]
pub trait Device: Send + Sync + 'static {
    /// The shared component state this device is built on.
    fn core(&self) -> &ComponentCore;

    /// Device-specific behavior. Runs until `token` is cancelled.
    async fn run(&self, token: CancellationToken) -> Result<()> {
        token.cancelled().await;
        Ok(())
    }

    /// Moves Created -> Initializing -> Ready, seeding the read-only
    /// identity properties (Id, Name, AssemblyType, DeviceType, State).
    async fn initialize(&self, token: &CancellationToken) -> Result<()> {
        let core = self.core();
        if !core
            .try_change_state(ComponentState::Created, ComponentState::Initializing, token)
            .await?
        {
            return Err(FabricError::Validation {
                property: "State".to_string(),
                reason: format!("cannot initialize from {}", core.state()),
            });
        }
        core.seed_identity_properties(token).await?;
        core.try_change_state(ComponentState::Initializing, ComponentState::Ready, token)
            .await?;
        Ok(())
    }

    /// Moves Ready -> Running and runs the device until stopped.
    async fn execute(&self, token: &CancellationToken) -> Result<()> {
        let core = self.core();
        if !core
            .try_change_state(ComponentState::Ready, ComponentState::Running, token)
            .await?
        {
            return Err(FabricError::Validation {
                property: "State".to_string(),
                reason: format!("cannot execute from {}", core.state()),
            });
        }

        let execution = token.child_token();
        core.store_execution_token(execution.clone());
        self.run(execution).await
    }

    /// Moves Running -> Stopping, cancels the running `execute`, and returns
    /// the device to Ready. A no-op when the device is not running.
    async fn stop(&self, token: &CancellationToken) -> Result<()> {
        let core = self.core();
        if !core
            .try_change_state(ComponentState::Running, ComponentState::Stopping, token)
            .await?
        {
            return Ok(());
        }
        core.cancel_execution();
        core.try_change_state(ComponentState::Stopping, ComponentState::Ready, token)
            .await?;
        Ok(())
    }

    /// Disposes the underlying component.
    async fn dispose(&self, token: &CancellationToken) -> Result<()> {
        self.core().dispose(token).await
    }
}
