//! Registry of live components.
//!
//! Provides id- and name-based lookup for the topology service and the
//! condition evaluator, plus ordered lifecycle orchestration: components are
//! initialized in registration order and disposed in reverse order.

use std::sync::Arc;

use dashmap::DashMap;
use parking_lot::RwLock;
use tokio_util::sync::CancellationToken;
use uuid::Uuid;
use verdant_core::Result;

use crate::component::device::Device;

/// Registry for id/name lookup and ordered lifecycle sequencing.
#[derive(Default)]
pub struct ComponentRegistry {
    by_id: DashMap<Uuid, Arc<dyn Device>>,
    by_name: DashMap<String, Uuid>,
    /// Registration order for deterministic init/dispose sequencing.
    registration_order: RwLock<Vec<Uuid>>,
}

impl ComponentRegistry {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Registers a device. Registration order determines lifecycle
    /// sequencing; re-registering an id replaces the previous entry without
    /// changing its position.
    pub fn register(&self, device: Arc<dyn Device>) {
        let id = device.core().id();
        let name = device.core().name().to_string();
        let replaced = self.by_id.insert(id, device).is_some();
        self.by_name.insert(name, id);
        if !replaced {
            self.registration_order.write().push(id);
        }
    }

    #[must_use]
    pub fn get(&self, id: Uuid) -> Option<Arc<dyn Device>> {
        self.by_id.get(&id).map(|entry| Arc::clone(entry.value()))
    }

    #[must_use]
    pub fn get_by_name(&self, name: &str) -> Option<Arc<dyn Device>> {
        let id = *self.by_name.get(name)?;
        self.get(id)
    }

    /// Removes a device from the registry. The device itself is not disposed.
    pub fn remove(&self, id: Uuid) -> bool {
        let Some((_, device)) = self.by_id.remove(&id) else {
            return false;
        };
        self.by_name.remove(device.core().name());
        self.registration_order.write().retain(|entry| *entry != id);
        true
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.by_id.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.by_id.is_empty()
    }

    /// Ids in registration order.
    #[must_use]
    pub fn ids(&self) -> Vec<Uuid> {
        self.registration_order.read().clone()
    }

    /// Initializes all registered devices in registration order.
    ///
    /// # Errors
    ///
    /// Returns the first initialization failure.
    pub async fn initialize_all(&self, token: &CancellationToken) -> Result<()> {
        for id in self.ids() {
            if let Some(device) = self.get(id) {
                device.initialize(token).await?;
            }
        }
        Ok(())
    }

    /// Disposes all registered devices in reverse registration order.
    ///
    /// # Errors
    ///
    /// Returns the first disposal failure.
    pub async fn dispose_all(&self, token: &CancellationToken) -> Result<()> {
        for id in self.ids().into_iter().rev() {
            if let Some(device) = self.get(id) {
                device.dispose(token).await?;
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use async_trait::async_trait;
    use verdant_core::ComponentState;

    use super::*;
    use crate::component::core::ComponentCore;

    struct TestDevice {
        core: ComponentCore,
    }

    impl TestDevice {
        fn named(name: &str) -> Arc<Self> {
            Arc::new(Self {
                core: ComponentCore::new(Uuid::new_v4(), name, "verdant.devices", "Sensor"),
            })
        }
    }

    #[async_trait]
    impl Device for TestDevice {
        fn core(&self) -> &ComponentCore {
            &self.core
        }
    }

    #[test]
    fn register_and_lookup() {
        let registry = ComponentRegistry::new();
        let device = TestDevice::named("ph-sensor");
        let id = device.core().id();
        registry.register(device);

        assert!(registry.get(id).is_some());
        assert!(registry.get_by_name("ph-sensor").is_some());
        assert!(registry.get_by_name("missing").is_none());
        assert_eq!(registry.len(), 1);
    }

    #[test]
    fn remove_clears_both_indexes() {
        let registry = ComponentRegistry::new();
        let device = TestDevice::named("ph-sensor");
        let id = device.core().id();
        registry.register(device);

        assert!(registry.remove(id));
        assert!(!registry.remove(id));
        assert!(registry.get(id).is_none());
        assert!(registry.get_by_name("ph-sensor").is_none());
        assert!(registry.is_empty());
    }

    #[tokio::test]
    async fn initialize_all_runs_in_registration_order() {
        let registry = ComponentRegistry::new();
        let first = TestDevice::named("first");
        let second = TestDevice::named("second");
        registry.register(Arc::clone(&first) as Arc<dyn Device>);
        registry.register(Arc::clone(&second) as Arc<dyn Device>);

        let token = CancellationToken::new();
        registry.initialize_all(&token).await.unwrap();

        assert_eq!(first.core().state(), ComponentState::Ready);
        assert_eq!(second.core().state(), ComponentState::Ready);
        assert_eq!(
            registry.ids(),
            vec![first.core().id(), second.core().id()]
        );
    }

    #[tokio::test]
    async fn dispose_all_runs_in_reverse_order() {
        let registry = ComponentRegistry::new();
        let first = TestDevice::named("first");
        let second = TestDevice::named("second");
        registry.register(Arc::clone(&first) as Arc<dyn Device>);
        registry.register(Arc::clone(&second) as Arc<dyn Device>);

        let token = CancellationToken::new();
        registry.initialize_all(&token).await.unwrap();
        registry.dispose_all(&token).await.unwrap();

        assert_eq!(first.core().state(), ComponentState::Disposed);
        assert_eq!(second.core().state(), ComponentState::Disposed);
    }
}
