//! The concurrent, observable state shared by every component.

use std::collections::BTreeMap;
use std::sync::{Arc, Weak};

use arc_swap::ArcSwap;
use parking_lot::{Mutex, RwLock};
use tokio_util::sync::CancellationToken;
use uuid::Uuid;
use verdant_core::{
    now_millis, ComponentState, Event, FabricError, FromPropertyValue, PropertyMetadata,
    PropertyValue, Result, RoutingData,
};

use crate::component::handler::EventHandler;
use crate::sync::{ReadGuard, SharedLock, WriteGuard};

/// Name of the read-only lifecycle property published on every transition.
pub const STATE_PROPERTY: &str = "State";

#[derive(Debug, Default)]
struct PropertyBag {
    properties: BTreeMap<String, PropertyValue>,
    metadata: BTreeMap<String, PropertyMetadata>,
}

/// Typed, concurrent, observable state of a component.
///
/// Owns the property map, the metadata map, and the admission lock that
/// linearizes writes. Holds at most a weak reference to one event handler;
/// emission degrades to a no-op once the handler is gone.
pub struct ComponentCore {
    id: Uuid,
    name: String,
    assembly_type: String,
    device_type: String,
    /// Lock-free mirror of the lifecycle state; written under the write lock.
    state: ArcSwap<ComponentState>,
    lock: SharedLock,
    /// Interior map access; only touched while holding an admission guard.
    bag: Mutex<PropertyBag>,
    handler: RwLock<Option<Weak<dyn EventHandler>>>,
    /// Cancellation token of the currently running `execute`, if any.
    execution: Mutex<Option<CancellationToken>>,
}

impl ComponentCore {
    #[must_use]
    pub fn new(
        id: Uuid,
        name: impl Into<String>,
        assembly_type: impl Into<String>,
        device_type: impl Into<String>,
    ) -> Self {
        Self {
            id,
            name: name.into(),
            assembly_type: assembly_type.into(),
            device_type: device_type.into(),
            state: ArcSwap::from_pointee(ComponentState::Created),
            lock: SharedLock::new(),
            bag: Mutex::new(PropertyBag::default()),
            handler: RwLock::new(None),
            execution: Mutex::new(None),
        }
    }

    #[must_use]
    pub fn id(&self) -> Uuid {
        self.id
    }

    #[must_use]
    pub fn name(&self) -> &str {
        &self.name
    }

    #[must_use]
    pub fn assembly_type(&self) -> &str {
        &self.assembly_type
    }

    #[must_use]
    pub fn device_type(&self) -> &str {
        &self.device_type
    }

    /// Current lifecycle state (lock-free read of the mirror).
    #[must_use]
    pub fn state(&self) -> ComponentState {
        **self.state.load()
    }

    /// Registers the event handler, replacing any prior registration.
    pub fn set_event_handler(&self, handler: Weak<dyn EventHandler>) {
        *self.handler.write() = Some(handler);
    }

    pub fn clear_event_handler(&self) {
        *self.handler.write() = None;
    }

    /// Remembers the execution token so `stop` can cancel a running device.
    pub(crate) fn store_execution_token(&self, token: CancellationToken) {
        *self.execution.lock() = Some(token);
    }

    pub(crate) fn cancel_execution(&self) {
        if let Some(token) = self.execution.lock().take() {
            token.cancel();
        }
    }

    /// Writes a property through the public contract.
    ///
    /// Fails with [`FabricError::Validation`] when the property is marked
    /// read-only, and with [`FabricError::Disposed`] after disposal. Emits a
    /// property-changed event carrying the old value, new value, and
    /// metadata.
    pub async fn set_property(
        &self,
        name: &str,
        value: PropertyValue,
        metadata: Option<PropertyMetadata>,
        token: &CancellationToken,
    ) -> Result<()> {
        self.write_property(name, value, metadata, false, token).await
    }

    /// Writes a property bypassing the read-only check.
    ///
    /// Reserved for internal state transitions (lifecycle, identity seeding).
    pub(crate) async fn set_property_internal(
        &self,
        name: &str,
        value: PropertyValue,
        metadata: Option<PropertyMetadata>,
        token: &CancellationToken,
    ) -> Result<()> {
        self.write_property(name, value, metadata, true, token).await
    }

    async fn write_property(
        &self,
        name: &str,
        value: PropertyValue,
        metadata: Option<PropertyMetadata>,
        bypass_read_only: bool,
        token: &CancellationToken,
    ) -> Result<()> {
        self.ensure_not_disposed()?;
        let _guard = self.acquire_write(token).await?;
        self.ensure_not_disposed()?;

        let now = now_millis();
        let event = {
            let mut bag = self.bag.lock();

            if !bypass_read_only {
                if let Some(existing) = bag.metadata.get_mut(name) {
                    if existing.is_read_only {
                        existing.on_error("write rejected: property is read-only");
                        return Err(FabricError::read_only(name));
                    }
                }
            }

            let mut md = metadata
                .or_else(|| bag.metadata.get(name).cloned())
                .unwrap_or_default();
            md.on_write(now);

            let old_value = bag
                .properties
                .insert(name.to_string(), value.clone())
                .unwrap_or(PropertyValue::Null);
            bag.metadata.insert(name.to_string(), md.clone());

            Event::property_changed(self.id, name, old_value, value, md, RoutingData::default())
        };

        // Emission happens while the write admission is still held, so change
        // events observe the same order as the writes themselves.
        self.emit(&event, token).await;
        Ok(())
    }

    /// Reads a property value. Missing properties read as `None`.
    pub async fn get_property(
        &self,
        name: &str,
        token: &CancellationToken,
    ) -> Result<Option<PropertyValue>> {
        let _guard = self.acquire_read(token).await?;
        Ok(self.bag.lock().properties.get(name).cloned())
    }

    /// Reads a property as a concrete type; mismatched tags read as `None`.
    pub async fn get_property_as<T: FromPropertyValue>(
        &self,
        name: &str,
        token: &CancellationToken,
    ) -> Result<Option<T>> {
        let value = self.get_property(name, token).await?;
        Ok(value.as_ref().and_then(T::from_value))
    }

    /// Reads a property that must exist with the expected type.
    ///
    /// Strict counterpart of [`Self::get_property_as`] for device logic that
    /// cannot proceed on a default: a missing property fails with
    /// [`FabricError::NotFound`], a value of the wrong kind with
    /// [`FabricError::TypeMismatch`].
    pub async fn require_property_as<T: FromPropertyValue>(
        &self,
        name: &str,
        token: &CancellationToken,
    ) -> Result<T> {
        let value = self
            .get_property(name, token)
            .await?
            .ok_or_else(|| FabricError::NotFound(name.to_string()))?;
        T::from_value(&value).ok_or_else(|| FabricError::TypeMismatch {
            property: name.to_string(),
            expected: T::expected_kind(),
            actual: value.kind(),
        })
    }

    pub async fn get_property_metadata(
        &self,
        name: &str,
        token: &CancellationToken,
    ) -> Result<Option<PropertyMetadata>> {
        let _guard = self.acquire_read(token).await?;
        Ok(self.bag.lock().metadata.get(name).cloned())
    }

    /// Snapshot of the full property map.
    pub async fn get_properties(
        &self,
        token: &CancellationToken,
    ) -> Result<BTreeMap<String, PropertyValue>> {
        let _guard = self.acquire_read(token).await?;
        Ok(self.bag.lock().properties.clone())
    }

    /// Snapshot of the full metadata map.
    pub async fn get_all_property_metadata(
        &self,
        token: &CancellationToken,
    ) -> Result<BTreeMap<String, PropertyMetadata>> {
        let _guard = self.acquire_read(token).await?;
        Ok(self.bag.lock().metadata.clone())
    }

    /// Replaces both maps atomically. Emits no change events.
    ///
    /// Every loaded property gets a metadata record: provided metadata wins,
    /// missing keys fall back to defaults.
    pub async fn load_properties(
        &self,
        properties: BTreeMap<String, PropertyValue>,
        metadata: Option<BTreeMap<String, PropertyMetadata>>,
        token: &CancellationToken,
    ) -> Result<()> {
        self.ensure_not_disposed()?;
        let _guard = self.acquire_write(token).await?;
        self.ensure_not_disposed()?;

        let mut metadata = metadata.unwrap_or_default();
        for name in properties.keys() {
            metadata
                .entry(name.clone())
                .or_insert_with(PropertyMetadata::default);
        }

        let mut bag = self.bag.lock();
        bag.properties = properties;
        bag.metadata = metadata;
        Ok(())
    }

    /// Atomic lifecycle transition: succeeds only when the current state
    /// equals `expected`. Publishes `State` as a read-only property and emits
    /// the corresponding change event.
    pub async fn try_change_state(
        &self,
        expected: ComponentState,
        next: ComponentState,
        token: &CancellationToken,
    ) -> Result<bool> {
        let _guard = self.acquire_write(token).await?;

        let current = self.state();
        if current == ComponentState::Disposed && next != ComponentState::Disposed {
            return Err(FabricError::Disposed { id: self.id });
        }
        if current != expected {
            return Ok(false);
        }

        self.state.store(Arc::new(next));
        let event = {
            let mut bag = self.bag.lock();
            let now = now_millis();
            let mut md = bag
                .metadata
                .get(STATE_PROPERTY)
                .cloned()
                .unwrap_or_else(|| PropertyMetadata::read_only(STATE_PROPERTY));
            md.on_write(now);

            let old_value = bag
                .properties
                .insert(
                    STATE_PROPERTY.to_string(),
                    PropertyValue::from(next.to_string()),
                )
                .unwrap_or(PropertyValue::Null);
            bag.metadata.insert(STATE_PROPERTY.to_string(), md.clone());

            Event::property_changed(
                self.id,
                STATE_PROPERTY,
                old_value,
                PropertyValue::from(next.to_string()),
                md,
                RoutingData::default(),
            )
        };
        self.emit(&event, token).await;

        tracing::debug!(
            component = %self.id,
            from = %current,
            to = %next,
            "component state transition"
        );
        Ok(true)
    }

    /// Seeds the read-only identity properties during initialization.
    pub(crate) async fn seed_identity_properties(&self, token: &CancellationToken) -> Result<()> {
        let seeds: [(&str, PropertyValue); 4] = [
            ("Id", PropertyValue::Id(self.id)),
            ("Name", PropertyValue::from(self.name.clone())),
            ("AssemblyType", PropertyValue::from(self.assembly_type.clone())),
            ("DeviceType", PropertyValue::from(self.device_type.clone())),
        ];
        for (name, value) in seeds {
            self.set_property_internal(
                name,
                value,
                Some(PropertyMetadata::read_only(name)),
                token,
            )
            .await?;
        }
        Ok(())
    }

    /// Transitions to `Disposed`. Subsequent mutations fail; calling dispose
    /// again is a no-op.
    pub async fn dispose(&self, token: &CancellationToken) -> Result<()> {
        if self.state() == ComponentState::Disposed {
            return Ok(());
        }
        let _guard = self.acquire_write(token).await?;
        if self.state() == ComponentState::Disposed {
            return Ok(());
        }

        self.cancel_execution();
        self.state.store(Arc::new(ComponentState::Disposed));

        let mut bag = self.bag.lock();
        let mut md = bag
            .metadata
            .get(STATE_PROPERTY)
            .cloned()
            .unwrap_or_else(|| PropertyMetadata::read_only(STATE_PROPERTY));
        md.on_write(now_millis());
        bag.properties.insert(
            STATE_PROPERTY.to_string(),
            PropertyValue::from(ComponentState::Disposed.to_string()),
        );
        bag.metadata.insert(STATE_PROPERTY.to_string(), md);
        drop(bag);

        self.clear_event_handler();
        tracing::debug!(component = %self.id, "component disposed");
        Ok(())
    }

    fn ensure_not_disposed(&self) -> Result<()> {
        if self.state() == ComponentState::Disposed {
            return Err(FabricError::Disposed { id: self.id });
        }
        Ok(())
    }

    async fn acquire_read(&self, token: &CancellationToken) -> Result<ReadGuard<'_>> {
        tokio::select! {
            biased;
            () = token.cancelled() => Err(FabricError::Cancelled),
            guard = self.lock.read() => Ok(guard),
        }
    }

    async fn acquire_write(&self, token: &CancellationToken) -> Result<WriteGuard<'_>> {
        tokio::select! {
            biased;
            () = token.cancelled() => Err(FabricError::Cancelled),
            guard = self.lock.write() => Ok(guard),
        }
    }

    /// Delivers an event to the registered handler, if it is still alive.
    ///
    /// Handler failures are logged and swallowed: a broken consumer must not
    /// unwind a state change that already happened.
    async fn emit(&self, event: &Event, token: &CancellationToken) {
        let handler = self.handler.read().as_ref().and_then(Weak::upgrade);
        if let Some(handler) = handler {
            if let Err(err) = handler.handle_event(self.id, event, token).await {
                tracing::warn!(
                    component = %self.id,
                    event = %event.event_id,
                    error = %err,
                    "event handler failed"
                );
            }
        }
    }
}

impl std::fmt::Debug for ComponentCore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ComponentCore")
            .field("id", &self.id)
            .field("name", &self.name)
            .field("state", &self.state())
            .finish_non_exhaustive()
    }
}
