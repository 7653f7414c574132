//! Directed component topology with conditional connections.
//!
//! Connections are directed `source -> target` edges. When an event carries
//! no explicit targets, the bus fans out along the connections whose
//! condition currently evaluates true.

use dashmap::DashMap;
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

use crate::bus::condition::ConditionEvaluator;

/// A directed edge between two components, optionally gated by a condition.
#[derive(Debug, Clone)]
pub struct Connection {
    pub connection_id: Uuid,
    pub source_id: Uuid,
    pub target_id: Uuid,
    /// Condition expression; `None` or empty means "always active".
    pub condition: Option<String>,
}

/// Owns the connection table and answers fan-out queries.
pub struct TopologyService {
    connections: DashMap<Uuid, Connection>,
    /// Connection ids grouped by source for fan-out lookups.
    by_source: DashMap<Uuid, Vec<Uuid>>,
    evaluator: ConditionEvaluator,
}

impl TopologyService {
    #[must_use]
    pub fn new(evaluator: ConditionEvaluator) -> Self {
        Self {
            connections: DashMap::new(),
            by_source: DashMap::new(),
            evaluator,
        }
    }

    /// Creates a connection and returns its id.
    pub fn add_connection(
        &self,
        source_id: Uuid,
        target_id: Uuid,
        condition: Option<String>,
    ) -> Uuid {
        let connection_id = Uuid::new_v4();
        self.connections.insert(
            connection_id,
            Connection {
                connection_id,
                source_id,
                target_id,
                condition,
            },
        );
        self.by_source
            .entry(source_id)
            .or_default()
            .push(connection_id);
        tracing::debug!(%connection_id, %source_id, %target_id, "connection added");
        connection_id
    }

    /// Replaces the condition of an existing connection.
    pub fn update_condition(&self, connection_id: Uuid, condition: Option<String>) -> bool {
        match self.connections.get_mut(&connection_id) {
            Some(mut connection) => {
                connection.condition = condition;
                true
            }
            None => false,
        }
    }

    /// Deletes a connection.
    pub fn remove_connection(&self, connection_id: Uuid) -> bool {
        let Some((_, connection)) = self.connections.remove(&connection_id) else {
            return false;
        };
        if let Some(mut ids) = self.by_source.get_mut(&connection.source_id) {
            ids.retain(|id| *id != connection_id);
        }
        true
    }

    #[must_use]
    pub fn get_connection(&self, connection_id: Uuid) -> Option<Connection> {
        self.connections
            .get(&connection_id)
            .map(|entry| entry.value().clone())
    }

    /// All connections leaving `source_id`, unconditionally.
    #[must_use]
    pub fn connections_from(&self, source_id: Uuid) -> Vec<Connection> {
        let Some(ids) = self.by_source.get(&source_id) else {
            return Vec::new();
        };
        ids.iter()
            .filter_map(|id| self.connections.get(id).map(|entry| entry.value().clone()))
            .collect()
    }

    /// Targets of `source_id` whose connection condition evaluates true.
    pub async fn connection_targets(
        &self,
        source_id: Uuid,
        token: &CancellationToken,
    ) -> Vec<Uuid> {
        let mut targets = Vec::new();
        for connection in self.connections_from(source_id) {
            let active = match connection.condition.as_deref() {
                None => true,
                Some(condition) => {
                    self.evaluator
                        .evaluate(source_id, connection.target_id, condition, token)
                        .await
                }
            };
            if active {
                targets.push(connection.target_id);
            }
        }
        targets
    }
}

#[cfg(test)]
mod tests {
    use std::collections::HashMap;
    use std::sync::Arc;

    use async_trait::async_trait;
    use parking_lot::Mutex;
    use verdant_core::PropertyValue;

    use super::*;
    use crate::bus::condition::PropertySource;

    struct MapSource {
        values: Mutex<HashMap<(Uuid, String), PropertyValue>>,
    }

    impl MapSource {
        fn new() -> Arc<Self> {
            Arc::new(Self {
                values: Mutex::new(HashMap::new()),
            })
        }

        fn set(&self, device: Uuid, name: &str, value: PropertyValue) {
            self.values.lock().insert((device, name.to_string()), value);
        }
    }

    #[async_trait]
    impl PropertySource for MapSource {
        async fn property(
            &self,
            device_id: Uuid,
            name: &str,
            _token: &CancellationToken,
        ) -> Option<PropertyValue> {
            self.values
                .lock()
                .get(&(device_id, name.to_string()))
                .cloned()
        }
    }

    fn make_topology() -> (Arc<MapSource>, TopologyService) {
        let source = MapSource::new();
        let evaluator = ConditionEvaluator::new(Arc::clone(&source) as Arc<dyn PropertySource>);
        (source, TopologyService::new(evaluator))
    }

    #[tokio::test]
    async fn unconditional_connection_is_always_active() {
        let (_, topology) = make_topology();
        let token = CancellationToken::new();
        let (source, target) = (Uuid::new_v4(), Uuid::new_v4());

        topology.add_connection(source, target, None);
        assert_eq!(topology.connection_targets(source, &token).await, vec![target]);
        assert!(topology.connection_targets(target, &token).await.is_empty());
    }

    #[tokio::test]
    async fn conditional_connection_follows_property() {
        let (values, topology) = make_topology();
        let token = CancellationToken::new();
        let (source, target) = (Uuid::new_v4(), Uuid::new_v4());

        topology.add_connection(source, target, Some("Temperature > 25".to_string()));

        values.set(source, "Temperature", PropertyValue::Int(20));
        assert!(topology.connection_targets(source, &token).await.is_empty());

        values.set(source, "Temperature", PropertyValue::Int(30));
        assert_eq!(topology.connection_targets(source, &token).await, vec![target]);
    }

    #[tokio::test]
    async fn update_condition_changes_activation() {
        let (values, topology) = make_topology();
        let token = CancellationToken::new();
        let (source, target) = (Uuid::new_v4(), Uuid::new_v4());
        values.set(source, "Mode", PropertyValue::from("manual"));

        let id = topology.add_connection(source, target, Some("Mode == 'auto'".to_string()));
        assert!(topology.connection_targets(source, &token).await.is_empty());

        assert!(topology.update_condition(id, None));
        assert_eq!(topology.connection_targets(source, &token).await, vec![target]);

        assert!(!topology.update_condition(Uuid::new_v4(), None));
    }

    #[tokio::test]
    async fn remove_connection_stops_fanout() {
        let (_, topology) = make_topology();
        let token = CancellationToken::new();
        let (source, target) = (Uuid::new_v4(), Uuid::new_v4());

        let id = topology.add_connection(source, target, None);
        assert!(topology.remove_connection(id));
        assert!(!topology.remove_connection(id));
        assert!(topology.connection_targets(source, &token).await.is_empty());
        assert!(topology.get_connection(id).is_none());
    }

    #[tokio::test]
    async fn multiple_targets_fan_out() {
        let (_, topology) = make_topology();
        let token = CancellationToken::new();
        let source = Uuid::new_v4();
        let (t1, t2) = (Uuid::new_v4(), Uuid::new_v4());

        topology.add_connection(source, t1, None);
        topology.add_connection(source, t2, None);

        let mut targets = topology.connection_targets(source, &token).await;
        targets.sort();
        let mut expected = vec![t1, t2];
        expected.sort();
        assert_eq!(targets, expected);
    }
}
