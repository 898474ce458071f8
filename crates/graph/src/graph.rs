//! Dependency graph with cycle detection and deterministic ordering.

use std::collections::{BTreeMap, BTreeSet, HashSet, VecDeque};

use chrono::Utc;
use parking_lot::RwLock;
use tracing::{debug, info, warn};

use crate::error::{Error, Result};
use crate::node::{ServiceNode, ServiceStatus};

/// A pending service that cannot start yet.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct BlockedService {
    /// The blocked service.
    pub id: String,

    /// Dependencies that are not running, with their current status.
    /// `None` means the dependency is not registered.
    pub waiting_on: Vec<(String, Option<ServiceStatus>)>,
}

#[derive(Default)]
struct Inner {
    nodes: BTreeMap<String, ServiceNode>,
    order: Option<Vec<String>>,
}

/// Services and their dependency edges.
///
/// All methods take `&self`; the node map is guarded by a read-write lock so
/// status transitions are serialized while snapshots can be read concurrently.
#[derive(Default)]
pub struct DependencyGraph {
    inner: RwLock<Inner>,
}

impl std::fmt::Debug for DependencyGraph {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let inner = self.inner.read();
        f.debug_struct("DependencyGraph")
            .field("nodes", &inner.nodes.values().collect::<Vec<_>>())
            .field("order", &inner.order)
            .finish()
    }
}

impl DependencyGraph {
    /// Creates an empty graph.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Registers a service.
    ///
    /// Dependencies may reference services registered later; they are
    /// resolved by [`validate`](Self::validate).
    ///
    /// # Errors
    ///
    /// Returns [`Error::DuplicateService`] if the id is already registered.
    pub fn add_service<I, S>(&self, id: impl Into<String>, dependencies: I) -> Result<()>
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        let id = id.into();
        let dependencies: BTreeSet<String> = dependencies.into_iter().map(Into::into).collect();

        let mut inner = self.inner.write();
        if inner.nodes.contains_key(&id) {
            return Err(Error::DuplicateService(id));
        }

        debug!("registering service {} (dependencies: {:?})", id, dependencies);
        inner
            .nodes
            .insert(id.clone(), ServiceNode::new(id, dependencies));
        inner.order = None;

        Ok(())
    }

    /// Checks that every dependency exists and the edges form a DAG, then
    /// caches and returns the topological start order.
    ///
    /// Nodes with no ordering constraint between them are ordered by id.
    ///
    /// # Errors
    ///
    /// Returns [`Error::UnknownDependency`] for a dangling edge, or
    /// [`Error::CyclicDependency`] naming the nodes of one cycle.
    pub fn validate(&self) -> Result<Vec<String>> {
        let mut inner = self.inner.write();

        for node in inner.nodes.values() {
            if let Some(missing) = node
                .dependencies
                .iter()
                .find(|dependency| !inner.nodes.contains_key(*dependency))
            {
                return Err(Error::UnknownDependency {
                    service: node.id.clone(),
                    dependency: missing.clone(),
                });
            }
        }

        let order = kahn_order(&inner.nodes)?;
        info!("dependency graph validated, start order: {:?}", order);
        inner.order = Some(order.clone());

        Ok(order)
    }

    /// Whether the cached order is current.
    #[must_use]
    pub fn is_validated(&self) -> bool {
        self.inner.read().order.is_some()
    }

    /// The cached topological order.
    ///
    /// # Errors
    ///
    /// Returns [`Error::NotValidated`] if `validate` has not succeeded since
    /// the last structural change.
    pub fn topological_order(&self) -> Result<Vec<String>> {
        self.inner.read().order.clone().ok_or(Error::NotValidated)
    }

    /// Reverse of the cached topological order.
    ///
    /// # Errors
    ///
    /// Returns [`Error::NotValidated`] if there is no current order.
    pub fn shutdown_order(&self) -> Result<Vec<String>> {
        let mut order = self.topological_order()?;
        order.reverse();
        Ok(order)
    }

    /// Pending or ready services whose dependencies are all running, by id.
    #[must_use]
    pub fn ready_services(&self) -> Vec<String> {
        let inner = self.inner.read();
        inner
            .nodes
            .values()
            .filter(|node| node.status.is_pending() && waiting_on(&inner.nodes, node).is_empty())
            .map(|node| node.id.clone())
            .collect()
    }

    /// Pending or ready services that are not ready, with what they wait on.
    #[must_use]
    pub fn blocked_services(&self) -> Vec<BlockedService> {
        let inner = self.inner.read();
        inner
            .nodes
            .values()
            .filter(|node| node.status.is_pending())
            .filter_map(|node| {
                let waiting_on = waiting_on(&inner.nodes, node);
                (!waiting_on.is_empty()).then(|| BlockedService {
                    id: node.id.clone(),
                    waiting_on,
                })
            })
            .collect()
    }

    /// Moves a service to `status`. Setting the current status again is a no-op.
    ///
    /// # Errors
    ///
    /// - [`Error::UnknownService`] if the id is not registered.
    /// - [`Error::InvalidTransition`] if the lifecycle does not allow the move.
    /// - [`Error::DependenciesNotRunning`] when entering `Ready` early.
    pub fn set_status(&self, id: &str, status: ServiceStatus) -> Result<()> {
        self.transition(id, status, None)
    }

    /// Marks a service failed and records the error.
    ///
    /// # Errors
    ///
    /// Same as [`set_status`](Self::set_status).
    pub fn mark_failed(&self, id: &str, error: impl Into<String>) -> Result<()> {
        self.transition(id, ServiceStatus::Failed, Some(error.into()))
    }

    /// Records a passing health check for a service.
    ///
    /// # Errors
    ///
    /// Returns [`Error::UnknownService`] if the id is not registered.
    pub fn record_health_check(&self, id: &str) -> Result<()> {
        let mut inner = self.inner.write();
        let node = inner
            .nodes
            .get_mut(id)
            .ok_or_else(|| Error::UnknownService(id.to_string()))?;
        node.last_health_check_at = Some(Utc::now());
        Ok(())
    }

    /// Current status of a service.
    #[must_use]
    pub fn status(&self, id: &str) -> Option<ServiceStatus> {
        self.inner.read().nodes.get(id).map(|node| node.status)
    }

    /// Snapshot of a single node.
    #[must_use]
    pub fn node(&self, id: &str) -> Option<ServiceNode> {
        self.inner.read().nodes.get(id).cloned()
    }

    /// Snapshot of every node, by id.
    #[must_use]
    pub fn nodes(&self) -> Vec<ServiceNode> {
        self.inner.read().nodes.values().cloned().collect()
    }

    /// Number of registered services.
    #[must_use]
    pub fn len(&self) -> usize {
        self.inner.read().nodes.len()
    }

    /// Whether no services are registered.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.inner.read().nodes.is_empty()
    }

    /// Every service that transitively depends on `id`, in topological order
    /// when the graph is validated and by id otherwise.
    ///
    /// # Errors
    ///
    /// Returns [`Error::UnknownService`] if the id is not registered.
    pub fn dependents_of(&self, id: &str) -> Result<Vec<String>> {
        let inner = self.inner.read();
        if !inner.nodes.contains_key(id) {
            return Err(Error::UnknownService(id.to_string()));
        }

        let mut found = HashSet::new();
        let mut queue = VecDeque::from([id.to_string()]);
        while let Some(current) = queue.pop_front() {
            for node in inner.nodes.values() {
                if node.dependencies.contains(&current) && found.insert(node.id.clone()) {
                    queue.push_back(node.id.clone());
                }
            }
        }

        let ordered = inner.order.as_ref().map_or_else(
            || inner.nodes.keys().cloned().collect::<Vec<_>>(),
            Clone::clone,
        );
        Ok(ordered
            .into_iter()
            .filter(|candidate| found.contains(candidate))
            .collect())
    }

    fn transition(&self, id: &str, to: ServiceStatus, error: Option<String>) -> Result<()> {
        let mut inner = self.inner.write();

        let from = inner
            .nodes
            .get(id)
            .map(|node| node.status)
            .ok_or_else(|| Error::UnknownService(id.to_string()))?;

        if !from.can_transition_to(to) {
            warn!("rejected transition for {}: {} -> {}", id, from, to);
            return Err(Error::InvalidTransition {
                id: id.to_string(),
                from,
                to,
            });
        }

        if to == ServiceStatus::Ready && from != ServiceStatus::Ready {
            let blocked = inner
                .nodes
                .get(id)
                .map(|node| waiting_on(&inner.nodes, node))
                .unwrap_or_default();
            if !blocked.is_empty() {
                return Err(Error::DependenciesNotRunning {
                    id: id.to_string(),
                    waiting_on: blocked.into_iter().map(|(dep, _)| dep).collect(),
                });
            }
        }

        let Some(node) = inner.nodes.get_mut(id) else {
            return Err(Error::UnknownService(id.to_string()));
        };

        if from != to {
            debug!("service {}: {} -> {}", id, from, to);
        }
        node.status = to;
        if to == ServiceStatus::Running && from != ServiceStatus::Running {
            node.last_health_check_at = Some(Utc::now());
        }
        if let Some(error) = error {
            node.last_error = Some(error);
        }

        Ok(())
    }
}

/// Dependencies of `node` that are not running.
fn waiting_on(
    nodes: &BTreeMap<String, ServiceNode>,
    node: &ServiceNode,
) -> Vec<(String, Option<ServiceStatus>)> {
    node.dependencies
        .iter()
        .filter_map(|dependency| match nodes.get(dependency).map(|dep| dep.status) {
            Some(ServiceStatus::Running) => None,
            status => Some((dependency.clone(), status)),
        })
        .collect()
}

/// Kahn's algorithm over `nodes`, breaking ties by id.
fn kahn_order(nodes: &BTreeMap<String, ServiceNode>) -> Result<Vec<String>> {
    let mut in_degree: BTreeMap<&str, usize> = BTreeMap::new();
    let mut dependents: BTreeMap<&str, Vec<&str>> = BTreeMap::new();

    for node in nodes.values() {
        in_degree.insert(&node.id, node.dependencies.len());
        for dependency in &node.dependencies {
            dependents
                .entry(dependency.as_str())
                .or_default()
                .push(&node.id);
        }
    }

    let mut ready: BTreeSet<&str> = in_degree
        .iter()
        .filter(|(_, degree)| **degree == 0)
        .map(|(id, _)| *id)
        .collect();
    let mut order = Vec::with_capacity(nodes.len());

    while let Some(id) = ready.pop_first() {
        order.push(id.to_string());
        for dependent in dependents.get(id).into_iter().flatten() {
            if let Some(degree) = in_degree.get_mut(dependent) {
                *degree -= 1;
                if *degree == 0 {
                    ready.insert(*dependent);
                }
            }
        }
    }

    if order.len() == nodes.len() {
        return Ok(order);
    }

    let residual: BTreeSet<&str> = in_degree
        .iter()
        .filter(|(_, degree)| **degree > 0)
        .map(|(id, _)| *id)
        .collect();
    Err(Error::CyclicDependency {
        cycle_nodes: find_cycle(nodes, &residual),
    })
}

/// Extracts one cycle from the nodes Kahn's algorithm could not order.
///
/// Every residual node has at least one residual dependency, so following
/// the smallest such dependency from any residual node must revisit a node.
fn find_cycle(nodes: &BTreeMap<String, ServiceNode>, residual: &BTreeSet<&str>) -> Vec<String> {
    let Some(start) = residual.first() else {
        return Vec::new();
    };

    let mut path: Vec<&str> = Vec::new();
    let mut current = *start;
    loop {
        if let Some(position) = path.iter().position(|seen| *seen == current) {
            return path[position..].iter().map(ToString::to_string).collect();
        }
        path.push(current);

        let next = nodes.get(current).and_then(|node| {
            node.dependencies
                .iter()
                .find(|dependency| residual.contains(dependency.as_str()))
        });
        match next {
            Some(next) => current = next.as_str(),
            None => return path.iter().map(ToString::to_string).collect(),
        }
    }
}
