//! Service registry and composition root.
//!
//! The registry holds service definitions (factory, dependency list,
//! lifecycle) and resolves instances on demand. Two separate guards protect
//! against dependency cycles:
//!
//! - `validate_dependencies` performs a full three-color depth-first walk
//!   over the registered definitions without constructing anything, so a
//!   deployment can fail fast at startup with every cycle and every missing
//!   dependency in one report.
//! - `resolve` maintains an in-progress chain across factory suspension
//!   points, so ad-hoc out-of-order resolution still fails with the full
//!   chain instead of recursing forever.
//!
//! Singleton instances are owned exclusively by the registry for its
//! lifetime; factories receive the registry itself so they can resolve their
//! own dependencies recursively.

use std::any::Any;
use std::collections::BTreeMap;
use std::collections::BTreeSet;
use std::collections::HashMap;
use std::fmt;
use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;

use serde::Serialize;
use tokio::sync::Mutex;
use tracing::debug;

use crate::error::Result;
use crate::error::SwitchbackError;
use crate::types::ServiceId;

/// A resolved service instance.
///
/// Instances are type-erased; use [`ServiceRegistry::get`] for a typed
/// resolution that downcasts to a concrete type.
pub type ServiceInstance = Arc<dyn Any + Send + Sync>;

/// Future returned by a service factory.
pub type FactoryFuture = Pin<Box<dyn Future<Output = Result<ServiceInstance>> + Send>>;

/// Factory invoked to construct a service instance.
///
/// Receives the registry so the factory can resolve its dependencies.
pub type ServiceFactory = Arc<dyn Fn(Arc<ServiceRegistry>) -> FactoryFuture + Send + Sync>;

/// Definition of a single service: identifier, factory, lifecycle, and
/// declared dependencies.
#[derive(Clone)]
pub struct ServiceDefinition {
    /// Unique identifier within a registry.
    pub id: ServiceId,
    /// Factory producing an instance given the registry.
    pub factory: ServiceFactory,
    /// Whether the instance is cached after first resolution (default true).
    pub singleton: bool,
    /// Identifiers this service depends on, for static validation.
    pub dependencies: Vec<ServiceId>,
}

impl ServiceDefinition {
    /// Create a singleton definition with no declared dependencies.
    pub fn new<F, Fut>(id: impl Into<ServiceId>, factory: F) -> Self
    where
        F: Fn(Arc<ServiceRegistry>) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<ServiceInstance>> + Send + 'static,
    {
        Self {
            id: id.into(),
            factory: Arc::new(move |registry| Box::pin(factory(registry))),
            singleton: true,
            dependencies: Vec::new(),
        }
    }

    /// Mark the definition as transient: every resolution constructs a fresh
    /// instance.
    pub fn transient(mut self) -> Self {
        self.singleton = false;
        self
    }

    /// Declare the identifiers this service depends on.
    pub fn depends_on<I, S>(mut self, dependencies: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<ServiceId>,
    {
        self.dependencies = dependencies.into_iter().map(Into::into).collect();
        self
    }
}

impl fmt::Debug for ServiceDefinition {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ServiceDefinition")
            .field("id", &self.id)
            .field("singleton", &self.singleton)
            .field("dependencies", &self.dependencies)
            .finish_non_exhaustive()
    }
}

/// Bookkeeping derived from a definition, for introspection and reporting.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ServiceMetadata {
    /// Whether the definition is a singleton.
    pub singleton: bool,
    /// Whether a singleton instance currently exists.
    pub initialized: bool,
    /// Declared dependency identifiers.
    pub dependencies: Vec<ServiceId>,
}

/// A dependency named by a definition but never registered.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct MissingDependency {
    /// Service declaring the dependency.
    pub dependent: ServiceId,
    /// Identifier that has no registration.
    pub dependency: ServiceId,
}

/// Result of a full static dependency validation pass.
///
/// The pass is diagnostic: it never stops at the first problem, so the
/// report lists every distinct cycle and every missing dependency found.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct DependencyReport {
    /// Every distinct dependency cycle, each listed once.
    pub cycles: Vec<Vec<ServiceId>>,
    /// Every dependency identifier with no corresponding registration.
    pub missing: Vec<MissingDependency>,
}

impl DependencyReport {
    /// True when the graph is acyclic and fully registered.
    pub fn is_ok(&self) -> bool {
        self.cycles.is_empty() && self.missing.is_empty()
    }
}

struct Registration {
    factory: ServiceFactory,
    singleton: bool,
    dependencies: Vec<ServiceId>,
    initialized: bool,
}

#[derive(Default)]
struct RegistryState {
    services: HashMap<ServiceId, Registration>,
    instances: HashMap<ServiceId, ServiceInstance>,
    in_progress: Vec<ServiceId>,
}

/// Composition root holding service definitions and resolved singletons.
#[derive(Default)]
pub struct ServiceRegistry {
    state: Mutex<RegistryState>,
}

impl ServiceRegistry {
    /// Create an empty registry.
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    /// Register a service definition.
    ///
    /// Fails with [`SwitchbackError::DuplicateService`] if the identifier is
    /// already registered; duplicate registration is a configuration mistake
    /// and is never silently ignored.
    pub async fn register(&self, definition: ServiceDefinition) -> Result<()> {
        let mut state = self.state.lock().await;
        if state.services.contains_key(&definition.id) {
            return Err(SwitchbackError::DuplicateService { service: definition.id });
        }
        debug!(service = %definition.id, singleton = definition.singleton, "service registered");
        state.services.insert(
            definition.id,
            Registration {
                factory: definition.factory,
                singleton: definition.singleton,
                dependencies: definition.dependencies,
                initialized: false,
            },
        );
        Ok(())
    }

    /// Resolve a service instance by identifier.
    ///
    /// Singleton instances are identity-stable: once constructed, the same
    /// `Arc` is returned on every call. The factory receives the registry so
    /// it can resolve dependencies recursively; an in-progress chain guards
    /// against runtime cycles, and the chain marker is removed on both the
    /// success and failure paths so a failed factory never poisons later
    /// resolution of the same identifier.
    pub fn resolve(self: &Arc<Self>, id: &ServiceId) -> FactoryFuture {
        let registry = Arc::clone(self);
        let id = id.clone();
        Box::pin(async move {
            let (factory, singleton) = {
                let mut state = registry.state.lock().await;
                let registration = state
                    .services
                    .get(&id)
                    .ok_or_else(|| SwitchbackError::UnknownService { service: id.clone() })?;
                let singleton = registration.singleton;
                let factory = Arc::clone(&registration.factory);
                if singleton {
                    if let Some(instance) = state.instances.get(&id) {
                        return Ok(Arc::clone(instance));
                    }
                }
                if state.in_progress.contains(&id) {
                    let mut chain = state.in_progress.clone();
                    chain.push(id.clone());
                    return Err(SwitchbackError::CircularDependency { chain });
                }
                state.in_progress.push(id.clone());
                (factory, singleton)
            };

            let result = factory(Arc::clone(&registry)).await;

            let mut state = registry.state.lock().await;
            if let Some(pos) = state.in_progress.iter().rposition(|entry| entry == &id) {
                state.in_progress.remove(pos);
            }
            match result {
                Ok(instance) => {
                    if singleton {
                        state.instances.insert(id.clone(), Arc::clone(&instance));
                        if let Some(registration) = state.services.get_mut(&id) {
                            registration.initialized = true;
                        }
                    }
                    debug!(service = %id, "service resolved");
                    Ok(instance)
                }
                Err(error) => Err(error),
            }
        })
    }

    /// Resolve a service and downcast it to a concrete type.
    pub async fn get<T: Send + Sync + 'static>(self: &Arc<Self>, id: &ServiceId) -> Result<Arc<T>> {
        let instance = self.resolve(id).await?;
        instance.downcast::<T>().map_err(|_| SwitchbackError::WrongInstanceType {
            service: id.clone(),
            expected: std::any::type_name::<T>(),
        })
    }

    /// Validate the full dependency graph without constructing anything.
    ///
    /// Runs a classic three-color depth-first search over every registered
    /// definition, reporting every distinct cycle, and separately flags any
    /// dependency identifier that has no corresponding registration. Intended
    /// as a startup diagnostic before the application begins serving users.
    pub async fn validate_dependencies(&self) -> DependencyReport {
        let graph: BTreeMap<ServiceId, Vec<ServiceId>> = {
            let state = self.state.lock().await;
            state
                .services
                .iter()
                .map(|(id, registration)| (id.clone(), registration.dependencies.clone()))
                .collect()
        };
        validate_graph(&graph)
    }

    /// Introspect the metadata for a registered service.
    pub async fn metadata(&self, id: &ServiceId) -> Option<ServiceMetadata> {
        let state = self.state.lock().await;
        state.services.get(id).map(|registration| ServiceMetadata {
            singleton: registration.singleton,
            initialized: registration.initialized,
            dependencies: registration.dependencies.clone(),
        })
    }

    /// All registered service identifiers, sorted.
    pub async fn service_ids(&self) -> Vec<ServiceId> {
        let state = self.state.lock().await;
        let mut ids: Vec<ServiceId> = state.services.keys().cloned().collect();
        ids.sort();
        ids
    }

    /// Remove a single registration and its instance, if any.
    pub async fn unregister(&self, id: &ServiceId) -> Result<()> {
        let mut state = self.state.lock().await;
        if state.services.remove(id).is_none() {
            return Err(SwitchbackError::UnknownService { service: id.clone() });
        }
        state.instances.remove(id);
        Ok(())
    }

    /// Drop all singleton instances while preserving definitions.
    pub async fn clear_instances(&self) {
        let mut state = self.state.lock().await;
        state.instances.clear();
        for registration in state.services.values_mut() {
            registration.initialized = false;
        }
    }

    /// Remove every definition and instance.
    pub async fn clear(&self) {
        let mut state = self.state.lock().await;
        state.services.clear();
        state.instances.clear();
        state.in_progress.clear();
    }
}

#[derive(Clone, Copy, PartialEq, Eq)]
enum Color {
    White,
    Grey,
    Black,
}

/// Three-color depth-first cycle and missing-dependency scan.
///
/// Cycles are normalized to start at their smallest member so each distinct
/// cycle is reported exactly once regardless of the traversal entry point.
fn validate_graph(graph: &BTreeMap<ServiceId, Vec<ServiceId>>) -> DependencyReport {
    let mut colors: BTreeMap<&ServiceId, Color> = graph.keys().map(|id| (id, Color::White)).collect();
    let mut path: Vec<ServiceId> = Vec::new();
    let mut cycles: BTreeSet<Vec<ServiceId>> = BTreeSet::new();
    let mut missing: BTreeSet<(ServiceId, ServiceId)> = BTreeSet::new();

    fn visit<'a>(
        node: &'a ServiceId,
        graph: &'a BTreeMap<ServiceId, Vec<ServiceId>>,
        colors: &mut BTreeMap<&'a ServiceId, Color>,
        path: &mut Vec<ServiceId>,
        cycles: &mut BTreeSet<Vec<ServiceId>>,
        missing: &mut BTreeSet<(ServiceId, ServiceId)>,
    ) {
        colors.insert(node, Color::Grey);
        path.push(node.clone());
        for dependency in &graph[node] {
            match graph.get_key_value(dependency) {
                None => {
                    missing.insert((node.clone(), dependency.clone()));
                }
                Some((dependency, _)) => match colors[dependency] {
                    Color::White => visit(dependency, graph, colors, path, cycles, missing),
                    Color::Grey => {
                        // Grey neighbor: the path from its first occurrence to
                        // the current node closes a cycle.
                        if let Some(start) = path.iter().position(|entry| entry == dependency) {
                            cycles.insert(normalize_cycle(&path[start..]));
                        }
                    }
                    Color::Black => {}
                },
            }
        }
        path.pop();
        colors.insert(node, Color::Black);
    }

    for node in graph.keys() {
        if colors[node] == Color::White {
            visit(node, graph, &mut colors, &mut path, &mut cycles, &mut missing);
        }
    }

    DependencyReport {
        cycles: cycles.into_iter().collect(),
        missing: missing
            .into_iter()
            .map(|(dependent, dependency)| MissingDependency { dependent, dependency })
            .collect(),
    }
}

/// Rotate a cycle so it starts at its smallest member.
fn normalize_cycle(cycle: &[ServiceId]) -> Vec<ServiceId> {
    let start = cycle
        .iter()
        .enumerate()
        .min_by(|a, b| a.1.cmp(b.1))
        .map(|(index, _)| index)
        .unwrap_or(0);
    let mut normalized = Vec::with_capacity(cycle.len());
    normalized.extend_from_slice(&cycle[start..]);
    normalized.extend_from_slice(&cycle[..start]);
    normalized
}
