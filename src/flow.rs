use std::any::type_name;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use serde::Serialize;
use serde::de::DeserializeOwned;
use uuid::Uuid;

use crate::cache::{CacheGateway, InMemoryCache, PersistentCache, ResultGroup};
use crate::engine::dag::FlowDag;
use crate::engine::deriver::{Deriver, PERSISTENT_CACHE, VERSIONING_POLICY};
use crate::engine::logger::TaskLogRecord;
use crate::engine::{FlowState, Provider};
use crate::error::FlowError;
use crate::key::DescriptorNode;
use crate::provider::ValueProvider;
use crate::versioning::{VersioningMode, VersioningPolicy};

fn install_value<T>(state: &mut FlowState, name: &str, values: impl IntoIterator<Item = T>) -> Result<(), FlowError>
where
    T: Serialize + DeserializeOwned + Send + Sync + 'static,
{
    state.install(Arc::new(ValueProvider::new(name, values)?));
    Ok(())
}

/// Assembles a flow definition.
///
/// A fresh builder persists into an [`InMemoryCache`] and uses the
/// [`VersioningMode::Manual`] policy. Every flow built from the same builder
/// shares its cache.
#[derive(Clone)]
pub struct FlowBuilder {
    state: FlowState,
}

impl Default for FlowBuilder {
    fn default() -> Self {
        Self::new()
    }
}

impl FlowBuilder {
    pub fn new() -> Self {
        let mut builder = Self {
            state: FlowState::new(),
        };

        builder
            .set_cache(InMemoryCache::new())
            .set_versioning_mode(VersioningMode::Manual);

        builder
    }

    /// Defines `name` as a single value.
    pub fn assign<T>(&mut self, name: &str, value: T) -> Result<&mut Self, FlowError>
    where
        T: Serialize + DeserializeOwned + Send + Sync + 'static,
    {
        self.assign_values(name, [value])
    }

    /// Defines `name` as several values, one case each.
    pub fn assign_values<T>(
        &mut self,
        name: &str,
        values: impl IntoIterator<Item = T>,
    ) -> Result<&mut Self, FlowError>
    where
        T: Serialize + DeserializeOwned + Send + Sync + 'static,
    {
        install_value(&mut self.state, name, values)?;
        Ok(self)
    }

    pub fn declare(&mut self, provider: impl Provider + 'static) -> &mut Self {
        self.state.install(Arc::new(provider));
        self
    }

    pub fn set_cache(&mut self, gateway: impl CacheGateway + 'static) -> &mut Self {
        let cache = PersistentCache::new(gateway);
        self.declare(ValueProvider::opaque(PERSISTENT_CACHE, cache, "custom"))
    }

    pub fn set_versioning_mode(&mut self, mode: VersioningMode) -> &mut Self {
        self.declare(ValueProvider::opaque(
            VERSIONING_POLICY,
            mode.policy(),
            mode.to_string(),
        ))
    }

    pub fn set_versioning_policy(&mut self, policy: VersioningPolicy) -> &mut Self {
        self.declare(ValueProvider::opaque(VERSIONING_POLICY, policy, "custom"))
    }

    /// Freezes the current definition into a new flow.
    pub fn build(&self) -> Flow {
        Flow::new(self.state.clone())
    }
}

/// An immutable flow definition together with the state of its derivations.
///
/// Derivations against one flow are serialized; the flow itself can be shared
/// between threads.
pub struct Flow {
    state: FlowState,
    deriver: Mutex<Deriver>,
}

impl Flow {
    fn new(state: FlowState) -> Self {
        let deriver = Deriver::new(state.clone(), Uuid::new_v4());

        Self {
            state,
            deriver: Mutex::new(deriver),
        }
    }

    fn deriver(&self) -> MutexGuard<'_, Deriver> {
        // Incomplete plans left by a panicking task are retried next time.
        self.deriver.lock().unwrap_or_else(PoisonError::into_inner)
    }

    pub fn flow_instance_id(&self) -> Uuid {
        self.deriver().flow_instance_id()
    }

    /// Surfaces configuration errors without deriving anything.
    pub fn get_ready(&self) -> Result<(), FlowError> {
        Ok(self.deriver().get_ready()?)
    }

    pub fn derive(&self, dnode: impl Into<DescriptorNode>) -> Result<ResultGroup, FlowError> {
        Ok(self.deriver().derive(&dnode.into())?)
    }

    /// The single value of `name`.
    pub fn get<T: Clone + 'static>(&self, name: &str) -> Result<T, FlowError> {
        let mut values = self.get_all::<T>(name)?;

        match values.len() {
            1 => Ok(values.remove(0)),
            count => Err(FlowError::ValueCount {
                entity: name.to_string(),
                count,
            }),
        }
    }

    /// Every value of `name`, one per case key.
    pub fn get_all<T: Clone + 'static>(&self, name: &str) -> Result<Vec<T>, FlowError> {
        let group = self.derive(name)?;

        group
            .iter()
            .map(|result| {
                result
                    .downcast_ref::<T>()
                    .cloned()
                    .ok_or_else(|| FlowError::ValueType {
                        entity: name.to_string(),
                        expected: type_name::<T>(),
                    })
            })
            .collect()
    }

    /// A new flow with `name` redefined as `value`. The new flow has its own
    /// graph and instance id, but the same cache.
    pub fn setting<T>(&self, name: &str, value: T) -> Result<Flow, FlowError>
    where
        T: Serialize + DeserializeOwned + Send + Sync + 'static,
    {
        self.setting_values(name, [value])
    }

    pub fn setting_values<T>(
        &self,
        name: &str,
        values: impl IntoIterator<Item = T>,
    ) -> Result<Flow, FlowError>
    where
        T: Serialize + DeserializeOwned + Send + Sync + 'static,
    {
        let mut state = self.state.clone();
        install_value(&mut state, name, values)?;
        Ok(Flow::new(state))
    }

    /// A new flow with `provider` installed.
    pub fn declaring(&self, provider: impl Provider + 'static) -> Flow {
        let mut state = self.state.clone();
        state.install(Arc::new(provider));
        Flow::new(state)
    }

    pub fn export_dag(&self, include_core: bool) -> Result<FlowDag, FlowError> {
        Ok(self.deriver().export_dag(include_core)?)
    }

    /// Drains the record of how each task key was obtained since the last
    /// call.
    pub fn take_log(&self) -> Vec<TaskLogRecord> {
        self.deriver().take_log()
    }
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::{AtomicUsize, Ordering};

    use tracing::Level;

    use super::*;
    use crate::error::DeriveError;
    use crate::protocol::Protocol;
    use crate::provider::FunctionProvider;

    /// Messages a user would see at the default level.
    fn messages(flow: &Flow) -> Vec<String> {
        let mut messages: Vec<String> = flow
            .take_log()
            .into_iter()
            .filter(|record| record.level == Level::INFO)
            .map(|record| record.to_string())
            .collect();
        messages.sort();
        messages
    }

    fn sorted(expected: &[&str]) -> Vec<String> {
        let mut expected: Vec<String> = expected.iter().map(ToString::to_string).collect();
        expected.sort();
        expected
    }

    fn chain_builder() -> FlowBuilder {
        let mut builder = FlowBuilder::new();
        builder.assign("x", 1i64).unwrap();
        builder
            .declare(FunctionProvider::new("x_plus_one", ["x"], |inputs| {
                Ok(inputs.get::<i64>("x")? + 1)
            }))
            .declare(FunctionProvider::new("x_plus_two", ["x_plus_one"], |inputs| {
                Ok(inputs.get::<i64>("x_plus_one")? + 1)
            }));
        builder
    }

    #[test]
    fn test_logging_details() {
        let cache = InMemoryCache::new();
        let mut builder = chain_builder();
        builder.set_cache(cache.clone());

        let flow = builder.build();
        assert_eq!(flow.get::<i64>("x_plus_one").unwrap(), 2);
        assert_eq!(
            messages(&flow),
            sorted(&[
                "Accessed   x(x=1) from definition",
                "Computing  x_plus_one(x=1) ...",
                "Computed   x_plus_one(x=1)",
            ])
        );

        assert_eq!(flow.get::<i64>("x_plus_two").unwrap(), 3);
        assert_eq!(
            messages(&flow),
            sorted(&[
                "Accessed   x_plus_one(x=1) from in-memory cache",
                "Computing  x_plus_two(x=1) ...",
                "Computed   x_plus_two(x=1)",
            ])
        );

        let flow = builder.build();
        assert_eq!(flow.get::<i64>("x_plus_one").unwrap(), 2);
        assert_eq!(
            messages(&flow),
            sorted(&["Loaded     x_plus_one(x=1) from disk cache"])
        );

        let flow = builder.build();
        assert_eq!(flow.get::<i64>("x_plus_two").unwrap(), 3);
        assert_eq!(
            messages(&flow),
            sorted(&["Loaded     x_plus_two(x=1) from disk cache"])
        );

        // The values 1, 2 and 3.
        assert_eq!(cache.artifact_count(), 3);

        let flow = flow.setting("x_plus_one", 3i64).unwrap();
        assert_eq!(flow.get::<i64>("x_plus_two").unwrap(), 4);
        assert_eq!(
            messages(&flow),
            sorted(&[
                "Accessed   x_plus_one(x_plus_one=3) from definition",
                "Computing  x_plus_two(x_plus_one=3) ...",
                "Computed   x_plus_two(x_plus_one=3)",
            ])
        );
        assert_eq!(cache.artifact_count(), 4);

        // The override left the original entries alone.
        let flow = builder.build();
        assert_eq!(flow.get::<i64>("x").unwrap(), 1);
        assert_eq!(flow.get::<i64>("x_plus_two").unwrap(), 3);
        assert_eq!(
            messages(&flow),
            sorted(&[
                "Loaded     x(x=1) from disk cache",
                "Loaded     x_plus_two(x=1) from disk cache",
            ])
        );
    }

    fn times_hundred(inputs: &crate::provider::Inputs) -> anyhow::Result<i64> {
        Ok(inputs.get::<i64>("x")? * 100)
    }

    #[test]
    fn test_declaring_new_code() {
        let builder = chain_builder();
        let flow = builder.build();
        assert_eq!(flow.get::<i64>("x_plus_two").unwrap(), 3);

        // Same version, so the cached value still stands.
        let edited = flow.declaring(FunctionProvider::new("x_plus_one", ["x"], times_hundred));
        assert_eq!(edited.get::<i64>("x_plus_two").unwrap(), 3);

        let bumped = flow.declaring(
            FunctionProvider::new("x_plus_one", ["x"], times_hundred).version("2"),
        );
        assert_eq!(bumped.get::<i64>("x_plus_two").unwrap(), 101);
    }

    #[test]
    fn test_custom_versioning_policy() {
        let mut builder = chain_builder();
        builder.set_versioning_policy(VersioningPolicy {
            check_for_bytecode_errors: false,
            treat_bytecode_as_functional: true,
        });

        let flow = builder.build();
        assert_eq!(flow.get::<i64>("x_plus_two").unwrap(), 3);

        let edited = flow.declaring(FunctionProvider::new("x_plus_one", ["x"], times_hundred));
        assert_eq!(edited.get::<i64>("x_plus_two").unwrap(), 101);
    }

    #[test]
    fn test_memoized_without_persistence() {
        let calls = Arc::new(AtomicUsize::new(0));
        let counter = calls.clone();

        let mut builder = FlowBuilder::new();
        builder.assign("x", 2i64).unwrap();
        builder.declare(
            FunctionProvider::new("square", ["x"], move |inputs| {
                counter.fetch_add(1, Ordering::SeqCst);
                let x = inputs.get::<i64>("x")?;
                Ok(x * x)
            })
            .persist(false),
        );

        let flow = builder.build();
        assert_eq!(flow.get::<i64>("square").unwrap(), 4);
        assert_eq!(flow.get::<i64>("square").unwrap(), 4);
        assert_eq!(calls.load(Ordering::SeqCst), 1);

        // Nothing was persisted, so a new flow computes again.
        assert_eq!(builder.build().get::<i64>("square").unwrap(), 4);
        assert_eq!(calls.load(Ordering::SeqCst), 2);
    }

    #[test]
    fn test_persisted_values_are_not_recomputed() {
        let calls = Arc::new(AtomicUsize::new(0));
        let counter = calls.clone();

        let mut builder = FlowBuilder::new();
        builder.assign("x", 2i64).unwrap();
        builder.declare(
            FunctionProvider::new("double", ["x"], move |inputs| {
                counter.fetch_add(1, Ordering::SeqCst);
                Ok(inputs.get::<i64>("x")? * 2)
            })
            .memoize(false),
        );

        for _ in 0..3 {
            assert_eq!(builder.build().get::<i64>("double").unwrap(), 4);
        }
        assert_eq!(calls.load(Ordering::SeqCst), 1);

        builder.assign("x", 3i64).unwrap();
        assert_eq!(builder.build().get::<i64>("double").unwrap(), 6);
        assert_eq!(calls.load(Ordering::SeqCst), 2);
    }

    /// Lowercases strings on the way into the cache, so a persisted value
    /// differs from the one computed.
    struct Lowercase;

    impl Protocol for Lowercase {
        fn name(&self) -> &'static str {
            "lowercase"
        }

        fn validate(&self, value: &crate::core::Dynamic) -> anyhow::Result<()> {
            value
                .downcast_ref::<String>()
                .map(|_| ())
                .ok_or_else(|| anyhow::anyhow!("expected a string"))
        }

        fn encode(&self, value: &crate::core::Dynamic) -> anyhow::Result<Vec<u8>> {
            let text = value
                .downcast_ref::<String>()
                .ok_or_else(|| anyhow::anyhow!("expected a string"))?;
            Ok(text.to_lowercase().into_bytes())
        }

        fn decode(&self, bytes: &[u8]) -> anyhow::Result<crate::core::Dynamic> {
            Ok(Arc::new(String::from_utf8(bytes.to_vec())?))
        }
    }

    #[test]
    fn test_persisted_values_are_returned_as_deserialized() {
        let mut builder = FlowBuilder::new();
        builder.declare(
            FunctionProvider::new("greeting", Vec::<&str>::new(), |_| Ok("Hello".to_string()))
                .protocol("greeting", Arc::new(Lowercase)),
        );

        let flow = builder.build();
        assert_eq!(flow.get::<String>("greeting").unwrap(), "hello");
        assert_eq!(flow.get::<String>("greeting").unwrap(), "hello");
        assert_eq!(builder.build().get::<String>("greeting").unwrap(), "hello");
    }

    fn versioned_builder(cache: &InMemoryCache, code: &str, minor: Option<&str>) -> FlowBuilder {
        let mut provider = FunctionProvider::new("f", ["x"], |inputs| Ok(inputs.get::<i64>("x")? * 10))
            .version("1")
            .code(code);
        if let Some(minor) = minor {
            provider = provider.minor(minor);
        }

        let mut builder = FlowBuilder::new();
        builder
            .set_cache(cache.clone())
            .set_versioning_mode(VersioningMode::Assist)
            .assign("x", 1i64)
            .unwrap()
            .declare(provider);
        builder
    }

    #[test]
    fn test_code_versioning_assist() {
        let cache = InMemoryCache::new();

        let flow = versioned_builder(&cache, "v1", None).build();
        assert_eq!(flow.get::<i64>("f").unwrap(), 10);

        // Different code, same version.
        let flow = versioned_builder(&cache, "v2", None).build();
        let err = flow.get::<i64>("f").unwrap_err();
        assert!(matches!(
            err,
            FlowError::Derive(DeriveError::CodeVersioning { ref descriptor, .. }) if descriptor == "f"
        ));

        // A minor bump says the behavior is unchanged, so the cached value is
        // reused and its provenance updated.
        let flow = versioned_builder(&cache, "v2", Some("1")).build();
        assert_eq!(flow.get::<i64>("f").unwrap(), 10);
        assert!(messages(&flow).contains(&"Loaded     f(x=1) from disk cache".to_string()));

        let flow = versioned_builder(&cache, "v2", Some("1")).build();
        assert!(flow.get::<i64>("f").is_ok());
    }

    #[test]
    fn test_auto_versioning_recomputes_on_code_change() {
        let cache = InMemoryCache::new();
        let build = |code: &str| {
            let mut builder = FlowBuilder::new();
            builder
                .set_cache(cache.clone())
                .set_versioning_mode(VersioningMode::Auto)
                .declare(FunctionProvider::new("f", Vec::<&str>::new(), |_| Ok(1i64)).code(code));
            builder.build()
        };

        let flow = build("v1");
        flow.get::<i64>("f").unwrap();
        flow.take_log();

        let flow = build("v2");
        flow.get::<i64>("f").unwrap();
        assert!(messages(&flow).contains(&"Computed   f()".to_string()));
    }

    #[test]
    fn test_multiple_values_and_get() {
        let mut builder = FlowBuilder::new();
        builder.assign_values("x", [1i64, 2, 3]).unwrap();
        builder.declare(FunctionProvider::new("y", ["x"], |inputs| Ok(inputs.get::<i64>("x")? * 2)));

        let flow = builder.build();
        let mut values = flow.get_all::<i64>("y").unwrap();
        values.sort();
        assert_eq!(values, vec![2, 4, 6]);

        assert!(matches!(
            flow.get::<i64>("y"),
            Err(FlowError::ValueCount { count: 3, .. })
        ));
        assert!(matches!(
            flow.setting("x", 1i64).unwrap().get::<String>("x"),
            Err(FlowError::ValueType { .. })
        ));
    }

    #[test]
    fn test_tuples() {
        let mut builder = FlowBuilder::new();
        builder.assign("a", 1i64).unwrap().assign("b", 2i64).unwrap();

        let flow = builder.build();
        let group = flow.derive(DescriptorNode::tuple(["a", "b"])).unwrap();
        assert_eq!(group.len(), 1);
        assert_eq!(group.key_space.names().collect::<Vec<_>>(), vec!["a", "b"]);

        let tuple = group[0]
            .downcast_ref::<Vec<crate::core::Dynamic>>()
            .unwrap();
        assert_eq!(tuple[0].downcast_ref::<i64>(), Some(&1));
        assert_eq!(tuple[1].downcast_ref::<i64>(), Some(&2));
    }

    #[test]
    fn test_undefined_entity() {
        let flow = FlowBuilder::new().build();
        assert!(matches!(
            flow.get::<i64>("nope"),
            Err(FlowError::Derive(DeriveError::UndefinedEntity(name))) if name == "nope"
        ));
    }

    #[test]
    fn test_export_dag() {
        let mut builder = chain_builder();
        builder.assign_values("x", [1i64, 2]).unwrap();

        let dag = builder.build().export_dag(false).unwrap();
        assert_eq!(dag.node_count(), 6);
        assert_eq!(dag.edge_count(), 4);

        let node = dag.node_by_name("x_plus_one[1]").unwrap();
        assert_eq!(node.entity_name, "x_plus_one");
        assert_eq!(node.case_key.to_string(), "x=2");
        assert_eq!(node.task_ix, 1);

        let dag = builder.build().export_dag(true).unwrap();
        assert!(dag.node_by_name(PERSISTENT_CACHE).is_some());
        assert!(dag.to_string().starts_with("graph LR\n"));
    }
}
