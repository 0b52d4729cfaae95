//! Named factories for the pluggable components of a job.
use crate::context::Context;
use crate::error::PoolError;
use serde_json::{Map, Value};
use std::collections::BTreeMap;
use std::fmt;

/// Builds a component from its arguments
pub type Factory<T> = Box<dyn Fn(&Context, &Value) -> Result<T, PoolError> + Send + Sync>;

/// A map from plugin name to the factory of that plugin. A job fills a
/// registry with `register` before reading its configuration, and every
/// component is then created through it.
pub struct Registry<T> {
    plugins: BTreeMap<String, Factory<T>>,
}

impl<T> fmt::Debug for Registry<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Registry")
            .field("plugins", &self.plugins.keys().collect::<Vec<_>>())
            .finish()
    }
}

impl<T> Default for Registry<T> {
    fn default() -> Self {
        Registry {
            plugins: BTreeMap::new(),
        }
    }
}

impl<T> Registry<T> {
    pub fn new() -> Self {
        Registry::default()
    }

    /// Adds a plugin, replacing any plugin registered under the same name
    pub fn register<F>(&mut self, name: &str, factory: F)
    where
        F: Fn(&Context, &Value) -> Result<T, PoolError> + Send + Sync + 'static,
    {
        self.plugins.insert(name.to_string(), Box::new(factory));
    }

    /// The names of every registered plugin, sorted
    pub fn names(&self) -> Vec<&str> {
        self.plugins.keys().map(String::as_str).collect()
    }

    pub fn contains(&self, name: &str) -> bool {
        self.plugins.contains_key(name)
    }

    /// Creates the plugin `name` with the arguments `args`.
    pub fn create(&self, name: &str, ctx: &Context, args: &Value) -> Result<T, PoolError> {
        let factory = self
            .plugins
            .get(name)
            .ok_or_else(|| PoolError::UnknownPlugin(name.to_string()))?;
        factory(ctx, args)
    }

    /// Creates a plugin from a configuration value, which is one of
    /// - an object with a `"plugin"` key naming the plugin, whose other keys
    ///   are the arguments: `{"plugin": "Uniform", "N": 10}`
    /// - an object with a single key, the plugin name, whose value is an
    ///   object of arguments: `{"Uniform": {"N": 10}}`
    /// - a string, the name of a plugin that takes no arguments
    pub fn from_config(&self, ctx: &Context, config: &Value) -> Result<T, PoolError> {
        match config {
            Value::String(name) => self.create(name, ctx, &Value::Object(Map::new())),
            Value::Object(fields) if fields.contains_key("plugin") => {
                let mut args = fields.clone();
                let name = match args.remove("plugin") {
                    Some(Value::String(name)) => name,
                    other => {
                        return Err(PoolError::PluginConfig(format!(
                            "the plugin name must be a string, found {:?}",
                            other
                        )))
                    }
                };
                self.create(&name, ctx, &Value::Object(args))
            }
            Value::Object(fields) if fields.len() == 1 => match fields.iter().next() {
                Some((name, args @ Value::Object(_))) => self.create(name, ctx, args),
                _ => Err(PoolError::PluginConfig(
                    "the arguments of a plugin must be an object".to_string(),
                )),
            },
            other => Err(PoolError::PluginConfig(format!(
                "expected a plugin name, an object with a 'plugin' key, or an object \
                 with a single plugin name key; found {}",
                other
            ))),
        }
    }
}
