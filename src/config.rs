//! Typed configuration registry.
//!
//! A [`ConfigVar<T>`] is a named, described, process-global setting. The
//! first [`lookup`] for a name registers the variable with its default;
//! later lookups return the same live handle, so every part of the program
//! observes the same value. Values are (de)serialized through serde, which
//! also powers [`load`], which applies a whole JSON document (as produced by a
//! deployment tool or a config file reader) onto the registered variables.
//!
//! Example:
//! ```
//! use filament::config;
//!
//! let keepalive = config::lookup("net.keepalive", true, "enable keepalives").unwrap();
//! assert!(keepalive.value());
//! keepalive.add_listener(|old, new| {
//!     println!("keepalive changed: {} -> {}", old, new);
//! });
//! keepalive.set(false);
//! assert!(!keepalive.value());
//! ```

use std::any::Any;
use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, RwLock};

use once_cell::sync::Lazy;
use serde::de::DeserializeOwned;
use serde::Serialize;

use crate::error::{Error, Result};
use crate::util;

/// Bound on the value types a [`ConfigVar`] can hold.
///
/// Blanket-implemented; any serde-serializable, comparable, thread-safe
/// value qualifies.
pub trait ConfigValue:
    Clone + PartialEq + Send + Sync + Serialize + DeserializeOwned + 'static
{
}

impl<T> ConfigValue for T where
    T: Clone + PartialEq + Send + Sync + Serialize + DeserializeOwned + 'static
{
}

type Listener<T> = Box<dyn Fn(&T, &T) + Send + Sync>;

////////////////////////////////////////////////////////////////////////////////
// ConfigVar
////////////////////////////////////////////////////////////////////////////////

/// A live handle to one configuration variable.
pub struct ConfigVar<T> {
    name: String,
    description: String,
    value: RwLock<T>,
    listeners: Mutex<HashMap<u64, Listener<T>>>,
    next_listener_id: AtomicU64,
}

impl<T: ConfigValue + std::fmt::Debug> std::fmt::Debug for ConfigVar<T> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ConfigVar")
            .field("name", &self.name)
            .field("description", &self.description)
            .field("value", &*self.value.read().unwrap())
            .finish()
    }
}

impl<T: ConfigValue> ConfigVar<T> {
    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn description(&self) -> &str {
        &self.description
    }

    /// Returns a clone of the current value.
    pub fn value(&self) -> T {
        self.read_lock().clone()
    }

    /// Replaces the current value.
    ///
    /// Registered listeners are invoked with `(old, new)`, but only when
    /// the value actually changed.
    pub fn set(&self, value: T) {
        let old = {
            let mut current = self
                .value
                .write()
                .unwrap_or_else(|_| util::fatal("config value lock poisoned"));
            if *current == value {
                return;
            }
            let old = current.clone();
            *current = value.clone();
            old
        };

        let listeners = self
            .listeners
            .lock()
            .unwrap_or_else(|_| util::fatal("config listener lock poisoned"));
        for listener in listeners.values() {
            listener(&old, &value);
        }
    }

    /// Registers a change callback and returns its id for
    /// [`remove_listener`](Self::remove_listener).
    pub fn add_listener(&self, listener: impl Fn(&T, &T) + Send + Sync + 'static) -> u64 {
        let id = self.next_listener_id.fetch_add(1, Ordering::Relaxed);
        self.listeners
            .lock()
            .unwrap_or_else(|_| util::fatal("config listener lock poisoned"))
            .insert(id, Box::new(listener));
        id
    }

    pub fn remove_listener(&self, id: u64) {
        self.listeners
            .lock()
            .unwrap_or_else(|_| util::fatal("config listener lock poisoned"))
            .remove(&id);
    }

    /// Serializes the current value to a JSON string.
    pub fn to_json(&self) -> Result<String> {
        Ok(serde_json::to_string(&self.value())?)
    }

    /// Parses `raw` as JSON and makes it the current value.
    pub fn set_from_json(&self, raw: &str) -> Result<()> {
        let value: T = serde_json::from_str(raw)?;
        self.set(value);
        Ok(())
    }

    fn read_lock(&self) -> std::sync::RwLockReadGuard<'_, T> {
        self.value
            .read()
            .unwrap_or_else(|_| util::fatal("config value lock poisoned"))
    }
}

// Type-erased view of a registered variable, so the registry can apply
// document values without knowing T.
trait VarBase: Send + Sync {
    fn type_name(&self) -> &'static str;
    fn apply_json(&self, value: &serde_json::Value) -> Result<()>;
    fn as_any(self: Arc<Self>) -> Arc<dyn Any + Send + Sync>;
}

impl<T: ConfigValue> VarBase for ConfigVar<T> {
    fn type_name(&self) -> &'static str {
        std::any::type_name::<T>()
    }

    fn apply_json(&self, value: &serde_json::Value) -> Result<()> {
        let value: T = serde_json::from_value(value.clone())?;
        self.set(value);
        Ok(())
    }

    fn as_any(self: Arc<Self>) -> Arc<dyn Any + Send + Sync> {
        self
    }
}

////////////////////////////////////////////////////////////////////////////////
// Registry
////////////////////////////////////////////////////////////////////////////////

static REGISTRY: Lazy<RwLock<HashMap<String, Arc<dyn VarBase>>>> = Lazy::new(Default::default);

fn valid_name(name: &str) -> bool {
    !name.is_empty()
        && name
            .bytes()
            .all(|b| b.is_ascii_lowercase() || b.is_ascii_digit() || b == b'.' || b == b'_')
}

/// Looks a variable up by name, registering it with `default` on first use.
///
/// Returns `None` (after logging the reason) when the name is invalid or the
/// variable was already registered with a different type. Callers needing the
/// precise failure use [`try_lookup`].
pub fn lookup<T: ConfigValue>(
    name: &str,
    default: T,
    description: &str,
) -> Option<Arc<ConfigVar<T>>> {
    match try_lookup(name, default, description) {
        Ok(var) => Some(var),
        Err(error) => {
            log::error!("config: {}", error);
            None
        }
    }
}

/// Same as [`lookup`], with the failure reason in the error channel.
pub fn try_lookup<T: ConfigValue>(
    name: &str,
    default: T,
    description: &str,
) -> Result<Arc<ConfigVar<T>>> {
    let name = name.to_lowercase();
    if !valid_name(&name) {
        return Err(Error::InvalidConfigName(name));
    }

    let mut registry = REGISTRY
        .write()
        .unwrap_or_else(|_| util::fatal("config registry lock poisoned"));

    if let Some(existing) = registry.get(&name) {
        let type_name = existing.type_name();
        return match Arc::clone(existing).as_any().downcast::<ConfigVar<T>>() {
            Ok(var) => Ok(var),
            Err(_) => Err(Error::ConfigTypeMismatch { name, type_name }),
        };
    }

    let var = Arc::new(ConfigVar {
        name: name.clone(),
        description: description.to_string(),
        value: RwLock::new(default),
        listeners: Mutex::new(HashMap::new()),
        next_listener_id: AtomicU64::new(0),
    });
    registry.insert(name, Arc::clone(&var) as Arc<dyn VarBase>);
    Ok(var)
}

/// Returns the variable registered under `name`, if any.
pub fn get<T: ConfigValue>(name: &str) -> Option<Arc<ConfigVar<T>>> {
    let registry = REGISTRY
        .read()
        .unwrap_or_else(|_| util::fatal("config registry lock poisoned"));
    let var = registry.get(&name.to_lowercase())?;
    Arc::clone(var).as_any().downcast::<ConfigVar<T>>().ok()
}

/// Applies a JSON document onto the registered variables.
///
/// Nested objects flatten into dotted names: `{"fiber": {"stack_size": N}}`
/// reaches the variable `fiber.stack_size`. Names that were never registered
/// are skipped; values that do not deserialize into the variable's type are
/// reported and skipped.
pub fn load(document: &serde_json::Value) {
    let mut entries = Vec::new();
    flatten("", document, &mut entries);

    let registry = REGISTRY
        .read()
        .unwrap_or_else(|_| util::fatal("config registry lock poisoned"));
    for (name, value) in entries {
        if let Some(var) = registry.get(&name) {
            if let Err(error) = var.apply_json(value) {
                log::error!("config: failed to apply '{}': {}", name, error);
            }
        }
    }
}

fn flatten<'a>(
    prefix: &str,
    node: &'a serde_json::Value,
    out: &mut Vec<(String, &'a serde_json::Value)>,
) {
    if !prefix.is_empty() {
        out.push((prefix.to_string(), node));
    }
    if let serde_json::Value::Object(map) = node {
        for (key, value) in map {
            let key = key.to_lowercase();
            let child = if prefix.is_empty() {
                key
            } else {
                format!("{}.{}", prefix, key)
            };
            if valid_name(&child) {
                flatten(&child, value, out);
            } else {
                log::error!("config: skipping invalid name '{}' in document", child);
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn names_are_validated() {
        assert!(valid_name("fiber.stack_size"));
        assert!(valid_name("a_1.b_2"));
        assert!(!valid_name(""));
        assert!(!valid_name("spaced name"));
        assert!(!valid_name("dash-ed"));
    }

    #[test]
    fn lookup_is_case_insensitive() {
        let a = lookup::<u32>("tests.config.case", 1, "").unwrap();
        let b = lookup::<u32>("Tests.Config.CASE", 5, "").unwrap();
        assert!(Arc::ptr_eq(&a, &b));
        // the default of the first registration wins
        assert_eq!(b.value(), 1);
    }
}
