//! KF-004: Variable store: concurrent cache of rendered block results.
//!
//! A map guarded by a read/write lock. Change callbacks fire synchronously
//! after the map mutation, outside the lock.

use super::error::{Error, Result};
use super::types::{Value, Variable};
use rustc_hash::FxHashMap;
use std::sync::{Arc, RwLock, RwLockReadGuard, RwLockWriteGuard};

/// A change observed by store callbacks.
#[derive(Debug, Clone, PartialEq)]
pub enum StoreEvent {
    Added { name: String, variable: Variable },
    Updated { name: String, variable: Variable },
    Deleted { name: String },
}

impl StoreEvent {
    pub fn name(&self) -> &str {
        match self {
            Self::Added { name, .. } | Self::Updated { name, .. } | Self::Deleted { name } => name,
        }
    }
}

type Callback = Arc<dyn Fn(&StoreEvent) + Send + Sync>;

/// Block name → stored result.
#[derive(Default)]
pub struct Store {
    vars: RwLock<FxHashMap<String, Variable>>,
    callbacks: RwLock<Vec<Callback>>,
}

impl std::fmt::Debug for Store {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Store").field("vars", &self.list()).finish()
    }
}

impl Store {
    pub fn new() -> Self {
        Self::default()
    }

    // A poisoned lock only means a writer panicked mid-call; the map itself
    // is always left consistent, so keep serving it.
    fn read(&self) -> RwLockReadGuard<'_, FxHashMap<String, Variable>> {
        self.vars.read().unwrap_or_else(|e| e.into_inner())
    }

    fn write(&self) -> RwLockWriteGuard<'_, FxHashMap<String, Variable>> {
        self.vars.write().unwrap_or_else(|e| e.into_inner())
    }

    /// Register a change observer.
    pub fn on_change(&self, callback: impl Fn(&StoreEvent) + Send + Sync + 'static) {
        self.callbacks
            .write()
            .unwrap_or_else(|e| e.into_inner())
            .push(Arc::new(callback));
    }

    fn notify(&self, event: StoreEvent) {
        let callbacks = self
            .callbacks
            .read()
            .unwrap_or_else(|e| e.into_inner())
            .clone();
        for cb in callbacks {
            cb(&event);
        }
    }

    pub fn get(&self, name: &str) -> Result<Variable> {
        self.read()
            .get(name)
            .cloned()
            .ok_or_else(|| Error::VariableNotFound(name.to_string()))
    }

    pub fn contains(&self, name: &str) -> bool {
        self.read().contains_key(name)
    }

    /// Insert a new variable; fails if the name is already present.
    pub fn add(&self, name: &str, variable: Variable) -> Result<()> {
        {
            let mut vars = self.write();
            if vars.contains_key(name) {
                return Err(Error::DuplicateVariable(name.to_string()));
            }
            vars.insert(name.to_string(), variable.clone());
        }
        self.notify(StoreEvent::Added {
            name: name.to_string(),
            variable,
        });
        Ok(())
    }

    /// Create or replace a variable. No notification when the value is unchanged.
    pub fn upsert(&self, name: &str, variable: Variable) {
        let previous = self.write().insert(name.to_string(), variable.clone());
        let event = match previous {
            Some(old) if old == variable => return,
            Some(_) => StoreEvent::Updated {
                name: name.to_string(),
                variable,
            },
            None => StoreEvent::Added {
                name: name.to_string(),
                variable,
            },
        };
        self.notify(event);
    }

    /// Snapshot of every stored variable.
    pub fn list(&self) -> FxHashMap<String, Variable> {
        self.read().clone()
    }

    pub fn delete(&self, name: &str) {
        let removed = self.write().remove(name);
        if removed.is_some() {
            self.notify(StoreEvent::Deleted {
                name: name.to_string(),
            });
        }
    }

    /// Commit a variable with `total` empty instance slots in one step.
    /// Must run before any instance of the vertex writes.
    pub fn reserve(&self, name: &str, total: usize) {
        self.upsert(name, Variable::sized(total));
    }

    /// Commit a variable with no keys; instance writes size each key lazily
    /// under the lock (used for module outputs whose keys are not known up front).
    pub fn reserve_keyed(&self, name: &str) {
        self.upsert(name, Variable::default());
    }

    /// Write one loop instance's slot. A missing variable or key is created
    /// with `total` slots under the same lock; sibling slots are never touched.
    pub fn set_instance(
        &self,
        name: &str,
        key: &str,
        index: usize,
        total: usize,
        value: Value,
    ) -> Result<()> {
        if index >= total {
            return Err(Error::Graph(format!(
                "instance index {} out of range for {} with {} instances",
                index, name, total
            )));
        }
        let (snapshot, existed) = {
            let mut vars = self.write();
            let existed = vars.contains_key(name);
            let variable = vars.entry(name.to_string()).or_default();
            let slots = variable
                .data
                .entry(key.to_string())
                .or_insert_with(|| vec![Value::Null; total]);
            if slots.len() < total {
                slots.resize(total, Value::Null);
            }
            if slots[index] == value && existed {
                return Ok(());
            }
            slots[index] = value;
            (variable.clone(), existed)
        };
        let event = if existed {
            StoreEvent::Updated {
                name: name.to_string(),
                variable: snapshot,
            }
        } else {
            StoreEvent::Added {
                name: name.to_string(),
                variable: snapshot,
            }
        };
        self.notify(event);
        Ok(())
    }
}
