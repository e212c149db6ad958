// Copyright 2023-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

//! Named catalog of gathering tasks.

use crate::error::GatherError;
use crate::record::Record;
use futures::future::BoxFuture;
use std::collections::BTreeMap;
use std::future::Future;
use std::sync::Arc;
use tokio_util::sync::CancellationToken;
use tracing::warn;

/// Selects every registered task.
pub const ALL_TASKS: &str = "all";

/// What a task hands back: its records and the problems it ran into.
pub type GatherOutput = (Vec<Record>, Vec<GatherError>);

pub type GatherClosure =
    Arc<dyn Fn(CancellationToken) -> BoxFuture<'static, GatherOutput> + Send + Sync>;

#[derive(Clone)]
pub struct GatheringFunction {
    pub name: String,
    pub run: GatherClosure,
    /// Errors of a task that can fail never fail the whole run.
    pub can_fail: bool,
}

impl GatheringFunction {
    fn new<F, Fut>(name: impl Into<String>, can_fail: bool, f: F) -> Self
    where
        F: Fn(CancellationToken) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = GatherOutput> + Send + 'static,
    {
        GatheringFunction {
            name: name.into(),
            run: Arc::new(move |token| -> BoxFuture<'static, GatherOutput> {
                Box::pin(f(token))
            }),
            can_fail,
        }
    }

    pub fn important<F, Fut>(name: impl Into<String>, f: F) -> Self
    where
        F: Fn(CancellationToken) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = GatherOutput> + Send + 'static,
    {
        GatheringFunction::new(name, false, f)
    }

    pub fn failable<F, Fut>(name: impl Into<String>, f: F) -> Self
    where
        F: Fn(CancellationToken) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = GatherOutput> + Send + 'static,
    {
        GatheringFunction::new(name, true, f)
    }
}

impl std::fmt::Debug for GatheringFunction {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("GatheringFunction")
            .field("name", &self.name)
            .field("can_fail", &self.can_fail)
            .finish()
    }
}

#[derive(Debug, Clone, Default)]
pub struct Registry {
    functions: BTreeMap<String, GatheringFunction>,
}

impl Registry {
    pub fn new() -> Self {
        Registry::default()
    }

    pub fn register(&mut self, function: GatheringFunction) {
        if let Some(previous) = self.functions.insert(function.name.clone(), function) {
            warn!("gathering function {} registered twice", previous.name);
        }
    }

    pub fn get(&self, name: &str) -> Option<&GatheringFunction> {
        self.functions.get(name)
    }

    pub fn len(&self) -> usize {
        self.functions.len()
    }

    pub fn is_empty(&self) -> bool {
        self.functions.is_empty()
    }

    /// Registered names in ascending order.
    pub fn names(&self) -> impl Iterator<Item = &str> {
        self.functions.keys().map(String::as_str)
    }

    /// Keeps only the functions named in `allowed`.
    pub fn filter<S: AsRef<str>>(&self, allowed: &[S]) -> Registry {
        let functions = self
            .functions
            .iter()
            .filter(|(name, _)| allowed.iter().any(|a| a.as_ref() == name.as_str()))
            .map(|(name, function)| (name.clone(), function.clone()))
            .collect();
        Registry { functions }
    }

    /// Maps requested names to functions.
    ///
    /// [`ALL_TASKS`] selects everything. Unknown names are returned separately;
    /// repeated names run once.
    pub fn resolve<S: AsRef<str>>(&self, names: &[S]) -> (Vec<GatheringFunction>, Vec<String>) {
        if names.iter().any(|n| n.as_ref() == ALL_TASKS) {
            return (self.functions.values().cloned().collect(), Vec::new());
        }

        let mut selected: Vec<GatheringFunction> = Vec::new();
        let mut unknown = Vec::new();
        for name in names {
            let name = name.as_ref();
            if selected.iter().any(|f| f.name == name) || unknown.iter().any(|u| u == name) {
                continue;
            }
            match self.functions.get(name) {
                Some(function) => selected.push(function.clone()),
                None => unknown.push(name.to_string()),
            }
        }
        (selected, unknown)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::record::Raw;

    fn registry() -> Registry {
        let mut registry = Registry::new();
        registry.register(GatheringFunction::important("version", |_| async {
            (vec![Record::new("config/version", Raw("4.6".into()))], Vec::new())
        }));
        registry.register(GatheringFunction::failable("metrics", |_| async {
            (Vec::new(), vec![GatherError::Warning("no alerts".into())])
        }));
        registry.register(GatheringFunction::important("nodes", |_| async {
            (Vec::new(), Vec::new())
        }));
        registry
    }

    fn names(functions: &[GatheringFunction]) -> Vec<&str> {
        functions.iter().map(|f| f.name.as_str()).collect()
    }

    #[test]
    fn test_all_selects_every_function_in_name_order() {
        let (selected, unknown) = registry().resolve(&["nodes", ALL_TASKS]);
        assert_eq!(names(&selected), vec!["metrics", "nodes", "version"]);
        assert!(unknown.is_empty());
    }

    #[test]
    fn test_unknown_names_are_reported() {
        let (selected, unknown) = registry().resolve(&["version", "nope", "version", "nope"]);
        assert_eq!(names(&selected), vec!["version"]);
        assert_eq!(unknown, vec!["nope"]);
    }

    #[test]
    fn test_filter_and_lookup() {
        let registry = registry().filter(&["metrics", "missing"]);
        assert_eq!(registry.len(), 1);
        let metrics = registry.get("metrics").expect("metrics is kept");
        assert!(metrics.can_fail);
        assert!(registry.get("version").is_none());
    }

    #[tokio::test]
    async fn test_closures_run_with_the_token() {
        let registry = registry();
        let version = registry.get("version").expect("registered");
        let (records, errors) = (version.run)(CancellationToken::new()).await;
        assert_eq!(records.len(), 1);
        assert!(errors.is_empty());
        assert!(!version.can_fail);
    }
}
