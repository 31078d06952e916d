//! Test function registry
//!
//! Maps function names to their executable body and classification. A
//! registry is built once per method selection and replaced wholesale.

use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};

use super::FixtureContext;
use crate::channel::ChannelFunction;
use crate::common::{Error, Result};

/// How a function is executed
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Classification {
    /// Once, on the coordinating context, holding the shared fixture resource
    Sequential,
    /// Once per active channel, joined by the completion barrier
    PerChannelParallel,
}

impl std::fmt::Display for Classification {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Classification::Sequential => write!(f, "sequential"),
            Classification::PerChannelParallel => write!(f, "parallel"),
        }
    }
}

/// Body of a sequential function; reaches channels through the fixture context
#[async_trait]
pub trait SequentialFunction: Send + Sync {
    async fn run(&self, fixture: &mut FixtureContext<'_>) -> Result<()>;
}

#[derive(Clone)]
pub enum FunctionKind {
    Sequential(Arc<dyn SequentialFunction>),
    Parallel(Arc<dyn ChannelFunction>),
}

impl FunctionKind {
    pub fn classification(&self) -> Classification {
        match self {
            FunctionKind::Sequential(_) => Classification::Sequential,
            FunctionKind::Parallel(_) => Classification::PerChannelParallel,
        }
    }
}

#[derive(Clone)]
pub struct FunctionDescriptor {
    pub name: String,
    pub kind: FunctionKind,
}

/// Name and classification, as shown to the operator
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FunctionInfo {
    pub name: String,
    pub classification: Classification,
}

/// Functions of one test method, in registration order
pub struct FunctionRegistry {
    method: String,
    functions: Vec<FunctionDescriptor>,
    index: HashMap<String, usize>,
}

impl FunctionRegistry {
    pub fn new(method: impl Into<String>) -> Self {
        Self {
            method: method.into(),
            functions: Vec::new(),
            index: HashMap::new(),
        }
    }

    /// Registry with no method selected
    pub fn empty() -> Self {
        Self::new("")
    }

    pub fn method(&self) -> &str {
        &self.method
    }

    pub fn len(&self) -> usize {
        self.functions.len()
    }

    pub fn is_empty(&self) -> bool {
        self.functions.is_empty()
    }

    /// Add a function; names are unique within a method
    pub fn register(&mut self, name: &str, kind: FunctionKind) -> Result<()> {
        if self.index.contains_key(name) {
            return Err(Error::Internal(format!(
                "function '{}' registered twice in method '{}'",
                name, self.method
            )));
        }
        self.index.insert(name.to_string(), self.functions.len());
        self.functions.push(FunctionDescriptor {
            name: name.to_string(),
            kind,
        });
        Ok(())
    }

    pub fn sequential(&mut self, name: &str, function: impl SequentialFunction + 'static) -> Result<()> {
        self.register(name, FunctionKind::Sequential(Arc::new(function)))
    }

    pub fn parallel(&mut self, name: &str, function: impl ChannelFunction + 'static) -> Result<()> {
        self.register(name, FunctionKind::Parallel(Arc::new(function)))
    }

    pub fn resolve(&self, name: &str) -> Result<&FunctionDescriptor> {
        self.index
            .get(name)
            .map(|i| &self.functions[*i])
            .ok_or_else(|| Error::function_not_found(name, &self.method))
    }

    pub fn classify(&self, name: &str) -> Result<Classification> {
        self.resolve(name).map(|d| d.kind.classification())
    }

    pub fn names(&self) -> Vec<String> {
        self.functions.iter().map(|f| f.name.clone()).collect()
    }

    pub fn describe(&self) -> Vec<FunctionInfo> {
        self.functions
            .iter()
            .map(|f| FunctionInfo {
                name: f.name.clone(),
                classification: f.kind.classification(),
            })
            .collect()
    }
}
