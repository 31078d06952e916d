//! Test methods
//!
//! A method is a named set of test functions. Selecting a method builds a
//! fresh [`FunctionRegistry`] for the dispatcher.

pub mod general;
pub mod olc_zhaga;

use std::sync::Arc;

use crate::common::{Error, Result};
use crate::dispatch::FunctionRegistry;

pub const OLC_ZHAGA_STD: &str = "OLC Zhaga STD";
pub const FIXTURE_SERVICE: &str = "Fixture service";

type MethodBuilder = Arc<dyn Fn(&str) -> Result<FunctionRegistry> + Send + Sync>;

/// Methods the operator can choose from, in menu order
#[derive(Clone, Default)]
pub struct MethodLibrary {
    methods: Vec<(String, MethodBuilder)>,
}

impl MethodLibrary {
    pub fn new() -> Self {
        Self::default()
    }

    /// Methods shipped with the fixture runner
    pub fn builtin() -> Self {
        Self::new()
            .with_method(OLC_ZHAGA_STD, olc_zhaga::registry)
            .with_method(FIXTURE_SERVICE, general::service_registry)
    }

    /// Add a method; a later method with the same name replaces the earlier one
    pub fn with_method<F>(mut self, name: &str, build: F) -> Self
    where
        F: Fn(&str) -> Result<FunctionRegistry> + Send + Sync + 'static,
    {
        self.methods.retain(|(n, _)| n != name);
        self.methods.push((name.to_string(), Arc::new(build)));
        self
    }

    pub fn names(&self) -> Vec<String> {
        self.methods.iter().map(|(n, _)| n.clone()).collect()
    }

    pub fn contains(&self, name: &str) -> bool {
        self.methods.iter().any(|(n, _)| n == name)
    }

    /// First method in menu order
    pub fn first(&self) -> Option<&str> {
        self.methods.first().map(|(n, _)| n.as_str())
    }

    /// Build the registry of a method
    pub fn build(&self, name: &str) -> Result<FunctionRegistry> {
        let (_, build) = self
            .methods
            .iter()
            .find(|(n, _)| n == name)
            .ok_or_else(|| Error::MethodNotFound(name.to_string()))?;
        build(name)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::dispatch::Classification;

    #[test]
    fn test_builtin_methods() {
        let library = MethodLibrary::builtin();
        assert_eq!(library.names(), vec![OLC_ZHAGA_STD, FIXTURE_SERVICE]);
        assert!(matches!(
            library.build("Nope"),
            Err(Error::MethodNotFound(_))
        ));
    }

    #[test]
    fn test_olc_zhaga_classification() {
        let registry = MethodLibrary::builtin().build(OLC_ZHAGA_STD).unwrap();
        assert_eq!(registry.method(), OLC_ZHAGA_STD);
        assert_eq!(registry.names()[0], "Full cycle testing");

        for name in ["Supply power to DUTs", "Power off DUTs", "Download Railtest", "Download Software"] {
            assert_eq!(registry.classify(name).unwrap(), Classification::Sequential, "{}", name);
        }
        for name in ["Detect DUTs", "Test DALI", "Check Testing Completion", "Full cycle testing"] {
            assert_eq!(
                registry.classify(name).unwrap(),
                Classification::PerChannelParallel,
                "{}",
                name
            );
        }
    }

    #[test]
    fn test_service_method_is_a_subset() {
        let library = MethodLibrary::builtin();
        let service = library.build(FIXTURE_SERVICE).unwrap();
        let full = library.build(OLC_ZHAGA_STD).unwrap();
        for name in service.names() {
            assert!(full.classify(&name).is_ok(), "{}", name);
        }
        assert!(service.classify("Full cycle testing").is_err());
    }
}
