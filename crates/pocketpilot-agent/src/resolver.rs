use std::collections::HashMap;

/// Collaborator mapping human app names to package ids. The app-scanning
/// side lives outside the core; the loop only consumes the lookup.
pub trait AppResolver: Send + Sync {
    fn resolve(&self, name: &str) -> Option<String>;
}

/// Fixed name→package map. Lookups are case-insensitive.
#[derive(Debug, Default, Clone)]
pub struct StaticAppResolver {
    packages: HashMap<String, String>,
}

impl StaticAppResolver {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert(&mut self, name: impl Into<String>, package: impl Into<String>) {
        self.packages
            .insert(name.into().to_lowercase(), package.into());
    }

    pub fn with(mut self, name: impl Into<String>, package: impl Into<String>) -> Self {
        self.insert(name, package);
        self
    }
}

impl AppResolver for StaticAppResolver {
    fn resolve(&self, name: &str) -> Option<String> {
        self.packages.get(&name.to_lowercase()).cloned()
    }
}
