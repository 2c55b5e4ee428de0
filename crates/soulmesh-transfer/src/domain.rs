//! Backend/domain gating. A hard filter, never a score penalty.

use std::collections::HashMap;

use soulmesh_discovery::{ContentDomain, SourceBackend};

#[derive(Debug, Clone)]
pub struct DomainGate {
    /// Backends listed here serve only the given domains. Unlisted
    /// backends serve every domain.
    restricted: HashMap<SourceBackend, Vec<ContentDomain>>,
}

impl Default for DomainGate {
    fn default() -> Self {
        let mut restricted = HashMap::new();
        restricted.insert(SourceBackend::Soulseek, vec![ContentDomain::Music]);
        Self { restricted }
    }
}

impl DomainGate {
    /// No restrictions at all.
    pub fn open() -> Self {
        Self {
            restricted: HashMap::new(),
        }
    }

    pub fn restrict(mut self, backend: SourceBackend, domains: Vec<ContentDomain>) -> Self {
        self.restricted.insert(backend, domains);
        self
    }

    pub fn allows(&self, backend: SourceBackend, domain: ContentDomain) -> bool {
        self.restricted
            .get(&backend)
            .map_or(true, |domains| domains.contains(&domain))
    }
}
