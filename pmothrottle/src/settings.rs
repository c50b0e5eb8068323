use std::collections::HashMap;

/// Gives the initial capacity of an identity.
///
/// `None` means the identity is unknown, `Some(0)` that it is disabled.
pub trait CapacitySource: Send + Sync {
    fn capacity_for(&self, identity: &str) -> Option<usize>;
}

/// Static capacities: a default for every identity plus explicit overrides.
#[derive(Debug, Clone, Default)]
pub struct ThrottleSettings {
    default_capacity: Option<usize>,
    identities: HashMap<String, usize>,
}

impl ThrottleSettings {
    /// With `default_capacity == None`, only identities registered with
    /// [`ThrottleSettings::with_identity`] are admitted.
    pub fn new(default_capacity: Option<usize>) -> Self {
        Self {
            default_capacity,
            identities: HashMap::new(),
        }
    }

    pub fn with_identity(mut self, identity: impl Into<String>, capacity: usize) -> Self {
        self.identities.insert(identity.into(), capacity);
        self
    }

    pub fn with_identities<I, S>(mut self, identities: I) -> Self
    where
        I: IntoIterator<Item = (S, usize)>,
        S: Into<String>,
    {
        self.identities
            .extend(identities.into_iter().map(|(id, cap)| (id.into(), cap)));
        self
    }

    pub fn default_capacity(&self) -> Option<usize> {
        self.default_capacity
    }
}

impl CapacitySource for ThrottleSettings {
    fn capacity_for(&self, identity: &str) -> Option<usize> {
        self.identities
            .get(identity)
            .copied()
            .or(self.default_capacity)
    }
}
