use std::collections::BTreeSet;

/// Default file types every customer must deliver before a batch is complete.
///
/// Note: `type6` is intentionally absent here even though the validator's
/// column table knows it. See DESIGN.md.
pub const DEFAULT_EXPECTED_FILE_TYPES: [&str; 9] = [
    "type1", "type2", "type3", "type4", "type5", "type7", "type8", "type9", "type10",
];

/// Policy for which file types make a customer's batch complete.
///
/// Resolution must be deterministic and side-effect free; the tracker calls
/// it once per batch and replays decisions against the returned set.
pub trait ExpectedFileSetResolver: Send + Sync {
    fn resolve(&self, customer: &str) -> BTreeSet<String>;
}

/// Resolver returning the same fixed set for every customer.
///
/// Per-customer policies plug in by swapping the resolver implementation;
/// callers only see the trait.
#[derive(Debug, Clone)]
pub struct StaticResolver {
    file_types: BTreeSet<String>,
}

impl StaticResolver {
    pub fn new<I, S>(file_types: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self {
            file_types: file_types
                .into_iter()
                .map(|s| s.into().to_lowercase())
                .collect(),
        }
    }
}

impl Default for StaticResolver {
    fn default() -> Self {
        Self::new(DEFAULT_EXPECTED_FILE_TYPES)
    }
}

impl ExpectedFileSetResolver for StaticResolver {
    fn resolve(&self, _customer: &str) -> BTreeSet<String> {
        self.file_types.clone()
    }
}
