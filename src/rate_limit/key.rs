//! Parameter-inclusive storage keys.
//!
//! A caller that reuses a logical key with different limits gets a separate bucket
//! instead of reinterpreting state written under the old limits.

use std::fmt;

use super::params::BucketParams;

/// The key a bucket's state is persisted under.
///
/// Layout: `<key>.max=<capacity>.rd=<interval secs>.ra=<refill amount>`. The numeric
/// suffixes are digit-only and always last, so the layout parses uniquely from the
/// right and distinct parameter tuples never share a key.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct StorageKey(String);

impl StorageKey {
    pub fn as_str(&self) -> &str {
        &self.0
    }

    pub fn into_string(self) -> String {
        self.0
    }
}

impl From<&BucketParams> for StorageKey {
    fn from(params: &BucketParams) -> Self {
        StorageKey(format!(
            "{}.max={}.rd={}.ra={}",
            params.key,
            params.capacity,
            params.refill_interval.as_secs(),
            params.refill_amount
        ))
    }
}

impl fmt::Display for StorageKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl AsRef<str> for StorageKey {
    fn as_ref(&self) -> &str {
        &self.0
    }
}
