//! Identifier generation
//!
//! Every entity id (nodes, snapshots, branches) comes from an injected
//! [`IdGenerator`], so tests can swap random UUIDs for predictable ids.

use parking_lot::Mutex;
use uuid::Uuid;

/// Capability that hands out unique identifiers
pub trait IdGenerator: Send + Sync {
    /// Produce a new identifier, unique for the lifetime of the store
    fn next_id(&self) -> String;
}

/// Random UUID v4 identifiers
#[derive(Debug, Default, Clone, Copy)]
pub struct UuidGenerator;

impl IdGenerator for UuidGenerator {
    fn next_id(&self) -> String {
        Uuid::new_v4().to_string()
    }
}

/// Deterministic identifiers of the form `{prefix}-{n}`
///
/// # Examples
///
/// ```rust
/// use palimpsest::ids::{IdGenerator, SequentialIdGenerator};
///
/// let ids = SequentialIdGenerator::new("node");
/// assert_eq!(ids.next_id(), "node-1");
/// assert_eq!(ids.next_id(), "node-2");
/// ```
#[derive(Debug)]
pub struct SequentialIdGenerator {
    prefix: String,
    counter: Mutex<u64>,
}

impl SequentialIdGenerator {
    /// Create a generator with the given prefix, starting at 1
    pub fn new(prefix: impl Into<String>) -> Self {
        Self {
            prefix: prefix.into(),
            counter: Mutex::new(0),
        }
    }
}

impl IdGenerator for SequentialIdGenerator {
    fn next_id(&self) -> String {
        let mut counter = self.counter.lock();
        *counter += 1;
        format!("{}-{}", self.prefix, *counter)
    }
}
