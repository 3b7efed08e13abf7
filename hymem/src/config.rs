//! Tunables for a [MemoryManager](crate::MemoryManager)

use crate::intern::InternPolicy;

/// Automatic collection thresholds
///
/// - `t0`: net tracked allocations before a generation 0 pass
///   (0 turns automatic collection off entirely)
/// - `t1`: generation 0 passes before a generation 1 pass
/// - `t2`: generation 1 passes before a generation 2 pass
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Thresholds {
    pub t0: usize,
    pub t1: usize,
    pub t2: usize,
}

impl Thresholds {
    pub const fn new(t0: usize, t1: usize, t2: usize) -> Self {
        Self { t0, t1, t2 }
    }

    pub(crate) const fn as_array(self) -> [usize; 3] {
        [self.t0, self.t1, self.t2]
    }
}

impl Default for Thresholds {
    fn default() -> Self {
        Self::new(700, 10, 10)
    }
}

#[derive(Debug, Clone)]
pub struct Config {
    pub thresholds: Thresholds,
    /// Whether automatic (threshold triggered) collection starts enabled
    pub gc_enabled: bool,
    /// Number of completely empty arenas kept around instead of being
    /// handed back to the OS immediately
    pub retained_empty_arenas: usize,
    /// Upper bound on bytes requested from the OS (arenas + large objects)
    ///
    /// `None` means only the OS decides.
    pub memory_limit: Option<usize>,
    /// Interning policies, registered in order (the index is the
    /// [PolicyKey](crate::intern::PolicyKey))
    pub intern_policies: Vec<InternPolicy>,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            thresholds: Thresholds::default(),
            gc_enabled: true,
            retained_empty_arenas: 1,
            memory_limit: None,
            intern_policies: vec![InternPolicy::small_ints(), InternPolicy::empty_bytes()],
        }
    }
}

impl Config {
    pub fn with_thresholds(mut self, t0: usize, t1: usize, t2: usize) -> Self {
        self.thresholds = Thresholds::new(t0, t1, t2);
        self
    }

    pub fn with_gc_enabled(mut self, enabled: bool) -> Self {
        self.gc_enabled = enabled;
        self
    }

    pub fn with_retained_empty_arenas(mut self, n: usize) -> Self {
        self.retained_empty_arenas = n;
        self
    }

    pub fn with_memory_limit(mut self, limit: usize) -> Self {
        self.memory_limit = Some(limit);
        self
    }

    pub fn with_intern_policy(mut self, policy: InternPolicy) -> Self {
        self.intern_policies.push(policy);
        self
    }
}
