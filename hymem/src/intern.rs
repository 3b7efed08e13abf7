//! Interning cache
//!
//! Keeps one canonical instance per (policy, value) for values a policy
//! admits. Canonical instances hold a baseline reference owned by the cache
//! and are flagged permanent, so neither refcounting nor the cycle
//! collector ever frees them while the manager is alive.

use std::{cell::RefCell, ops::RangeInclusive};

use rustc_hash::FxHashMap;

use crate::{
    error::{MemError, MemResult},
    object::{gc_flags, ObjectHandle, TypeTag},
    MemoryManager,
};

/// Index of a registered [InternPolicy]
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct PolicyKey(pub u32);

impl PolicyKey {
    /// Key of [InternPolicy::small_ints] in a default [Config](crate::Config)
    pub const SMALL_INT: PolicyKey = PolicyKey(0);
    /// Key of [InternPolicy::empty_bytes] in a default [Config](crate::Config)
    pub const EMPTY_BYTES: PolicyKey = PolicyKey(1);
}

/// Which values a policy keeps canonical instances for
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Admission {
    /// Integers in the range
    IntRange(RangeInclusive<i64>),
    /// Zero-length byte sequences
    EmptyOnly,
    /// Byte sequences up to this length
    MaxLen(usize),
}

#[derive(Debug, Clone)]
pub struct InternPolicy {
    pub name: String,
    /// Type of the instances created for this policy
    pub type_tag: TypeTag,
    pub admits: Admission,
}

impl InternPolicy {
    pub fn small_ints() -> Self {
        Self {
            name: "small_int".to_string(),
            type_tag: TypeTag::OPAQUE,
            admits: Admission::IntRange(-5..=256),
        }
    }

    pub fn empty_bytes() -> Self {
        Self {
            name: "empty_bytes".to_string(),
            type_tag: TypeTag::OPAQUE,
            admits: Admission::EmptyOnly,
        }
    }

    fn admits(&self, value: &InternValue<'_>) -> bool {
        match (&self.admits, value) {
            (Admission::IntRange(range), InternValue::Int(x)) => range.contains(x),
            (Admission::EmptyOnly, InternValue::Bytes(b)) => b.is_empty(),
            (Admission::MaxLen(n), InternValue::Bytes(b)) => b.len() <= *n,
            _ => false,
        }
    }
}

/// Value to intern
///
/// Integers are stored as 8 little-endian bytes, byte sequences as-is.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum InternValue<'a> {
    Int(i64),
    Bytes(&'a [u8]),
}

impl InternValue<'_> {
    fn payload(&self) -> Vec<u8> {
        match self {
            InternValue::Int(x) => x.to_le_bytes().to_vec(),
            InternValue::Bytes(b) => b.to_vec(),
        }
    }

    fn key(&self) -> InternKey {
        match self {
            InternValue::Int(x) => InternKey::Int(*x),
            InternValue::Bytes(b) => InternKey::Bytes((*b).into()),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Hash)]
enum InternKey {
    Int(i64),
    Bytes(Box<[u8]>),
}

pub(crate) struct InternCache {
    policies: RefCell<Vec<InternPolicy>>,
    table: RefCell<FxHashMap<(PolicyKey, InternKey), ObjectHandle>>,
}

impl InternCache {
    pub(crate) fn new() -> Self {
        Self {
            policies: RefCell::new(Vec::new()),
            table: RefCell::new(FxHashMap::default()),
        }
    }

    pub(crate) fn register(&self, policy: InternPolicy) -> PolicyKey {
        let mut policies = self.policies.borrow_mut();
        let key = PolicyKey(policies.len() as u32);
        tracing::debug!(key = key.0, name = %policy.name, "registered intern policy");
        policies.push(policy);
        key
    }

    pub(crate) fn intern(
        &self,
        mm: &MemoryManager,
        policy_key: PolicyKey,
        value: InternValue<'_>,
    ) -> MemResult<ObjectHandle> {
        let (type_tag, admitted) = {
            let policies = self.policies.borrow();
            let policy = policies
                .get(policy_key.0 as usize)
                .ok_or(MemError::UnknownPolicy(policy_key.0))?;
            (policy.type_tag, policy.admits(&value))
        };

        if !admitted {
            return self.instantiate(mm, type_tag, &value);
        }

        let key = (policy_key, value.key());
        let cached = self.table.borrow().get(&key).copied();
        if let Some(obj) = cached {
            mm.incref(obj)?;
            return Ok(obj);
        }

        let obj = self.instantiate(mm, type_tag, &value)?;
        mm.header(obj)?.set_flag(gc_flags::PERMANENT);
        // the allocation reference becomes the cache's baseline
        mm.incref(obj)?;
        self.table.borrow_mut().insert(key, obj);
        tracing::trace!(policy = policy_key.0, ?value, ?obj, "new canonical instance");
        Ok(obj)
    }

    fn instantiate(
        &self,
        mm: &MemoryManager,
        type_tag: TypeTag,
        value: &InternValue<'_>,
    ) -> MemResult<ObjectHandle> {
        let payload = value.payload();
        let obj = mm.alloc(type_tag, payload.len())?;
        mm.write_bytes(obj, 0, &payload)?;
        Ok(obj)
    }

    pub(crate) fn len(&self) -> usize {
        self.table.borrow().len()
    }

    /// Give up every baseline reference
    ///
    /// Instances still referenced by the host stay alive, as ordinary
    /// objects.
    pub(crate) fn release_all(&self, mm: &MemoryManager) -> MemResult<()> {
        let entries: Vec<ObjectHandle> = self.table.borrow_mut().drain().map(|(_, v)| v).collect();
        let mut first_err = None;
        for obj in entries {
            let res = mm
                .header(obj)
                .map(|hdr| hdr.clear_flag(gc_flags::PERMANENT))
                .and_then(|_| mm.decref(obj));
            if let Err(e) = res {
                first_err.get_or_insert(e);
            }
        }
        first_err.map_or(Ok(()), Err)
    }
}
