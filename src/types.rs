use core::fmt;
use derive_more::{Display, From};
use indexmap::IndexMap as _IndexMap;
use rustc_hash::FxBuildHasher;

/// Unique identifier of a task; equal to the task's index in its graph.
#[derive(Debug, Display, Copy, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, From)]
#[display("#{_0}")]
#[repr(transparent)]
pub struct TaskId(pub u32);

impl TaskId {
    /// Index into the owning graph's task array.
    #[inline]
    #[must_use]
    pub const fn index(self) -> usize {
        self.0 as usize
    }
}

/// Selects the compute kernel a task runs, see
/// [`KernelRegistry`](crate::task::KernelRegistry).
#[derive(Debug, Display, Copy, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, From)]
#[repr(transparent)]
pub struct FuncId(pub u32);

/// Worker pool a task is bound to and a worker belongs to.
///
/// The discriminants are the values stored in the handshake `core_type` field.
#[derive(Debug, Display, Copy, Clone, PartialEq, Eq, Hash)]
#[repr(i32)]
pub enum CoreType {
    /// AIC: matrix ("cube") unit.
    #[display("cube")]
    Cube = 0,
    /// AIV: vector unit.
    #[display("vector")]
    Vector = 1,
}

impl CoreType {
    /// Both pools, in queue index order.
    pub const ALL: [Self; 2] = [Self::Cube, Self::Vector];

    /// Position of this pool's ready queue.
    #[inline]
    #[must_use]
    pub const fn index(self) -> usize {
        self as usize
    }

    /// Decodes the raw handshake value; anything but 0 and 1 is rejected.
    #[must_use]
    pub const fn from_raw(raw: i32) -> Option<Self> {
        match raw {
            0 => Some(Self::Cube),
            1 => Some(Self::Vector),
            _ => None,
        }
    }
}

/// Opaque task reference written into a handshake channel's `task` word.
///
/// `0` means "no task". Otherwise the low 32 bits hold `index + 1` and the high
/// 32 bits hold the generation tag of the graph that issued the handle, so a
/// handle left over from another graph never resolves.
#[derive(Copy, Clone, PartialEq, Eq, Hash, Default)]
#[repr(transparent)]
pub struct TaskHandle(u64);

impl TaskHandle {
    /// The "no task" sentinel.
    pub const NONE: Self = Self(0);

    pub(crate) const fn new(generation: u32, id: TaskId) -> Self {
        Self(((generation as u64) << 32) | (id.0 as u64 + 1))
    }

    /// Reinterprets a raw channel word.
    #[inline]
    #[must_use]
    pub const fn from_raw(raw: u64) -> Self {
        Self(raw)
    }

    /// Raw channel word.
    #[inline]
    #[must_use]
    pub const fn into_raw(self) -> u64 {
        self.0
    }

    #[inline]
    #[must_use]
    pub const fn is_none(self) -> bool {
        self.0 == 0
    }

    /// Generation tag and task id, or `None` for the sentinel.
    #[must_use]
    pub const fn decode(self) -> Option<(u32, TaskId)> {
        let low = self.0 as u32;
        if low == 0 {
            return None;
        }
        Some(((self.0 >> 32) as u32, TaskId(low - 1)))
    }
}

impl fmt::Debug for TaskHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.decode() {
            None => f.write_str("TaskHandle(none)"),
            Some((generation, id)) => write!(f, "TaskHandle({id}@{generation})"),
        }
    }
}

/// `IndexMap` type with fast hasher.
pub type IndexMap<K, V> = _IndexMap<K, V, FxBuildHasher>;
