//! Memory types classify what an allocation is used for, and a
//! [`FreeListMap`] decides which free list (if any) each type draws from.

use std::fmt;

use crate::core::error::VfdError;

/// The intended use of a block of file space.
#[derive(Copy, Clone, Debug, PartialEq, Eq, Hash, PartialOrd, Ord)]
#[repr(u8)]
pub enum MemType {
    Default = 0,
    Super = 1,
    Btree = 2,
    /// Raw data. Never cached by the metadata accumulator and aggregated
    /// separately from everything else.
    Draw = 3,
    Gheap = 4,
    Lheap = 5,
    Ohdr = 6,
}

impl MemType {
    /// Number of memory types.
    pub const COUNT: usize = 7;

    /// Every memory type, in index order.
    pub const ALL: [MemType; MemType::COUNT] = [
        MemType::Default,
        MemType::Super,
        MemType::Btree,
        MemType::Draw,
        MemType::Gheap,
        MemType::Lheap,
        MemType::Ohdr,
    ];

    #[inline]
    pub fn index(self) -> usize {
        self as usize
    }

    /// Whether this type describes raw data rather than metadata.
    #[inline]
    pub fn is_raw(self) -> bool {
        self == MemType::Draw
    }
}

impl TryFrom<u8> for MemType {
    type Error = VfdError;

    fn try_from(value: u8) -> Result<Self, Self::Error> {
        MemType::ALL
            .get(value as usize)
            .copied()
            .ok_or_else(|| VfdError::InvalidArgument(format!("bad memory type {value}").into()))
    }
}

impl fmt::Display for MemType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            MemType::Default => "default",
            MemType::Super => "super",
            MemType::Btree => "btree",
            MemType::Draw => "draw",
            MemType::Gheap => "gheap",
            MemType::Lheap => "lheap",
            MemType::Ohdr => "ohdr",
        };
        f.write_str(name)
    }
}

/// Where frees of a given memory type go.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum ListTarget {
    /// The type keeps its own free list.
    Own,
    /// The type shares the free list of another type.
    Shared(MemType),
    /// The type is excluded from free-list accounting.
    NoList,
}

/// Maps every [`MemType`] to the free list it allocates from and frees into.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub struct FreeListMap {
    targets: [ListTarget; MemType::COUNT],
}

impl FreeListMap {
    /// Every type owns a private free list.
    pub const fn per_type() -> Self {
        FreeListMap {
            targets: [ListTarget::Own; MemType::COUNT],
        }
    }

    /// All types share a single free list.
    pub const fn single() -> Self {
        FreeListMap {
            targets: [ListTarget::Shared(MemType::Super); MemType::COUNT],
        }
    }

    /// Raw data uses one free list, all metadata another.
    pub const fn dichotomy() -> Self {
        let mut targets = [ListTarget::Shared(MemType::Super); MemType::COUNT];
        targets[MemType::Draw as usize] = ListTarget::Shared(MemType::Draw);
        FreeListMap { targets }
    }

    /// No type keeps a free list; freed space goes to the driver or is leaked.
    pub const fn no_list() -> Self {
        FreeListMap {
            targets: [ListTarget::NoList; MemType::COUNT],
        }
    }

    /// Overrides the target of one memory type.
    pub const fn with(mut self, ty: MemType, target: ListTarget) -> Self {
        self.targets[ty as usize] = target;
        self
    }

    /// Returns the free list bucket for `ty`, or `None` if `ty` keeps none.
    pub fn resolve(&self, ty: MemType) -> Option<MemType> {
        match self.targets[ty.index()] {
            ListTarget::Own => Some(ty),
            ListTarget::Shared(bucket) => Some(bucket),
            ListTarget::NoList => None,
        }
    }
}

impl Default for FreeListMap {
    fn default() -> Self {
        FreeListMap::per_type()
    }
}
