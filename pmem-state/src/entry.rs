//! The typed view of log slots.
use core::fmt;

/// Reference to a slot of the log arena.
///
/// The generation is compared on every access so that a handle to a slot which was freed, and
/// possibly reused, in the meantime is detected instead of read as if it still were the same
/// entry. Packed as `generation << 32 | index`. Index `0` is the region header so the packed value
/// `0` is never a valid entry and represents the null handle.
#[derive(Clone, Copy, Default, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct Handle {
    pub index: u32,
    pub generation: u32,
}

impl Handle {
    pub const NULL: Handle = Handle { index: 0, generation: 0 };

    pub fn is_null(self) -> bool {
        self.index == 0
    }

    pub fn to_word(self) -> u64 {
        u64::from(self.generation) << 32 | u64::from(self.index)
    }

    pub fn from_word(word: u64) -> Self {
        Handle {
            index: word as u32,
            generation: (word >> 32) as u32,
        }
    }

    /// `None` for the null handle.
    pub fn non_null(self) -> Option<Self> {
        if self.is_null() {
            None
        } else {
            Some(self)
        }
    }
}

impl fmt::Debug for Handle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.is_null() {
            f.write_str("Handle(null)")
        } else {
            write!(f, "Handle({}@{})", self.index, self.generation)
        }
    }
}

/// The kind of a log entry.
#[repr(u8)]
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum EntryKind {
    Acquire = 1,
    RdLock = 2,
    WrLock = 3,
    BeginDurable = 4,
    Release = 5,
    Unlock = 6,
    EndDurable = 7,
    Store = 8,
    Memset = 9,
    Memcpy = 10,
    Memmove = 11,
}

impl EntryKind {
    pub fn from_tag(tag: u8) -> Option<Self> {
        Some(match tag {
            1 => EntryKind::Acquire,
            2 => EntryKind::RdLock,
            3 => EntryKind::WrLock,
            4 => EntryKind::BeginDurable,
            5 => EntryKind::Release,
            6 => EntryKind::Unlock,
            7 => EntryKind::EndDurable,
            8 => EntryKind::Store,
            9 => EntryKind::Memset,
            10 => EntryKind::Memcpy,
            11 => EntryKind::Memmove,
            _ => return None,
        })
    }

    pub fn tag(self) -> u8 {
        self as u8
    }

    /// Entries opening a (possibly nested) section.
    pub fn is_start_section(self) -> bool {
        matches!(
            self,
            EntryKind::Acquire | EntryKind::RdLock | EntryKind::WrLock | EntryKind::BeginDurable
        )
    }

    pub fn is_end_section(self) -> bool {
        matches!(
            self,
            EntryKind::Release | EntryKind::Unlock | EntryKind::EndDurable
        )
    }

    /// Lock acquisitions, whose value is the release they observed.
    pub fn is_acquire(self) -> bool {
        matches!(self, EntryKind::Acquire | EntryKind::RdLock | EntryKind::WrLock)
    }

    /// Lock releases, registered as the last release of their lock.
    pub fn is_release(self) -> bool {
        matches!(self, EntryKind::Release | EntryKind::Unlock)
    }

    pub fn is_memop(self) -> bool {
        matches!(self, EntryKind::Memset | EntryKind::Memcpy | EntryKind::Memmove)
    }

    /// Whether the value word is the head of a data chain.
    pub fn has_data(self) -> bool {
        matches!(self, EntryKind::Memcpy | EntryKind::Memmove)
    }

    pub fn is_store_like(self) -> bool {
        self == EntryKind::Store || self.is_memop()
    }
}

/// An address within a persistent region.
///
/// The region id occupies the top 16 bits, the byte offset within the region the lower 48.
#[derive(Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct PersistentAddr(pub u64);

impl PersistentAddr {
    const OFFSET_BITS: u32 = 48;
    const OFFSET_MASK: u64 = (1 << Self::OFFSET_BITS) - 1;

    pub fn new(region: u16, offset: u64) -> Self {
        debug_assert!(offset <= Self::OFFSET_MASK);
        PersistentAddr(u64::from(region) << Self::OFFSET_BITS | (offset & Self::OFFSET_MASK))
    }

    pub fn region(self) -> u16 {
        (self.0 >> Self::OFFSET_BITS) as u16
    }

    pub fn offset(self) -> u64 {
        self.0 & Self::OFFSET_MASK
    }

    pub fn add(self, bytes: u64) -> Self {
        PersistentAddr::new(self.region(), self.offset() + bytes)
    }
}

impl fmt::Debug for PersistentAddr {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{:#x}", self.region(), self.offset())
    }
}

/// A snapshot of one published log entry.
///
/// The meaning of `addr` and `value` depends on the kind:
///
/// | kind | `addr` | `value` | `size` |
/// |------|--------|---------|--------|
/// | acquire, rdlock, wrlock | lock | observed release, packed handle | 0 |
/// | release, unlock | lock | 0 | 0 |
/// | begin/end durable | 0 | 0 | 0 |
/// | store | [`PersistentAddr`] | after-image, little endian | bytes, at most 8 |
/// | memset | [`PersistentAddr`] | the byte | bytes |
/// | memcpy, memmove | [`PersistentAddr`] | data chain, packed handle | bytes |
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct LogEntry {
    pub handle: Handle,
    pub kind: EntryKind,
    pub addr: u64,
    pub value: u64,
    pub size: u64,
    pub next: Handle,
    pub tid: u32,
}

impl LogEntry {
    /// The release this acquisition observed, if any.
    pub fn target(&self) -> Option<Handle> {
        if self.kind.is_acquire() {
            Handle::from_word(self.value).non_null()
        } else {
            None
        }
    }

    /// The head of the data chain of a `memcpy`/`memmove`.
    pub fn data(&self) -> Option<Handle> {
        if self.kind.has_data() {
            Handle::from_word(self.value).non_null()
        } else {
            None
        }
    }

    pub fn persistent_addr(&self) -> PersistentAddr {
        PersistentAddr(self.addr)
    }

    /// The bytes of a store entry.
    pub fn store_image(&self) -> Option<([u8; 8], usize)> {
        if self.kind == EntryKind::Store {
            Some((self.value.to_le_bytes(), (self.size as usize).min(8)))
        } else {
            None
        }
    }
}

/// One thread's entry into the list of log structures.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct LogStructure {
    pub handle: Handle,
    /// The first live entry of the thread.
    pub first: Handle,
    pub next: Handle,
    pub tid: u32,
}

#[test]
fn handle_packing() {
    let handle = Handle { index: 7, generation: 3 };
    assert_eq!(Handle::from_word(handle.to_word()), handle);
    assert_eq!(Handle::from_word(0), Handle::NULL);
    assert!(Handle { index: 0, generation: 9 }.is_null());
}

#[test]
fn section_kinds_are_disjoint() {
    for tag in 1..=11 {
        let kind = EntryKind::from_tag(tag).unwrap();
        assert_eq!(kind.tag(), tag);
        assert!(!(kind.is_start_section() && kind.is_end_section()));
        assert!(!(kind.is_store_like() && (kind.is_start_section() || kind.is_end_section())));
    }

    assert_eq!(EntryKind::from_tag(0), None);
    assert_eq!(EntryKind::from_tag(12), None);
}

#[test]
fn persistent_addr_split() {
    let addr = PersistentAddr::new(3, 0x1234);
    assert_eq!(addr.region(), 3);
    assert_eq!(addr.offset(), 0x1234);
    assert_eq!(addr.add(4).offset(), 0x1238);
}
