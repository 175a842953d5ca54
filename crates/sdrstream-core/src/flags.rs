//! Stream flag bitmask.
//!
//! The same bits are used in requests (activate, write) and in results
//! (read, status). Values match the conventional driver ABI.

use std::ops::{BitAnd, BitAndAssign, BitOr, BitOrAssign, Not};

/// Bitmask of stream flags.
#[derive(Clone, Copy, PartialEq, Eq, Hash, Default)]
pub struct StreamFlags(u32);

impl StreamFlags {
    pub const NONE: StreamFlags = StreamFlags(0);
    /// Last packet of a burst (write request, status report).
    pub const END_BURST: StreamFlags = StreamFlags(1 << 1);
    /// The accompanying timestamp is valid.
    pub const HAS_TIME: StreamFlags = StreamFlags(1 << 2);
    /// The burst ended before all samples could be handled.
    pub const END_ABRUPT: StreamFlags = StreamFlags(1 << 3);
    /// Transfer at most one packet.
    pub const ONE_PACKET: StreamFlags = StreamFlags(1 << 4);
    /// The packet continues in the next transfer.
    pub const MORE_FRAGMENTS: StreamFlags = StreamFlags(1 << 5);
    /// Hold the operation until an external trigger.
    pub const WAIT_TRIGGER: StreamFlags = StreamFlags(1 << 6);
    pub const USER_FLAG0: StreamFlags = StreamFlags(1 << 16);
    pub const USER_FLAG1: StreamFlags = StreamFlags(1 << 17);
    pub const USER_FLAG2: StreamFlags = StreamFlags(1 << 18);
    pub const USER_FLAG3: StreamFlags = StreamFlags(1 << 19);
    pub const USER_FLAG4: StreamFlags = StreamFlags(1 << 20);

    const NAMES: [(StreamFlags, &'static str); 11] = [
        (Self::END_BURST, "END_BURST"),
        (Self::HAS_TIME, "HAS_TIME"),
        (Self::END_ABRUPT, "END_ABRUPT"),
        (Self::ONE_PACKET, "ONE_PACKET"),
        (Self::MORE_FRAGMENTS, "MORE_FRAGMENTS"),
        (Self::WAIT_TRIGGER, "WAIT_TRIGGER"),
        (Self::USER_FLAG0, "USER_FLAG0"),
        (Self::USER_FLAG1, "USER_FLAG1"),
        (Self::USER_FLAG2, "USER_FLAG2"),
        (Self::USER_FLAG3, "USER_FLAG3"),
        (Self::USER_FLAG4, "USER_FLAG4"),
    ];

    #[inline]
    pub const fn from_bits(bits: u32) -> Self {
        StreamFlags(bits)
    }

    #[inline]
    pub const fn bits(self) -> u32 {
        self.0
    }

    #[inline]
    pub const fn is_empty(self) -> bool {
        self.0 == 0
    }

    /// True if every bit of `other` is set.
    #[inline]
    pub const fn contains(self, other: StreamFlags) -> bool {
        self.0 & other.0 == other.0
    }

    /// True if any bit of `other` is set.
    #[inline]
    pub const fn intersects(self, other: StreamFlags) -> bool {
        self.0 & other.0 != 0
    }

    #[inline]
    pub fn insert(&mut self, other: StreamFlags) {
        self.0 |= other.0;
    }

    #[inline]
    pub fn remove(&mut self, other: StreamFlags) {
        self.0 &= !other.0;
    }

    /// Set or clear `other` depending on `value`.
    #[inline]
    pub fn set(&mut self, other: StreamFlags, value: bool) {
        if value {
            self.insert(other);
        } else {
            self.remove(other);
        }
    }
}

impl BitOr for StreamFlags {
    type Output = StreamFlags;

    fn bitor(self, rhs: Self) -> Self::Output {
        StreamFlags(self.0 | rhs.0)
    }
}

impl BitOrAssign for StreamFlags {
    fn bitor_assign(&mut self, rhs: Self) {
        self.0 |= rhs.0;
    }
}

impl BitAnd for StreamFlags {
    type Output = StreamFlags;

    fn bitand(self, rhs: Self) -> Self::Output {
        StreamFlags(self.0 & rhs.0)
    }
}

impl BitAndAssign for StreamFlags {
    fn bitand_assign(&mut self, rhs: Self) {
        self.0 &= rhs.0;
    }
}

impl Not for StreamFlags {
    type Output = StreamFlags;

    fn not(self) -> Self::Output {
        StreamFlags(!self.0)
    }
}

impl std::fmt::Debug for StreamFlags {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        if self.is_empty() {
            return write!(f, "StreamFlags(NONE)");
        }
        let mut rest = self.0;
        let mut first = true;
        write!(f, "StreamFlags(")?;
        for (flag, name) in Self::NAMES {
            if self.contains(flag) {
                if !first {
                    write!(f, " | ")?;
                }
                write!(f, "{}", name)?;
                rest &= !flag.0;
                first = false;
            }
        }
        if rest != 0 {
            if !first {
                write!(f, " | ")?;
            }
            write!(f, "{:#x}", rest)?;
        }
        write!(f, ")")
    }
}
