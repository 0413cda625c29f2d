use core::fmt;

/// An address on the physical memory bus, after segmentation, paging and the
/// A20 mask.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, PartialOrd, Ord)]
pub struct PhysicalAddress(pub u32);

/// A post-segmentation, pre-paging address.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, PartialOrd, Ord)]
pub struct LinearAddress(pub u32);

/// A selector:offset pair as software sees it.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct LogicalAddress {
    pub selector: u16,
    pub offset: u32,
}

impl LogicalAddress {
    pub fn new(selector: u16, offset: u32) -> Self {
        Self { selector, offset }
    }
}

impl fmt::Display for PhysicalAddress {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:#010x}", self.0)
    }
}

impl fmt::Display for LinearAddress {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:#010x}", self.0)
    }
}

impl fmt::Display for LogicalAddress {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:04x}:{:08x}", self.selector, self.offset)
    }
}
