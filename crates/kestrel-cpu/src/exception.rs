/// Who asked for an interrupt.
///
/// External delivery sets the EXT bit in any error code pushed while
/// delivering the vector, and is exempt from the software-INT privilege
/// check.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum InterruptSource {
    Internal,
    External,
}

impl InterruptSource {
    pub(crate) fn ext_bit(self) -> u16 {
        match self {
            InterruptSource::Internal => 0,
            InterruptSource::External => 1,
        }
    }
}

/// An architectural exception, carried as the error arm of `Result` through
/// every memory, segmentation and decode step.
///
/// The dispatcher in `cpu.rs` converts one of these into an interrupt
/// delivery; there is no unwinding machinery involved.
#[derive(Debug, Clone, Copy, PartialEq, Eq, thiserror::Error)]
pub enum Exception {
    #[error("#DE")]
    DivideError,
    #[error("#DB")]
    Debug,
    #[error("#BP")]
    Breakpoint,
    #[error("#OF")]
    Overflow,
    #[error("#BR")]
    BoundRange,
    #[error("#UD")]
    InvalidOpcode,
    #[error("#DF")]
    DoubleFault,
    #[error("#TS({0:#06x})")]
    InvalidTss(u16),
    #[error("#NP({0:#06x})")]
    SegmentNotPresent(u16),
    #[error("#SS({0:#06x})")]
    StackFault(u16),
    #[error("#GP({0:#06x})")]
    GeneralProtection(u16),
    #[error("#PF({error_code:#06x}) at {address:#010x}")]
    PageFault { error_code: u16, address: u32 },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum ExceptionClass {
    Benign,
    Contributory,
    PageFault,
}

impl Exception {
    /// #GP with a selector-based error code.
    pub fn gp(selector: u16) -> Self {
        Exception::GeneralProtection(selector & 0xFFFC)
    }

    pub fn gp0() -> Self {
        Exception::GeneralProtection(0)
    }

    pub fn np(selector: u16) -> Self {
        Exception::SegmentNotPresent(selector & 0xFFFC)
    }

    pub fn ss(selector: u16) -> Self {
        Exception::StackFault(selector & 0xFFFC)
    }

    pub fn ts(selector: u16) -> Self {
        Exception::InvalidTss(selector & 0xFFFC)
    }

    pub fn vector(&self) -> u8 {
        match self {
            Exception::DivideError => 0,
            Exception::Debug => 1,
            Exception::Breakpoint => 3,
            Exception::Overflow => 4,
            Exception::BoundRange => 5,
            Exception::InvalidOpcode => 6,
            Exception::DoubleFault => 8,
            Exception::InvalidTss(_) => 10,
            Exception::SegmentNotPresent(_) => 11,
            Exception::StackFault(_) => 12,
            Exception::GeneralProtection(_) => 13,
            Exception::PageFault { .. } => 14,
        }
    }

    pub fn error_code(&self) -> Option<u16> {
        match *self {
            Exception::DoubleFault => Some(0),
            Exception::InvalidTss(code)
            | Exception::SegmentNotPresent(code)
            | Exception::StackFault(code)
            | Exception::GeneralProtection(code) => Some(code),
            Exception::PageFault { error_code, .. } => Some(error_code),
            _ => None,
        }
    }

    /// Traps leave EIP at the next instruction; faults rewind it so the
    /// instruction restarts after the handler returns.
    pub fn is_trap(&self) -> bool {
        matches!(
            self,
            Exception::Breakpoint | Exception::Overflow | Exception::Debug
        )
    }

    fn class(&self) -> ExceptionClass {
        match self {
            Exception::PageFault { .. } => ExceptionClass::PageFault,
            Exception::InvalidTss(_)
            | Exception::SegmentNotPresent(_)
            | Exception::StackFault(_)
            | Exception::GeneralProtection(_)
            | Exception::DivideError => ExceptionClass::Contributory,
            _ => ExceptionClass::Benign,
        }
    }

    /// Whether a `second` exception raised while delivering `self` escalates
    /// to a double fault (Intel SDM vol. 3, interrupt 8).
    pub fn promotes_to_double_fault(&self, second: &Exception) -> bool {
        use ExceptionClass as C;
        matches!(
            (self.class(), second.class()),
            (C::Contributory, C::Contributory)
                | (C::PageFault, C::Contributory)
                | (C::PageFault, C::PageFault)
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn selector_error_codes_mask_rpl() {
        assert_eq!(Exception::gp(0x1B), Exception::GeneralProtection(0x18));
        assert_eq!(Exception::np(0xFFFF), Exception::SegmentNotPresent(0xFFFC));
    }

    #[test]
    fn double_fault_matrix() {
        let gp = Exception::GeneralProtection(0);
        let pf = Exception::PageFault {
            error_code: 0,
            address: 0,
        };
        let de = Exception::DivideError;
        let ud = Exception::InvalidOpcode;

        assert!(gp.promotes_to_double_fault(&gp));
        assert!(gp.promotes_to_double_fault(&de));
        assert!(pf.promotes_to_double_fault(&pf));
        assert!(pf.promotes_to_double_fault(&gp));
        // A page fault during a contributory exception is *not* a #DF.
        assert!(!gp.promotes_to_double_fault(&pf));
        assert!(!ud.promotes_to_double_fault(&gp));
    }
}
