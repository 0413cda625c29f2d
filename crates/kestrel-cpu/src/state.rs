use serde::{Deserialize, Serialize};

// EFLAGS bit masks.
pub const FLAG_CF: u32 = 1 << 0;
pub const FLAG_PF: u32 = 1 << 2;
pub const FLAG_AF: u32 = 1 << 4;
pub const FLAG_ZF: u32 = 1 << 6;
pub const FLAG_SF: u32 = 1 << 7;
pub const FLAG_TF: u32 = 1 << 8;
pub const FLAG_IF: u32 = 1 << 9;
pub const FLAG_DF: u32 = 1 << 10;
pub const FLAG_OF: u32 = 1 << 11;
pub const FLAGS_IOPL: u32 = 3 << 12;
pub const FLAG_NT: u32 = 1 << 14;
pub const FLAG_RF: u32 = 1 << 16;
pub const FLAG_VM: u32 = 1 << 17;
pub const FLAG_AC: u32 = 1 << 18;
pub const FLAG_VIF: u32 = 1 << 19;
pub const FLAG_VIP: u32 = 1 << 20;
pub const FLAG_ID: u32 = 1 << 21;

/// Bit 1 reads as set on every 8086-descended part.
pub const FLAGS_ALWAYS_SET: u32 = 1 << 1;
pub const FLAGS_DEFINED: u32 = FLAG_CF
    | FLAG_PF
    | FLAG_AF
    | FLAG_ZF
    | FLAG_SF
    | FLAG_TF
    | FLAG_IF
    | FLAG_DF
    | FLAG_OF
    | FLAGS_IOPL
    | FLAG_NT
    | FLAG_RF
    | FLAG_VM
    | FLAG_AC
    | FLAG_VIF
    | FLAG_VIP
    | FLAG_ID;

// CR0 bits.
pub const CR0_PE: u32 = 1 << 0;
pub const CR0_MP: u32 = 1 << 1;
pub const CR0_EM: u32 = 1 << 2;
pub const CR0_TS: u32 = 1 << 3;
pub const CR0_WP: u32 = 1 << 16;
pub const CR0_PG: u32 = 1 << 31;

// CR4 bits the core looks at.
pub const CR4_TSD: u32 = 1 << 2;

// General register file indices (ModR/M reg encoding order).
pub const REG_EAX: usize = 0;
pub const REG_ECX: usize = 1;
pub const REG_EDX: usize = 2;
pub const REG_EBX: usize = 3;
pub const REG_ESP: usize = 4;
pub const REG_EBP: usize = 5;
pub const REG_ESI: usize = 6;
pub const REG_EDI: usize = 7;

/// Segment registers, in ModR/M sreg encoding order.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum SegReg {
    ES = 0,
    CS = 1,
    SS = 2,
    DS = 3,
    FS = 4,
    GS = 5,
}

impl SegReg {
    pub const ALL: [SegReg; 6] = [
        SegReg::ES,
        SegReg::CS,
        SegReg::SS,
        SegReg::DS,
        SegReg::FS,
        SegReg::GS,
    ];

    pub fn from_index(index: usize) -> Option<Self> {
        Self::ALL.get(index).copied()
    }

    pub fn name(self) -> &'static str {
        match self {
            SegReg::ES => "es",
            SegReg::CS => "cs",
            SegReg::SS => "ss",
            SegReg::DS => "ds",
            SegReg::FS => "fs",
            SegReg::GS => "gs",
        }
    }
}

/// Operand width of an ALU operation or memory access.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum OpSize {
    Byte,
    Word,
    Dword,
}

impl OpSize {
    pub fn bits(self) -> u32 {
        match self {
            OpSize::Byte => 8,
            OpSize::Word => 16,
            OpSize::Dword => 32,
        }
    }

    pub fn bytes(self) -> u32 {
        self.bits() / 8
    }

    pub fn mask(self) -> u32 {
        match self {
            OpSize::Byte => 0xFF,
            OpSize::Word => 0xFFFF,
            OpSize::Dword => 0xFFFF_FFFF,
        }
    }

    pub fn sign_bit(self) -> u32 {
        1 << (self.bits() - 1)
    }

    pub fn from_o32(o32: bool) -> Self {
        if o32 {
            OpSize::Dword
        } else {
            OpSize::Word
        }
    }
}

/// GDTR / IDTR.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct DescriptorTableReg {
    pub base: u32,
    pub limit: u16,
}

/// LDTR / TR: a selector plus the cached system-segment extent.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct SystemSegmentReg {
    pub selector: u16,
    pub base: u32,
    pub limit: u32,
    pub is_32bit: bool,
}

/// What a cached segment descriptor describes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum SegKind {
    /// Loaded null selector: legal to hold in DS/ES/FS/GS, faults on use.
    Null,
    Code { conforming: bool, readable: bool },
    Data { writable: bool, expand_down: bool },
}

/// The descriptor cache behind one segment register.
///
/// Authoritative for every access after the selector load; only MOV to a
/// segment register, far transfers, interrupt delivery, IRET and task
/// switches repopulate it.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct SegmentCache {
    pub kind: SegKind,
    pub base: u32,
    /// Effective limit, granularity already applied.
    pub limit: u32,
    pub dpl: u8,
    /// RPL of the selector this cache was loaded from.
    pub rpl: u8,
    pub present: bool,
    /// D/B flag: 32-bit default operand/address size (code), 32-bit stack
    /// pointer (SS), 4 GiB expand-down ceiling (data).
    pub default_big: bool,
    /// Loaded from the LDT rather than the GDT.
    pub from_ldt: bool,
}

impl Default for SegmentCache {
    fn default() -> Self {
        Self::null()
    }
}

impl SegmentCache {
    pub fn null() -> Self {
        Self {
            kind: SegKind::Null,
            base: 0,
            limit: 0,
            dpl: 0,
            rpl: 0,
            present: false,
            default_big: false,
            from_ldt: false,
        }
    }

    /// Real-mode / V86 cache image for a freshly written selector.
    pub fn real_mode(selector: u16, code: bool) -> Self {
        Self {
            kind: if code {
                SegKind::Code {
                    conforming: false,
                    readable: true,
                }
            } else {
                SegKind::Data {
                    writable: true,
                    expand_down: false,
                }
            },
            base: u32::from(selector) << 4,
            limit: 0xFFFF,
            dpl: 0,
            rpl: 0,
            present: true,
            default_big: false,
            from_ldt: false,
        }
    }

    pub fn is_null(&self) -> bool {
        matches!(self.kind, SegKind::Null)
    }

    pub fn is_code(&self) -> bool {
        matches!(self.kind, SegKind::Code { .. })
    }

    pub fn is_data(&self) -> bool {
        matches!(self.kind, SegKind::Data { .. })
    }

    pub fn is_conforming_code(&self) -> bool {
        matches!(self.kind, SegKind::Code { conforming: true, .. })
    }

    pub fn is_nonconforming_code(&self) -> bool {
        matches!(
            self.kind,
            SegKind::Code {
                conforming: false,
                ..
            }
        )
    }

    pub fn readable(&self) -> bool {
        match self.kind {
            SegKind::Null => false,
            SegKind::Code { readable, .. } => readable,
            SegKind::Data { .. } => true,
        }
    }

    pub fn writable(&self) -> bool {
        matches!(self.kind, SegKind::Data { writable: true, .. })
    }

    pub fn expand_down(&self) -> bool {
        matches!(
            self.kind,
            SegKind::Data {
                expand_down: true,
                ..
            }
        )
    }
}

/// Lazily-evaluated flag record.
///
/// The ALU writes (result, size) here and marks SF/ZF/PF dirty; reading any
/// of those flags forces them into the packed EFLAGS image. CF/OF/AF are
/// computed eagerly because they need both operands.
#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize)]
pub struct LazyFlags {
    pub dirty: u32,
    pub result: u32,
    pub size: Option<OpSize>,
}

/// Coarse run state of the core.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RunState {
    Alive,
    /// Parked by HLT until an IRQ or a hard reboot.
    Halted,
    /// A triple fault; only reset leaves this state.
    Shutdown,
    /// VKILL in autotest mode; the host should exit with this code.
    Dead { exit_code: i32 },
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn real_mode_cache_shifts_selector() {
        let cache = SegmentCache::real_mode(0xF000, true);
        assert_eq!(cache.base, 0xF0000);
        assert_eq!(cache.limit, 0xFFFF);
        assert!(cache.is_code());
        assert!(cache.readable());
    }

    #[test]
    fn op_size_masks() {
        assert_eq!(OpSize::Byte.mask(), 0xFF);
        assert_eq!(OpSize::Word.sign_bit(), 0x8000);
        assert_eq!(OpSize::Dword.bytes(), 4);
    }
}
