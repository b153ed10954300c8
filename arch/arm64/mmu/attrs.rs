//! Translation descriptor attributes
//!
//! LPAE descriptor bit definitions for Stage-1 and Stage-2, and the
//! MAIR encoding used by the Stage-1 tables. Stage-2 carries its memory
//! type inline (MemAttr) instead of indirecting through MAIR.

use bitflags::bitflags;

/// Descriptor type bits shared by both stages.
pub const DESC_VALID: u64 = 1 << 0;
/// Bit 1 set: table pointer (levels 0-2) or page leaf (level 3).
pub const DESC_TABLE: u64 = 1 << 1;
/// Level 1/2 block leaf: valid with bit 1 clear.
pub const DESC_BLOCK: u64 = DESC_VALID;
/// Level 3 page leaf.
pub const DESC_PAGE: u64 = DESC_VALID | DESC_TABLE;

/// Output-address field of any descriptor.
pub const DESC_ADDR_MASK: u64 = 0x0000_FFFF_FFFF_F000;

bitflags! {
    /// Stage-1 descriptor attributes (lower and upper blocks).
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct Stage1Attr: u64 {
        /// MAIR index 0 (device).
        const ATTR_IDX_DEVICE = 0b000 << 2;
        /// MAIR index 1 (normal write-back).
        const ATTR_IDX_NORMAL = 0b001 << 2;
        /// Non-secure.
        const NS = 1 << 5;
        /// EL0 accessible.
        const AP_EL0 = 1 << 6;
        /// Read-only.
        const AP_RO = 1 << 7;
        /// Outer shareable.
        const SH_OUTER = 0b10 << 8;
        /// Inner shareable.
        const SH_INNER = 0b11 << 8;
        /// Access flag; must be set to avoid access faults.
        const AF = 1 << 10;
        /// Privileged execute-never.
        const PXN = 1 << 53;
        /// Unprivileged execute-never.
        const UXN = 1 << 54;
    }
}

bitflags! {
    /// Stage-2 descriptor attributes.
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct Stage2Attr: u64 {
        /// MemAttr: Device-nGnRnE.
        const MEMATTR_DEVICE = 0b0000 << 2;
        /// MemAttr: Normal, inner+outer write-back cacheable.
        const MEMATTR_NORMAL_WB = 0b1111 << 2;
        /// S2AP read permission.
        const S2AP_READ = 1 << 6;
        /// S2AP write permission.
        const S2AP_WRITE = 1 << 7;
        /// Outer shareable.
        const SH_OUTER = 0b10 << 8;
        /// Inner shareable.
        const SH_INNER = 0b11 << 8;
        /// Access flag.
        const AF = 1 << 10;
        /// Execute-never for all ELs (bit 54 of the XN[1:0] pair).
        const XN = 1 << 54;
    }
}

impl Stage2Attr {
    /// Guest RAM: readable, writable, executable, cacheable,
    /// inner-shareable.
    pub fn ram() -> Self {
        Self::MEMATTR_NORMAL_WB | Self::S2AP_READ | Self::S2AP_WRITE | Self::SH_INNER | Self::AF
    }

    /// Pass-through device window: device memory, no execution.
    pub fn device() -> Self {
        Self::MEMATTR_DEVICE | Self::S2AP_READ | Self::S2AP_WRITE | Self::XN | Self::AF
    }

    /// Trapping device window (the GICC frame): valid but with neither
    /// read nor write permission, so every access faults to EL2.
    pub fn device_trapped() -> Self {
        Self::MEMATTR_DEVICE | Self::XN | Self::AF
    }

    pub fn is_device(self) -> bool {
        self & (Self::MEMATTR_NORMAL_WB) == Self::MEMATTR_DEVICE
    }

    pub fn readable(self) -> bool {
        self.contains(Self::S2AP_READ)
    }

    pub fn writable(self) -> bool {
        self.contains(Self::S2AP_WRITE)
    }

    pub fn executable(self) -> bool {
        !self.contains(Self::XN)
    }
}

/// MAIR_EL1/EL2 value matching the `ATTR_IDX_*` Stage-1 indices:
/// index 0 Device-nGnRnE, index 1 Normal write-back.
pub const MAIR_VALUE: u64 = 0x0000_0000_0000_FF00;
