//! Scalar protocol types: handles, enumerations and the protection bitset.

use bitflags::bitflags;

use crate::error::{ProtocolError, Result};

/// Opaque reference to provider-owned OS state.
///
/// Controllers only compare and forward handles; there is no arithmetic and
/// no way to dereference one. Handles are always 8 bytes on the wire.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Default)]
pub struct Handle(u64);

impl Handle {
    pub const NULL: Handle = Handle(0);

    /// Wrap a raw provider-side value
    pub const fn from_raw(raw: u64) -> Self {
        Self(raw)
    }

    /// Raw value, for the provider's platform layer and the codec
    pub const fn into_raw(self) -> u64 {
        self.0
    }

    pub fn is_null(self) -> bool {
        self.0 == 0
    }
}

impl std::fmt::Display for Handle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{:#x}", self.0)
    }
}

/// Declares a `u32`-backed wire enumeration with a validating decoder.
macro_rules! wire_enum {
    (
        $(#[$meta:meta])*
        $name:ident : $field:literal {
            $( $(#[$vmeta:meta])* $variant:ident = $value:literal ),+ $(,)?
        }
    ) => {
        $(#[$meta])*
        #[repr(u32)]
        #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
        pub enum $name {
            $( $(#[$vmeta])* $variant = $value ),+
        }

        impl $name {
            pub const ALL: &'static [$name] = &[$($name::$variant),+];

            pub fn to_wire(self) -> u32 {
                self as u32
            }

            pub fn from_wire(value: u32) -> Result<Self> {
                match value {
                    $( $value => Ok($name::$variant), )+
                    _ => Err(ProtocolError::InvalidEnumValue { field: $field, value }),
                }
            }
        }

        impl std::fmt::Display for $name {
            fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
                std::fmt::Debug::fmt(self, f)
            }
        }
    };
}

wire_enum! {
    /// Access rights requested when opening a process
    ProcessAccess: "process access" {
        Read = 0,
        Write = 1,
        Full = 2,
    }
}

wire_enum! {
    SectionType: "section type" {
        Unknown = 0,
        Private = 1,
        Mapped = 2,
        Image = 3,
    }
}

wire_enum! {
    SectionCategory: "section category" {
        Unknown = 0,
        Code = 1,
        Data = 2,
        Heap = 3,
    }
}

wire_enum! {
    ControlAction: "control action" {
        Suspend = 0,
        Resume = 1,
        Terminate = 2,
    }
}

wire_enum! {
    /// How the target should treat the event it is parked on
    ContinueStatus: "continue status" {
        Handled = 0,
        NotHandled = 1,
    }
}

wire_enum! {
    /// Debug address register. `0` on the wire means "no register".
    BreakpointRegister: "breakpoint register" {
        Dr0 = 1,
        Dr1 = 2,
        Dr2 = 3,
        Dr3 = 4,
    }
}

impl BreakpointRegister {
    /// Slot index in a thread's four debug address registers
    pub fn slot(self) -> usize {
        self as usize - 1
    }

    /// Decode an optional register, where `0` is `InvalidRegister`
    pub fn from_wire_optional(value: u32) -> Result<Option<Self>> {
        match value {
            0 => Ok(None),
            v => Self::from_wire(v).map(Some),
        }
    }

    pub fn to_wire_optional(register: Option<Self>) -> u32 {
        register.map_or(0, Self::to_wire)
    }
}

wire_enum! {
    BreakpointTrigger: "breakpoint trigger" {
        Execute = 0,
        Access = 1,
        Write = 2,
    }
}

wire_enum! {
    BreakpointSize: "breakpoint size" {
        Size1 = 1,
        Size2 = 2,
        Size4 = 4,
        Size8 = 8,
    }
}

impl BreakpointSize {
    pub fn bytes(self) -> u64 {
        self as u64
    }
}

wire_enum! {
    DebugEventKind: "debug event kind" {
        CreateProcess = 0,
        ExitProcess = 1,
        CreateThread = 2,
        ExitThread = 3,
        LoadDll = 4,
        UnloadDll = 5,
        Exception = 6,
    }
}

/// Target architecture width. Selected once per session.
#[repr(u8)]
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Architecture {
    X86 = 32,
    X64 = 64,
}

impl Architecture {
    /// Architecture of the running provider
    pub fn native() -> Self {
        if cfg!(target_pointer_width = "64") {
            Architecture::X64
        } else {
            Architecture::X86
        }
    }

    pub fn bitness(self) -> u32 {
        self as u32
    }

    pub fn from_wire(value: u8) -> Result<Self> {
        match value {
            32 => Ok(Architecture::X86),
            64 => Ok(Architecture::X64),
            v => Err(ProtocolError::InvalidEnumValue {
                field: "architecture",
                value: v as u32,
            }),
        }
    }
}

impl std::fmt::Display for Architecture {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Architecture::X86 => write!(f, "x86"),
            Architecture::X64 => write!(f, "x64"),
        }
    }
}

bitflags! {
    /// Page protection of a section.
    ///
    /// `NO_ACCESS` is the empty set. Since it has no bit of its own,
    /// `NO_ACCESS | READ` is simply `READ`: combining normalises away.
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
    pub struct SectionProtection: u32 {
        const READ = 1;
        const WRITE = 2;
        const EXECUTE = 4;
        const GUARD = 8;
    }
}

impl SectionProtection {
    pub const NO_ACCESS: SectionProtection = SectionProtection::empty();

    pub fn is_no_access(self) -> bool {
        self.is_empty()
    }

    /// Decode, rejecting any bit outside the four declared flags
    pub fn from_wire(value: u32) -> Result<Self> {
        Self::from_bits(value).ok_or(ProtocolError::InvalidEnumValue {
            field: "section protection",
            value,
        })
    }

    pub fn to_wire(self) -> u32 {
        self.bits()
    }
}

impl std::fmt::Display for SectionProtection {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let flag = |set: bool, c: char| if set { c } else { '-' };
        write!(
            f,
            "{}{}{}{}",
            flag(self.contains(Self::READ), 'r'),
            flag(self.contains(Self::WRITE), 'w'),
            flag(self.contains(Self::EXECUTE), 'x'),
            flag(self.contains(Self::GUARD), 'g'),
        )
    }
}
