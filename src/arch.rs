#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum Arch {
    X64,
    AArch64,
}

impl Arch {
    pub fn pointer_size(&self) -> usize {
        match self {
            Arch::X64 => 8,
            Arch::AArch64 => 8,
        }
    }

    /// instruction encodings are variable-length on x64, fixed 4-byte on AArch64.
    pub fn instruction_alignment(&self) -> usize {
        match self {
            Arch::X64 => 1,
            Arch::AArch64 => 4,
        }
    }
}
