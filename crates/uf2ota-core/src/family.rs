use clap::ValueEnum;
use std::fmt;

// See https://github.com/microsoft/uf2/blob/master/utils/uf2families.json for list
#[derive(Debug, ValueEnum, Clone, Copy, PartialEq, Eq)]
#[repr(u32)]
#[allow(non_camel_case_types)]
pub enum Family {
    /// Beken BK7231T
    BK7231T = 0x675a40b0,

    /// Beken BK7231N
    BK7231N = 0x7b3ef230,

    /// Realtek AmebaZ RTL8710B
    RTL8710B = 0x22e0d6fc,

    /// Realtek AmebaZ2 RTL8720C
    RTL8720C = 0xe08f7564,
}

impl Family {
    pub const fn id(self) -> u32 {
        self as u32
    }

    pub fn from_id(id: u32) -> Option<Family> {
        Some(match id {
            0x675a40b0 => Family::BK7231T,
            0x7b3ef230 => Family::BK7231N,
            0x22e0d6fc => Family::RTL8710B,
            0xe08f7564 => Family::RTL8720C,
            _ => return None,
        })
    }
}

impl fmt::Display for Family {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{self:?} ({:#010x})", self.id())
    }
}
