//! Bootloader version byte.

use std::fmt;

/// Version reported by GET_VERSION.
///
/// The byte is a fixed-point value in sixteenths: `0x10` is 1.0, `0x21`
/// renders as 2.1.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BootloaderVersion(u8);

impl BootloaderVersion {
    /// Wrap a raw version byte.
    pub fn from_raw(raw: u8) -> Self {
        Self(raw)
    }

    /// Raw byte as received.
    pub fn raw(self) -> u8 {
        self.0
    }

    /// Numeric value (raw / 16).
    pub fn value(self) -> f32 {
        f32::from(self.0) / 16.0
    }
}

impl fmt::Display for BootloaderVersion {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:.1}", self.value())
    }
}

#[cfg(feature = "serde")]
impl serde::Serialize for BootloaderVersion {
    fn serialize<S: serde::Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.collect_str(self)
    }
}
