//! Device-side data decoded from identification replies.

pub mod chip;
pub mod version;

pub use chip::{ChipIdentity, ChipModel};
pub use version::BootloaderVersion;
