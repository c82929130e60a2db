//! Chip identification.
//!
//! GET_ID returns a product id that maps onto a device family. Ids that are
//! not in the table resolve to [`ChipModel::Unknown`] rather than an error,
//! so a new part can still be programmed.

use std::fmt;

/// Known product ids and their family names.
static CHIP_TABLE: &[(u32, &str)] = &[
    (0x0410, "STM32F10xxx medium-density"),
    (0x0411, "STM32F2xx"),
    (0x0412, "STM32F10xxx low-density"),
    (0x0413, "STM32F405/407/415/417"),
    (0x0414, "STM32F10xxx high-density"),
    (0x0418, "STM32F105/107"),
    (0x0419, "STM32F42x/43x"),
    (0x0420, "STM32F100 value line"),
    (0x0421, "STM32F446"),
    (0x0423, "STM32F401xB/C"),
    (0x0430, "STM32F10xxx XL-density"),
    (0x0431, "STM32F411"),
    (0x0433, "STM32F401xD/E"),
    (0x0434, "STM32F469/479"),
    (0x0441, "STM32F412"),
    (0x0449, "STM32F74x/75x"),
    (0x0451, "STM32F76x/77x"),
    (0x0463, "STM32F413/423"),
];

/// Resolved device family.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ChipModel {
    /// Id found in the table.
    Known(&'static str),
    /// Id not in the table.
    Unknown,
}

impl ChipModel {
    /// Look up a product id.
    pub fn lookup(id: u32) -> Self {
        CHIP_TABLE
            .iter()
            .find(|(known, _)| *known == id)
            .map_or(Self::Unknown, |(_, name)| Self::Known(name))
    }

    /// Whether the id was recognised.
    pub fn is_known(&self) -> bool {
        matches!(self, Self::Known(_))
    }
}

impl fmt::Display for ChipModel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Known(name) => f.write_str(name),
            Self::Unknown => f.write_str("Unknown chip"),
        }
    }
}

/// Product id reported by GET_ID.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ChipIdentity {
    /// Raw id, decoded big-endian from the four id bytes.
    pub id: u32,
    /// Family the id resolves to.
    pub model: ChipModel,
}

impl ChipIdentity {
    /// Resolve `id` against the chip table.
    pub fn new(id: u32) -> Self {
        Self {
            id,
            model: ChipModel::lookup(id),
        }
    }
}

impl fmt::Display for ChipIdentity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "0x{:08X} ({})", self.id, self.model)
    }
}

#[cfg(feature = "serde")]
impl serde::Serialize for ChipIdentity {
    fn serialize<S: serde::Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        use serde::ser::SerializeStruct;

        let mut s = serializer.serialize_struct("ChipIdentity", 3)?;
        s.serialize_field("id", &format!("0x{:08X}", self.id))?;
        s.serialize_field("name", &self.model.to_string())?;
        s.serialize_field("known", &self.model.is_known())?;
        s.end()
    }
}
