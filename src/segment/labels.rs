//! Anatomical label tables.

use crate::error::{Error, Result};

/// FreeSurfer aseg codes of the 43 structures, in network output order.
const ASEG43_CODES: [u8; 43] = [
    2, 3, 4, 5, 7, 8, 10, 11, 12, 13, 14, 15, 16, 17, 18, 24, 26, 28, 30, 31, 41, 42, 43, 44, 46,
    47, 49, 50, 51, 52, 53, 54, 58, 60, 62, 63, 77, 85, 251, 252, 253, 254, 255,
];

/// Immutable, ordered mapping from dense class indices to label codes.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct LabelTable {
    codes: &'static [u8],
}

impl LabelTable {
    /// The 43-entry aseg table.
    pub const fn aseg43() -> Self {
        Self {
            codes: &ASEG43_CODES,
        }
    }

    pub fn len(&self) -> usize {
        self.codes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.codes.is_empty()
    }

    /// All codes, in index order.
    pub fn codes(&self) -> &[u8] {
        self.codes
    }

    /// Code for dense index `index`.
    pub fn code(&self, index: usize) -> Result<u8> {
        self.codes.get(index).copied().ok_or_else(|| {
            Error::ModeMismatch(format!(
                "class index {} outside label table of {} entries",
                index,
                self.codes.len()
            ))
        })
    }
}
