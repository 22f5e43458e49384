use serde::{Deserialize, Serialize};
use std::fmt;

/// A signed handle distinguishing the two halves of a package's symbol table.
///
/// Positive values index the package's local definitions (exports), negative
/// values index its external references (imports), zero is null. Storing both
/// sides in one signed integer lets any cross-reference be resolved through a
/// single generic code path instead of separate import/export branches.
#[derive(Copy, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct SymbolIndex(i32);

impl SymbolIndex {
    pub fn null() -> Self {
        SymbolIndex(0)
    }

    pub fn from_export(index: usize) -> Self {
        SymbolIndex(index as i32 + 1)
    }

    pub fn from_import(index: usize) -> Self {
        SymbolIndex(-(index as i32 + 1))
    }

    pub fn is_null(self) -> bool {
        self.0 == 0
    }

    pub fn is_export(self) -> bool {
        self.0 > 0
    }

    pub fn is_import(self) -> bool {
        self.0 < 0
    }

    /// Index into the export table, or None if this is not an export.
    pub fn export_index(self) -> Option<usize> {
        if self.0 > 0 {
            Some(self.0 as usize - 1)
        } else {
            None
        }
    }

    /// Index into the import table, or None if this is not an import.
    pub fn import_index(self) -> Option<usize> {
        if self.0 < 0 {
            Some((-self.0) as usize - 1)
        } else {
            None
        }
    }
}

impl fmt::Debug for SymbolIndex {
    fn fmt(
        &self,
        f: &mut fmt::Formatter<'_>,
    ) -> fmt::Result {
        if self.0 == 0 {
            write!(f, "SymbolIndex(null)")
        } else if self.0 > 0 {
            write!(f, "SymbolIndex(export {})", self.0 - 1)
        } else {
            write!(f, "SymbolIndex(import {})", -self.0 - 1)
        }
    }
}
