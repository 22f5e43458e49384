use pakstream_base::SymbolIndex;
use serde::{Deserialize, Serialize};
use thiserror::Error;
use uuid::Uuid;

/// Identifies a file as a pakstream package.
pub const PACKAGE_FILE_TAG: u32 = 0x504b_5354; // "PKST"
/// Bumped whenever the summary layout changes incompatibly.
pub const PACKAGE_FILE_VERSION: u32 = 3;

// No real reason this limit needs to exist, just don't want to read corrupt
// data and try to allocate based on it. This is larger than a summary is
// actually expected to be.
pub const MAX_SUMMARY_SIZE: u64 = 1024 * 1024;

/// One object defined by this package. The declaration-dependency indices
/// gate when the object may be constructed; the serial range locates its
/// payload in the file's data area.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct ExportEntry {
    pub object_name: String,
    pub class_index: SymbolIndex,
    pub super_index: SymbolIndex,
    pub outer_index: SymbolIndex,
    pub template_index: SymbolIndex,
    pub serial_offset: u64,
    pub serial_size: u64,
}

/// One reference to an object defined by a different package.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct ImportEntry {
    pub object_name: String,
    pub class_name: String,
    pub outer_index: SymbolIndex,
    /// Logical name of the package that declares the object.
    pub source_package: String,
}

/// The package summary. Written length-prefixed at the start of the file;
/// the loader must have `total_header_len` bytes resident before any symbol
/// can be created.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct PackageSummary {
    pub tag: u32,
    pub version: u32,
    /// Prefix plus encoded summary, in bytes. Payload ranges start past this.
    pub total_header_len: u64,
    pub package_id: Uuid,
    pub exports: Vec<ExportEntry>,
    pub imports: Vec<ImportEntry>,
    /// Per export, the symbols whose payloads must be serialized before this
    /// export's payload may be serialized. Parallel to `exports`.
    pub serialize_before: Vec<Vec<SymbolIndex>>,
}

#[derive(Debug, Error)]
pub enum SummaryError {
    #[error("file too short to hold a summary length prefix")]
    TruncatedPrefix,
    #[error("summary length {0} exceeds maximum {MAX_SUMMARY_SIZE}")]
    TooLarge(u64),
    #[error("summary bytes not fully resident")]
    Truncated,
    #[error("bad format tag {0:#010x}")]
    BadTag(u32),
    #[error("unsupported version {0} (expected {PACKAGE_FILE_VERSION})")]
    BadVersion(u32),
    #[error("header length {header_len} exceeds file size {file_size}")]
    HeaderExceedsFile { header_len: u64, file_size: u64 },
    #[error("dependency list count {0} does not match export count {1}")]
    DependencyCountMismatch(usize, usize),
    #[error("failed to decode summary")]
    Decode(#[from] bincode::Error),
}

impl PackageSummary {
    pub fn new(package_id: Uuid) -> Self {
        PackageSummary {
            tag: PACKAGE_FILE_TAG,
            version: PACKAGE_FILE_VERSION,
            total_header_len: 0,
            package_id,
            exports: Vec::default(),
            imports: Vec::default(),
            serialize_before: Vec::default(),
        }
    }

    /// Total bytes the loader needs resident before symbols can be declared,
    /// given the 8-byte length prefix at the start of the file.
    pub fn required_len_from_prefix(prefix: &[u8]) -> Result<u64, SummaryError> {
        if prefix.len() < 8 {
            return Err(SummaryError::TruncatedPrefix);
        }
        let mut bytes = [0u8; 8];
        bytes.copy_from_slice(&prefix[0..8]);
        let encoded_len = u64::from_le_bytes(bytes);
        if encoded_len > MAX_SUMMARY_SIZE {
            return Err(SummaryError::TooLarge(encoded_len));
        }
        Ok(encoded_len + 8)
    }

    /// Decodes a summary from the start-of-file bytes and validates the
    /// structural contract against the real file size.
    pub fn parse(
        buffer: &[u8],
        file_size: u64,
    ) -> Result<PackageSummary, SummaryError> {
        let required = Self::required_len_from_prefix(buffer)?;
        if (buffer.len() as u64) < required {
            return Err(SummaryError::Truncated);
        }

        let summary: PackageSummary = bincode::deserialize(&buffer[8..required as usize])?;
        if summary.tag != PACKAGE_FILE_TAG {
            return Err(SummaryError::BadTag(summary.tag));
        }
        if summary.version != PACKAGE_FILE_VERSION {
            return Err(SummaryError::BadVersion(summary.version));
        }
        if summary.total_header_len > file_size {
            return Err(SummaryError::HeaderExceedsFile {
                header_len: summary.total_header_len,
                file_size,
            });
        }
        if summary.serialize_before.len() != summary.exports.len() {
            return Err(SummaryError::DependencyCountMismatch(
                summary.serialize_before.len(),
                summary.exports.len(),
            ));
        }
        Ok(summary)
    }

    /// Writes the length-prefixed summary. `total_header_len` is computed
    /// here; bincode's fixed-width integer encoding keeps the encoded size
    /// independent of the value written into that field.
    pub fn write_header<T: std::io::Write>(
        &self,
        writer: &mut T,
    ) -> std::io::Result<u64> {
        let mut summary = self.clone();
        summary.total_header_len = 0;
        let encoded_len = bincode::serialized_size(&summary)
            .map_err(|e| std::io::Error::new(std::io::ErrorKind::InvalidData, e))?;
        assert!(encoded_len <= MAX_SUMMARY_SIZE);
        summary.total_header_len = encoded_len + 8;

        let serialized = bincode::serialize(&summary)
            .map_err(|e| std::io::Error::new(std::io::ErrorKind::InvalidData, e))?;
        debug_assert_eq!(serialized.len() as u64, encoded_len);

        writer.write_all(&encoded_len.to_le_bytes())?;
        writer.write_all(&serialized)?;
        Ok(summary.total_header_len)
    }

    /// Looks up an export by object name. Linear scan; tables are small and
    /// this only runs while wiring cross-package references.
    pub fn find_export(
        &self,
        object_name: &str,
    ) -> Option<usize> {
        self.exports
            .iter()
            .position(|e| e.object_name == object_name)
    }
}
