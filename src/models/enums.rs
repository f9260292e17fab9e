use crate::db::DatabaseError;
use serde::{Deserialize, Serialize};

/// Macro to generate enum with as_str + std::str::FromStr pattern
macro_rules! str_enum {
    ($(#[$meta:meta])* $name:ident { $($(#[$vmeta:meta])* $variant:ident => $s:literal),+ $(,)? }) => {
        $(#[$meta])*
        #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
        pub enum $name {
            $($(#[$vmeta])* #[serde(rename = $s)] $variant),+
        }

        impl $name {
            pub fn as_str(&self) -> &'static str {
                match self {
                    $(Self::$variant => $s),+
                }
            }
        }

        impl std::str::FromStr for $name {
            type Err = DatabaseError;

            fn from_str(s: &str) -> Result<Self, Self::Err> {
                match s {
                    $($s => Ok(Self::$variant)),+,
                    _ => Err(DatabaseError::InvalidEnum {
                        field: stringify!($name).into(),
                        value: s.into(),
                    }),
                }
            }
        }

        impl std::fmt::Display for $name {
            fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
                f.write_str(self.as_str())
            }
        }
    };
}

str_enum!(
    /// Structured outcome code attached to every `ExtractionResult`.
    ///
    /// `None` is the "no error" sentinel: it appears iff the file succeeded.
    ErrorCode {
        None => "none",
        FileNotFound => "file_not_found",
        FileTooLarge => "file_too_large",
        FileEmpty => "file_empty",
        InvalidDocument => "invalid_document",
        NoPages => "no_pages",
        AnchorNotFound => "anchor_not_found",
        HeaderNotRecognized => "header_not_recognized",
        TerminatorNotFound => "terminator_not_found",
        EmptyTableRegion => "empty_table_region",
        InvalidTableBoundary => "invalid_table_boundary",
        NoRowsExtracted => "no_rows_extracted",
        MemoryLimitExceeded => "memory_limit_exceeded",
        Timeout => "timeout",
        WorkerError => "worker_error",
        Unknown => "unknown",
    }
);

str_enum!(
    /// Pipeline stage at which a file failed.
    Stage {
        Validation => "validation",
        ResourceCheck => "resource_check",
        AnchorSearch => "anchor_search",
        BoundaryResolution => "boundary_resolution",
        RowParsing => "row_parsing",
        Worker => "worker",
    }
);

impl ErrorCode {
    pub fn is_error(&self) -> bool {
        *self != ErrorCode::None
    }

    /// Codes produced by infrastructure trouble rather than by the document itself.
    /// Only these are eligible for the retry policy.
    pub fn is_retryable(&self) -> bool {
        matches!(self, Self::Timeout | Self::WorkerError | Self::Unknown)
    }

    /// Default stage for a code when the producer did not record one.
    pub fn default_stage(&self) -> Option<Stage> {
        match self {
            Self::None => None,
            Self::FileNotFound
            | Self::FileTooLarge
            | Self::FileEmpty
            | Self::InvalidDocument
            | Self::NoPages => Some(Stage::Validation),
            Self::MemoryLimitExceeded => Some(Stage::ResourceCheck),
            Self::AnchorNotFound => Some(Stage::AnchorSearch),
            Self::HeaderNotRecognized
            | Self::TerminatorNotFound
            | Self::EmptyTableRegion
            | Self::InvalidTableBoundary => Some(Stage::BoundaryResolution),
            Self::NoRowsExtracted => Some(Stage::RowParsing),
            Self::Timeout | Self::WorkerError | Self::Unknown => Some(Stage::Worker),
        }
    }
}
