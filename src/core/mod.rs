pub mod document;
pub mod error;
pub mod io_utils;

pub use document::{
    DEFAULT_META_KEY, DEFAULT_RESERVED_PREFIX, Document, ENVELOPE_VERSION, Envelope,
    ExportEnvelope, MetaRecord, format_timestamp, is_reserved_key, now_timestamp,
    serialized_len, without_key,
};
pub use error::{Result, SyncError};
