//! Run engine document types.

pub mod document;

pub use document::{
    new_uid, now_secs, DataKey, DescriptorDoc, Document, DocumentKind, EventDoc, ExitStatus,
    StartDoc, StopDoc,
};
