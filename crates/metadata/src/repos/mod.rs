//! Repository traits for metadata operations.

pub mod uploads;

pub use uploads::{ChunkReceipt, UploadRepo};
