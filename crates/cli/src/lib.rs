//! Resumable upload client for Parcel.
//!
//! [`UploadDriver`] runs the client side of the chunked upload protocol over
//! any [`UploadTransport`]; [`HttpTransport`] talks to a `parceld` server.

pub mod config;
pub mod driver;
pub mod http;

pub use config::{ClientConfig, client_config_path, load_client_config};
pub use driver::{
    DriverError, DriverOptions, Progress, TransportError, UploadDriver, UploadReport,
    UploadTransport,
};
pub use http::HttpTransport;
