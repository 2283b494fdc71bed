pub mod config;
pub mod consolidator;
pub mod error;
pub mod fee;
pub mod finalizer;
pub mod pipeline;
pub mod selector;
pub mod test_utils;
pub mod transaction;
pub mod types;
pub mod uploader;
pub mod wallet;

pub use config::{UploadConfig, UploadContext};
pub use error::{AppError, Stage, WalletError};
pub use finalizer::{Finalizer, HttpFinalizer};
pub use pipeline::{Pipeline, run_upload};
pub use uploader::{UploadRequest, UploadResult};
pub use wallet::WalletSigner;
