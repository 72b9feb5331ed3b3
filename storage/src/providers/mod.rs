pub mod aws;
pub mod azure;

pub use aws::{ProviderKind, S3Provider};
pub use azure::AzureBlobProvider;
