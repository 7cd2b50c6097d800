pub mod fetcher;

pub use fetcher::{ReqwestFetcher, source_host};
