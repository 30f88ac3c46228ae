//! Application services: fan-out, feed reads, and event ingestion.

pub mod error;
pub mod fanout;
pub mod feed;
pub mod ingest;
pub mod repos;
pub mod stream;
