//! PBX CDR API integration
//!
//! `PbxClient` talks to the PBX's paginated CDR endpoint and implements
//! `CdrFetcher::fetch_page`; page iteration comes from the trait.
//!
//! # Usage
//!
//! ```rust,ignore
//! use cdrsync_core::traits::{CdrFetcher, NoopSink};
//! use cdrsync_pbx::PbxClient;
//!
//! let client = PbxClient::new(&config.pbx)?;
//! let records = client.fetch_all(day, day, &mut NoopSink).await?;
//! ```

mod client;
mod types;

pub use client::PbxClient;
pub use types::*;
