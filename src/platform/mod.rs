//! Remote platform integration
//!
//! Request signing and the signed HTTP client. Everything that knows the
//! platform's wire conventions lives here; the service layer only sees
//! typed calls and the error taxonomy.

pub mod client;
pub mod signer;

pub use client::{ApiResponse, IncomingMessage, PlatformClient, SessionSummary};
pub use signer::RequestSigner;
