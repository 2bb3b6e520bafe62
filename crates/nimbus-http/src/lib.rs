//! # nimbus-http
//!
//! REST client for the Nimbus backend.
//!
//! Every request carries the project API key and exchanges JSON. Successful
//! calls yield an [`ApiResponse`] with the decoded body and response
//! metadata; anything else is normalized into an [`ApiError`].
//!
//! ```rust,ignore
//! use nimbus_http::{HttpClient, RequestConfig};
//!
//! let http = HttpClient::new("https://api.example.com/api/v1", "my-key")?;
//! let rows = http
//!     .get::<Vec<Order>>("/tables/orders", Some(&RequestConfig::new().query("limit", "10")))
//!     .await?;
//! ```

mod client;
mod error;
mod request;

pub use client::{ApiResponse, HttpClient, ResponseMeta, API_KEY_HEADER, DEFAULT_TIMEOUT};
pub use error::ApiError;
pub use request::RequestConfig;
