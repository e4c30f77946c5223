//! API client: the transport seam, authenticated dispatch, read
//! batching, and the normalized error taxonomy.

pub mod batch;
pub mod client;
pub mod error;
pub mod transport;

pub use batch::BatchCoalescer;
pub use client::{Dispatcher, RequestOptions};
pub use error::ApiError;
pub use transport::{HttpRequest, HttpResponse, HttpTransport, Method, ReqwestTransport};
