//! Redoubt harvest client
//!
//! Drives the negotiation with a redoubt server: solve whatever tasks the
//! server hands out, resend the answers, and once the server delivers
//! products write them, together with the private material generated along
//! the way, under a local root directory.

pub mod error;
pub mod persist;
pub mod session;
pub mod transport;

pub use error::{ClientError, PersistError};
pub use session::Session;
pub use transport::{HttpTransport, Transport};
