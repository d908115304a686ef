pub mod codec;
mod charstring;
mod error;
mod headers;
mod mailboxes;
mod message;
mod mime;

pub use error::MimeError;
pub type Result<T> = std::result::Result<T, MimeError>;

pub use charstring::*;
pub use headers::*;
pub use mailboxes::*;
pub use message::*;
pub use mime::*;
