//! ## RADIUS wire codec
//!
//! [RFC2865]: https://www.rfc-editor.org/rfc/rfc2865
//! [RFC2548]: https://www.rfc-editor.org/rfc/rfc2548
//! [RFC2869]: https://www.rfc-editor.org/rfc/rfc2869
//!
//! RADIUS ([RFC2865]) is a UDP-based AAA protocol built from a 20-byte
//! header followed by a sequence of type-length-value attributes. This
//! crate decodes and encodes that wire format and implements the
//! authenticator and attribute-encryption primitives ([RFC2865] §3/§5.2,
//! [RFC2548], [RFC2869] §5.14) a proxy needs to re-sign and re-encrypt a
//! packet as it moves between two shared secrets.

pub mod crypto;
pub mod error;
pub mod message;

pub use error::{Code, Error};
pub use message::{Attribute, RadiusMessage, VendorAttribute};
