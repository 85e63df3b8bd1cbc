pub mod registry;
pub mod codec;
pub mod socket;
pub mod endpoint;
pub mod transport;

pub use registry::*;
pub use codec::*;
pub use socket::*;
pub use endpoint::*;
pub use transport::*;
