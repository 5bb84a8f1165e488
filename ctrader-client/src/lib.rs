// cTrader Open API session layer for the copy bridge.
// Exposes the message contracts, transport seam, session manager and symbol
// catalog used by the bridge server.

pub mod catalog;
pub mod error;
pub mod messages;
pub mod session;
pub mod testing;
pub mod transport;

pub use catalog::SymbolCatalog;
pub use error::ClientError;
pub use session::{SessionConfig, SessionEvent, SessionHandle, SessionPhase};
pub use transport::{Connector, TcpConnector, Transport};
