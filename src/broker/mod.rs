pub mod session;
pub mod transport;

pub use session::{BrokerSession, ConnectionState};
