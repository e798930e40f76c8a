pub mod completion;
pub mod config;
pub mod connection;
pub mod driver;
pub mod error;
pub mod memory;
pub mod protocol;
pub mod report;
pub mod transport;

pub use config::BenchConfig;
pub use connection::{Connection, TeardownSummary};
pub use driver::{Driver, StopHandle};
pub use error::{BenchError, CodecError, ConfigError, TransportError};
pub use protocol::{Command, Encoding, MessageTemplate, ReplyMode, TemplateTable};
pub use report::{ContextReport, ContextState, RunReport, StopReason};
pub use transport::{build_fabric, Backend, Fabric, LoopbackFabric, TransportConfig};
