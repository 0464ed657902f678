pub mod cluster;
pub mod config;
pub mod error;
pub mod network;
pub mod protocol;
pub mod shutdown;
pub mod store;
pub mod subscription;

pub use cluster::{Eventer, MasterRole};
pub use config::{NodeAddr, NodeConfig};
pub use error::{EventerError, Result};
pub use protocol::{args, Event, EventArgs};
pub use subscription::Subscription;
