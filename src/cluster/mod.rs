pub mod handlers;
pub mod node;
pub mod state;
pub mod timer;

pub use node::Eventer;
pub use state::{ClusterState, MasterRole};
