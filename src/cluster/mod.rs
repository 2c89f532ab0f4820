//! Cluster membership as seen by one process, and the connection plumbing shared by members and
//! clients.
mod connect;
mod role;
mod topology;
mod wire;

pub(crate) use connect::connect_with_timeout;
pub(crate) use connect::ConnectError;
pub(crate) use role::new as new_role_channel;
pub use role::NodeRole;
pub use role::NodeRoleListener;
pub(crate) use role::NodeRoleNotifier;
pub(crate) use topology::port_for;
pub(crate) use topology::ClusterTopology;
pub(crate) use topology::MemberIndex;
pub(crate) use wire::framed_halves;
pub(crate) use wire::FrameReader;
pub(crate) use wire::FrameWriter;
pub(crate) use wire::Hello;
pub(crate) use wire::TopologyPublication;
