use crate::api::options::{ChatOptions, ChatOptionsValidated};
use crate::cluster::{new_role_channel, port_for, ClusterTopology, MemberIndex, NodeRole, NodeRoleListener};
use crate::directory::UserDirectory;
use crate::replica::{open_leader_link, BackupReplicaAgent};
use crate::server::{DiscoveryMode, LeaderCoordinator};
use std::convert::TryFrom;
use std::io;
use std::net::{IpAddr, SocketAddr};
use tokio::net::TcpListener;
use tokio::task::JoinHandle;

pub struct ChatNodeConfig {
    /// Position in succession order. 0 is the original leader.
    pub member_index: usize,
    /// Address of the original leader. Every member finds the cluster through it.
    pub entry_point: IpAddr,
    pub bind_ip: IpAddr,
    pub base_port: u16,
    /// Number of backups in the cluster, so members are `0..=replica_count`.
    pub replica_count: usize,
    pub info_logger: slog::Logger,
    pub options: ChatOptions,
}

#[derive(Debug, thiserror::Error)]
pub enum ChatNodeCreationError {
    #[error("Illegal options for configuring node: {0}")]
    IllegalOptions(String),
    #[error("Member index {member_index} is beyond the replica count {replica_count}")]
    MemberIndexOutOfRange { member_index: usize, replica_count: usize },
    #[error("Base port {base_port} plus member index {member_index} is not a valid port")]
    PortOutOfRange { base_port: u16, member_index: usize },
    #[error("Failed to bind {0}: {1}")]
    Bind(SocketAddr, io::Error),
    #[error("Leader unreachable: {0}")]
    LeaderUnreachable(String),
}

#[derive(Debug, thiserror::Error)]
pub enum NodeError {
    #[error("Succession failed: {0}")]
    Succession(String),
    #[error("Node task failed: {0}")]
    Crashed(String),
}

/// ChatNode is a running cluster member. The member keeps running in the background whether or
/// not this handle is held.
pub struct ChatNode {
    local_addr: SocketAddr,
    role_listener: NodeRoleListener,
    task: JoinHandle<Result<(), NodeError>>,
}

impl ChatNode {
    pub fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }

    pub fn role_listener(&self) -> NodeRoleListener {
        self.role_listener.clone()
    }

    /// Resolves only if the member stops, which a healthy member never does.
    pub async fn wait(self) -> Result<(), NodeError> {
        match self.task.await {
            Ok(result) => result,
            Err(e) => Err(NodeError::Crashed(e.to_string())),
        }
    }
}

/// Binds this member's port and joins the cluster: the original leader starts discovering its
/// backups, any other member connects to the original leader and starts mirroring it.
pub async fn try_create_chat_node(config: ChatNodeConfig) -> Result<ChatNode, ChatNodeCreationError> {
    let options = ChatOptionsValidated::try_from(config.options)
        .map_err(|e| ChatNodeCreationError::IllegalOptions(e.to_string()))?;

    if config.member_index > config.replica_count {
        return Err(ChatNodeCreationError::MemberIndexOutOfRange {
            member_index: config.member_index,
            replica_count: config.replica_count,
        });
    }
    let me = MemberIndex::new(config.member_index);
    let port = port_for(config.base_port, me).ok_or(ChatNodeCreationError::PortOutOfRange {
        base_port: config.base_port,
        member_index: config.member_index,
    })?;

    let bind_addr = SocketAddr::new(config.bind_ip, port);
    let listener = TcpListener::bind(bind_addr)
        .await
        .map_err(|e| ChatNodeCreationError::Bind(bind_addr, e))?;
    let local_addr = listener
        .local_addr()
        .map_err(|e| ChatNodeCreationError::Bind(bind_addr, e))?;

    let logger = config.info_logger.new(slog::o!("member" => config.member_index));
    slog::info!(logger, "Listening on {}", local_addr);
    let topology = ClusterTopology::for_member(config.base_port, config.entry_point, me);

    if me == MemberIndex::ORIGINAL_LEADER {
        let (role_notifier, role_listener) = new_role_channel(NodeRole::Leader);
        let coordinator = LeaderCoordinator::new(
            logger,
            listener,
            topology,
            UserDirectory::new(),
            config.replica_count,
            options,
            role_notifier,
        );
        let task = tokio::spawn(async move {
            coordinator.run(DiscoveryMode::WaitForAll).await;
            Ok::<(), NodeError>(())
        });

        return Ok(ChatNode {
            local_addr,
            role_listener,
            task,
        });
    }

    let leader_addr = topology
        .address_of(MemberIndex::ORIGINAL_LEADER)
        .ok_or_else(|| ChatNodeCreationError::LeaderUnreachable("no address for the original leader".to_string()))?;
    let link = open_leader_link(leader_addr, me, &options)
        .await
        .map_err(|e| ChatNodeCreationError::LeaderUnreachable(e.to_string()))?;

    let (role_notifier, role_listener) = new_role_channel(NodeRole::Backup { leader_index: 0 });
    let discovery_timeout = options.discovery_timeout;
    let agent = BackupReplicaAgent::new(logger, me, listener, topology, config.replica_count, options, role_notifier);
    let task = tokio::spawn(async move {
        let coordinator = agent
            .run(link)
            .await
            .map_err(|e| NodeError::Succession(e.to_string()))?;
        coordinator.run(DiscoveryMode::Bounded(discovery_timeout)).await;
        Ok::<(), NodeError>(())
    });

    Ok(ChatNode {
        local_addr,
        role_listener,
        task,
    })
}
