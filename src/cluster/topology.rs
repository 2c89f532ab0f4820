use std::collections::BTreeMap;
use std::convert::TryFrom;
use std::fmt;
use std::net::{IpAddr, SocketAddr};

/// MemberIndex is a member's fixed position in the succession order. Index 0 is the original
/// leader, and a member listens on `base_port + index`.
#[derive(Copy, Clone, Eq, Ord, PartialEq, PartialOrd, Hash)]
pub(crate) struct MemberIndex(usize);

impl MemberIndex {
    pub(crate) const ORIGINAL_LEADER: MemberIndex = MemberIndex(0);

    pub(crate) fn new(index: usize) -> Self {
        MemberIndex(index)
    }

    pub(crate) fn as_usize(&self) -> usize {
        self.0
    }

    fn incr(&mut self) {
        self.0 += 1;
    }
}

impl fmt::Debug for MemberIndex {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl fmt::Display for MemberIndex {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// ClusterTopology is one process's view of the cluster: which member address sits at which
/// succession index, who it currently believes is leader, and (for server nodes) its own index.
///
/// `leader` only moves forward. Once a node observes itself as leader, it stays leader for the
/// remainder of the process.
#[derive(Clone, Debug)]
pub(crate) struct ClusterTopology {
    base_port: u16,
    members: BTreeMap<MemberIndex, IpAddr>,
    leader: MemberIndex,
    me: Option<MemberIndex>,
}

impl ClusterTopology {
    /// View held by a server node. Only the entry point (the original leader) is known up front.
    pub(crate) fn for_member(base_port: u16, entry_point: IpAddr, me: MemberIndex) -> Self {
        let mut members = BTreeMap::new();
        members.insert(MemberIndex::ORIGINAL_LEADER, entry_point);

        ClusterTopology {
            base_port,
            members,
            leader: MemberIndex::ORIGINAL_LEADER,
            me: Some(me),
        }
    }

    /// View held by a chat client, which is never a member itself.
    pub(crate) fn for_client(base_port: u16, entry_point: IpAddr) -> Self {
        let mut members = BTreeMap::new();
        members.insert(MemberIndex::ORIGINAL_LEADER, entry_point);

        ClusterTopology {
            base_port,
            members,
            leader: MemberIndex::ORIGINAL_LEADER,
            me: None,
        }
    }

    pub(crate) fn leader(&self) -> MemberIndex {
        self.leader
    }

    pub(crate) fn me(&self) -> Option<MemberIndex> {
        self.me
    }

    pub(crate) fn is_self_leader(&self) -> bool {
        self.me == Some(self.leader)
    }

    /// Port convention: `base_port + index`. None if the sum does not fit in a port number.
    pub(crate) fn port_of(&self, index: MemberIndex) -> Option<u16> {
        port_for(self.base_port, index)
    }

    pub(crate) fn address_of(&self, index: MemberIndex) -> Option<SocketAddr> {
        let ip = self.members.get(&index)?;
        let port = self.port_of(index)?;
        Some(SocketAddr::new(*ip, port))
    }

    /// Inverse of the port convention.
    pub(crate) fn index_of(&self, addr: &SocketAddr) -> Option<MemberIndex> {
        addr.port()
            .checked_sub(self.base_port)
            .map(|offset| MemberIndex::new(offset as usize))
    }

    /// Highest member index this view knows about, including our own.
    pub(crate) fn member_bound(&self) -> MemberIndex {
        let highest_known = self
            .members
            .keys()
            .next_back()
            .copied()
            .unwrap_or(MemberIndex::ORIGINAL_LEADER);

        match self.me {
            Some(me) if me > highest_known => me,
            _ => highest_known,
        }
    }

    /// Records every address in a topology publication. Addresses whose port does not map onto a
    /// member index, or that claim the current leader's slot or earlier, are ignored.
    pub(crate) fn learn_backups(&mut self, backups: &[SocketAddr]) {
        for addr in backups {
            if let Some(index) = self.index_of(addr) {
                if index > self.leader {
                    self.members.insert(index, addr.ip());
                }
            }
        }
    }

    /// Leader-side: forget every backup learnt so far and replace them with those that actually
    /// joined during discovery.
    pub(crate) fn replace_backups(&mut self, backups: &[SocketAddr]) {
        let leader = self.leader;
        self.members.retain(|index, _| *index <= leader);
        self.learn_backups(backups);
    }

    /// Addresses of every known member after the leader, in succession order.
    pub(crate) fn backups(&self) -> Vec<SocketAddr> {
        self.members
            .keys()
            .filter(|index| **index > self.leader)
            .filter_map(|index| self.address_of(*index))
            .collect()
    }

    /// Advances the believed leader by exactly one position and returns the new leader index.
    pub(crate) fn advance_leader(&mut self) -> MemberIndex {
        assert!(
            !self.is_self_leader(),
            "A member that has become leader never advances past itself"
        );
        self.leader.incr();
        self.leader
    }

    /// Client-side: we connected to `index` after walking past failed candidates.
    pub(crate) fn settle_leader(&mut self, index: MemberIndex) {
        assert!(
            index >= self.leader,
            "Leader index only moves forward. Expected [input] {:?} >= {:?} [current]",
            index,
            self.leader,
        );
        self.leader = index;
    }
}

pub(crate) fn port_for(base_port: u16, index: MemberIndex) -> Option<u16> {
    let offset = u16::try_from(index.as_usize()).ok()?;
    base_port.checked_add(offset)
}
