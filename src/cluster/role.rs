use tokio::sync::watch;

/// What a member currently is, as observed by that member.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum NodeRole {
    /// Mirroring the member at `leader_index`.
    Backup { leader_index: usize },
    Leader,
}

pub(crate) fn new(initial_role: NodeRole) -> (NodeRoleNotifier, NodeRoleListener) {
    let (snd, rcv) = watch::channel(initial_role);

    (NodeRoleNotifier { snd }, NodeRoleListener { rcv })
}

pub(crate) struct NodeRoleNotifier {
    snd: watch::Sender<NodeRole>,
}

impl NodeRoleNotifier {
    pub(crate) fn notify_new_role(&self, new_role: NodeRole) {
        let _ = self.snd.send(new_role);
    }
}

/// NodeRoleListener observes role changes of one member. Like any watch, intermediate roles may
/// be clobbered if the listener does not keep up; only the most recent role is guaranteed.
#[derive(Clone)]
pub struct NodeRoleListener {
    rcv: watch::Receiver<NodeRole>,
}

impl NodeRoleListener {
    pub fn current(&self) -> NodeRole {
        *self.rcv.borrow()
    }

    /// Waits for the next role change. None once the member has exited.
    pub async fn next(&mut self) -> Option<NodeRole> {
        match self.rcv.changed().await {
            Ok(_) => Some(*self.rcv.borrow()),
            Err(_) => None,
        }
    }

    /// Waits until the member reports `role`, returning false if it exits first.
    pub async fn wait_for(&mut self, role: NodeRole) -> bool {
        if self.current() == role {
            return true;
        }
        while let Some(next) = self.next().await {
            if next == role {
                return true;
            }
        }

        false
    }
}
