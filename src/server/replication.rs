use crate::cluster::{MemberIndex, TopologyPublication};
use crate::directory::Snapshot;
use crate::server::outbox::Outbox;
use std::net::SocketAddr;

/// BackupLink is the leader's end of one backup connection.
#[derive(Debug)]
pub(crate) struct BackupLink {
    pub(crate) member: MemberIndex,
    pub(crate) address: SocketAddr,
    pub(crate) outbox: Outbox,
}

/// ReplicationChannel pushes full directory snapshots to every backup.
///
/// Delivery is fire-and-forget. Nothing waits for backups to acknowledge, and a failed send to one
/// backup neither blocks the others nor fails the operation that triggered it. A leader crash
/// between a mutation and its snapshot reaching a backup therefore loses that one update: backups
/// only ever hold the last snapshot they fully received.
pub(crate) struct ReplicationChannel {
    logger: slog::Logger,
    backups: Vec<BackupLink>,
}

impl ReplicationChannel {
    pub(crate) fn new(logger: slog::Logger, mut backups: Vec<BackupLink>) -> Self {
        backups.sort_by_key(|link| link.member);
        ReplicationChannel { logger, backups }
    }

    /// Backup addresses in succession order.
    pub(crate) fn backup_addresses(&self) -> Vec<SocketAddr> {
        self.backups.iter().map(|link| link.address).collect()
    }

    pub(crate) fn publication(&self, banner: &str) -> TopologyPublication {
        TopologyPublication::new(self.backup_addresses(), banner)
    }

    /// Sends the topology publication to every backup. Must precede the first snapshot.
    pub(crate) fn publish_topology(&self) {
        let frame = self.publication("").encode();
        for link in &self.backups {
            if link.outbox.send(frame.clone()).is_err() {
                slog::warn!(self.logger, "Failed to publish topology to backup {:?}", link.member);
            }
        }
    }

    pub(crate) fn replicate(&self, snapshot: &Snapshot) {
        if self.backups.is_empty() {
            return;
        }

        let frame = snapshot.encode();
        slog::debug!(
            self.logger,
            "Replicating {} accounts ({} bytes) to {} backups",
            snapshot.accounts.len(),
            frame.len(),
            self.backups.len()
        );
        for link in &self.backups {
            if link.outbox.send(frame.clone()).is_err() {
                slog::warn!(
                    self.logger,
                    "Replication to backup {:?} @ {} failed, continuing without it",
                    link.member,
                    link.address
                );
            }
        }
    }

    /// Admits a backup that joined after discovery. It is brought up to date right away with the
    /// current topology and a full snapshot. A rejoining member replaces its old link.
    pub(crate) fn attach(&mut self, link: BackupLink, snapshot: &Snapshot) {
        self.backups.retain(|existing| existing.member != link.member);

        let publication = TopologyPublication::new(self.backups_with(&link), "").encode();
        let bootstrap = link
            .outbox
            .send(publication)
            .and_then(|_| link.outbox.send(snapshot.encode()));
        if bootstrap.is_err() {
            slog::warn!(self.logger, "Late backup {:?} went away before it was synced", link.member);
        }

        slog::info!(self.logger, "Attached late backup {:?} @ {}", link.member, link.address);
        self.backups.push(link);
        self.backups.sort_by_key(|link| link.member);
    }

    fn backups_with(&self, link: &BackupLink) -> Vec<SocketAddr> {
        let mut addresses: Vec<(MemberIndex, SocketAddr)> =
            self.backups.iter().map(|l| (l.member, l.address)).collect();
        addresses.push((link.member, link.address));
        addresses.sort_by_key(|(member, _)| *member);

        addresses.into_iter().map(|(_, address)| address).collect()
    }
}
