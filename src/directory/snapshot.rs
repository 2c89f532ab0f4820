use bytes::Bytes;

const FIELD_TERMINATOR: char = '.';
const ESCAPE: char = '\\';

/// Snapshot is the full contents of a user directory, as shipped from the leader to its backups
/// after every mutation. Connection bindings are leader-local and are never part of it.
#[derive(Clone, Debug, Default, Eq, PartialEq)]
pub(crate) struct Snapshot {
    pub(crate) accounts: Vec<AccountRecord>,
}

#[derive(Clone, Debug, Eq, PartialEq)]
pub(crate) struct AccountRecord {
    pub(crate) username: String,
    pub(crate) password: String,
    pub(crate) mailbox: Vec<String>,
}

#[derive(Debug, thiserror::Error, Eq, PartialEq)]
pub(crate) enum SnapshotDecodeError {
    #[error("Snapshot frame is not valid UTF-8")]
    NotUtf8,
    #[error("Snapshot frame ends inside an escape sequence")]
    DanglingEscape,
    #[error("Snapshot frame ends in the middle of a record")]
    Truncated,
    #[error("Mailbox length '{0}' is not a number")]
    MalformedMailboxLength(String),
}

impl Snapshot {
    /// Wire format, one record per account, records concatenated:
    /// `username.password.mailboxLength.mail1.mail2...` with every field terminated by `.`.
    /// Dots and backslashes inside fields are backslash-escaped.
    pub(crate) fn encode(&self) -> Bytes {
        let mut frame = String::new();
        for account in &self.accounts {
            push_field(&mut frame, &account.username);
            push_field(&mut frame, &account.password);
            push_field(&mut frame, &account.mailbox.len().to_string());
            for mail in &account.mailbox {
                push_field(&mut frame, mail);
            }
        }

        Bytes::from(frame)
    }

    pub(crate) fn decode(frame: &[u8]) -> Result<Self, SnapshotDecodeError> {
        let text = std::str::from_utf8(frame).map_err(|_| SnapshotDecodeError::NotUtf8)?;
        let mut fields = split_fields(text)?.into_iter();

        let mut accounts = Vec::new();
        while let Some(username) = fields.next() {
            let password = fields.next().ok_or(SnapshotDecodeError::Truncated)?;
            let mailbox_len = fields.next().ok_or(SnapshotDecodeError::Truncated)?;
            let mailbox_len: usize = mailbox_len
                .parse()
                .map_err(|_| SnapshotDecodeError::MalformedMailboxLength(mailbox_len.clone()))?;

            let mut mailbox = Vec::with_capacity(mailbox_len.min(fields.len()));
            for _ in 0..mailbox_len {
                mailbox.push(fields.next().ok_or(SnapshotDecodeError::Truncated)?);
            }

            accounts.push(AccountRecord {
                username,
                password,
                mailbox,
            });
        }

        Ok(Snapshot { accounts })
    }
}

fn push_field(frame: &mut String, field: &str) {
    for c in field.chars() {
        if c == FIELD_TERMINATOR || c == ESCAPE {
            frame.push(ESCAPE);
        }
        frame.push(c);
    }
    frame.push(FIELD_TERMINATOR);
}

fn split_fields(text: &str) -> Result<Vec<String>, SnapshotDecodeError> {
    let mut fields = Vec::new();
    let mut current = String::new();
    let mut chars = text.chars();

    while let Some(c) = chars.next() {
        match c {
            ESCAPE => current.push(chars.next().ok_or(SnapshotDecodeError::DanglingEscape)?),
            FIELD_TERMINATOR => fields.push(std::mem::take(&mut current)),
            other => current.push(other),
        }
    }

    // Every field is terminated, so anything left over is a partial field.
    if !current.is_empty() {
        return Err(SnapshotDecodeError::Truncated);
    }

    Ok(fields)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn record(username: &str, password: &str, mailbox: &[&str]) -> AccountRecord {
        AccountRecord {
            username: username.to_string(),
            password: password.to_string(),
            mailbox: mailbox.iter().map(|m| m.to_string()).collect(),
        }
    }

    #[test]
    fn records_are_dot_delimited_and_concatenated() {
        let snapshot = Snapshot {
            accounts: vec![record("alice", "p1", &[]), record("bob", "p2", &["<alice> hi", "<alice> yo"])],
        };

        assert_eq!(&snapshot.encode()[..], &b"alice.p1.0.bob.p2.2.<alice> hi.<alice> yo."[..]);
    }

    #[test]
    fn decodes_concatenated_records() {
        let decoded = Snapshot::decode(b"alice.p1.0.bob.p2.2.<alice> hi.<alice> yo.").unwrap();

        assert_eq!(
            decoded,
            Snapshot {
                accounts: vec![record("alice", "p1", &[]), record("bob", "p2", &["<alice> hi", "<alice> yo"])],
            }
        );
    }

    #[test]
    fn fields_containing_dots_survive() {
        let snapshot = Snapshot {
            accounts: vec![record("j.doe", "pa\\ss.", &["<x.y> see you at 5.30."])],
        };

        let encoded = snapshot.encode();
        assert_eq!(&encoded[..], &b"j\\.doe.pa\\\\ss\\..1.<x\\.y> see you at 5\\.30\\.."[..]);
        assert_eq!(Snapshot::decode(&encoded).unwrap(), snapshot);
    }

    #[test]
    fn empty_directory_is_empty_frame() {
        assert!(Snapshot::default().encode().is_empty());
        assert_eq!(Snapshot::decode(b"").unwrap(), Snapshot::default());
    }

    #[test]
    fn empty_mailbox_entries_are_kept() {
        let snapshot = Snapshot {
            accounts: vec![record("alice", "", &["", "<bob> "])],
        };

        assert_eq!(Snapshot::decode(&snapshot.encode()).unwrap(), snapshot);
    }

    #[test]
    fn malformed_frames_are_rejected() {
        assert_eq!(Snapshot::decode(b"alice.p1."), Err(SnapshotDecodeError::Truncated));
        assert_eq!(Snapshot::decode(b"alice.p1.2.one."), Err(SnapshotDecodeError::Truncated));
        assert_eq!(Snapshot::decode(b"alice.p1.0.bob"), Err(SnapshotDecodeError::Truncated));
        assert_eq!(Snapshot::decode(b"alice.p1.0\\"), Err(SnapshotDecodeError::DanglingEscape));
        assert_eq!(
            Snapshot::decode(b"alice.p1.lots."),
            Err(SnapshotDecodeError::MalformedMailboxLength("lots".to_string()))
        );
        assert_eq!(Snapshot::decode(&[0xc3, 0x28]), Err(SnapshotDecodeError::NotUtf8));
    }
}
