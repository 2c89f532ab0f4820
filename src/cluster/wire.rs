//! Framing and the small text frames that every connection starts with.
use bytes::Bytes;
use std::net::SocketAddr;
use std::str::FromStr;
use tokio::net::tcp::{OwnedReadHalf, OwnedWriteHalf};
use tokio::net::TcpStream;
use tokio_util::codec::{FramedRead, FramedWrite, LengthDelimitedCodec};

use crate::cluster::topology::MemberIndex;

pub(crate) type FrameReader = FramedRead<OwnedReadHalf, LengthDelimitedCodec>;
pub(crate) type FrameWriter = FramedWrite<OwnedWriteHalf, LengthDelimitedCodec>;

const PUBLICATION_SEPARATOR: char = '@';
const ADDRESS_SEPARATOR: char = ',';
const CLIENT_HELLO: &str = "client";
const BACKUP_HELLO_PREFIX: &str = "backup:";

/// Splits a stream into independently owned, length-delimited read and write halves.
pub(crate) fn framed_halves(stream: TcpStream, max_frame_length: usize) -> (FrameReader, FrameWriter) {
    let (read_half, write_half) = stream.into_split();
    let reader = FramedRead::new(read_half, codec(max_frame_length));
    let writer = FramedWrite::new(write_half, codec(max_frame_length));

    (reader, writer)
}

fn codec(max_frame_length: usize) -> LengthDelimitedCodec {
    LengthDelimitedCodec::builder()
        .max_frame_length(max_frame_length)
        .new_codec()
}

/// Hello is the first frame a peer sends after connecting to a member, declaring its role.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub(crate) enum Hello {
    Client,
    Backup(MemberIndex),
}

#[derive(Debug, thiserror::Error, Eq, PartialEq)]
pub(crate) enum HelloDecodeError {
    #[error("Hello frame is not valid UTF-8")]
    NotUtf8,
    #[error("Unrecognized hello '{0}'")]
    Unrecognized(String),
}

impl Hello {
    pub(crate) fn encode(&self) -> Bytes {
        match self {
            Hello::Client => Bytes::from_static(CLIENT_HELLO.as_bytes()),
            Hello::Backup(index) => Bytes::from(format!("{}{}", BACKUP_HELLO_PREFIX, index)),
        }
    }

    pub(crate) fn decode(frame: &[u8]) -> Result<Self, HelloDecodeError> {
        let text = std::str::from_utf8(frame).map_err(|_| HelloDecodeError::NotUtf8)?;

        if text == CLIENT_HELLO {
            return Ok(Hello::Client);
        }

        text.strip_prefix(BACKUP_HELLO_PREFIX)
            .and_then(|index| usize::from_str(index).ok())
            .map(|index| Hello::Backup(MemberIndex::new(index)))
            .ok_or_else(|| HelloDecodeError::Unrecognized(text.to_string()))
    }
}

/// TopologyPublication is the first frame a member sends on every accepted connection: the
/// addresses of all current backups in succession order, a reserved separator, then a banner.
#[derive(Clone, Debug, Eq, PartialEq)]
pub(crate) struct TopologyPublication {
    pub(crate) backups: Vec<SocketAddr>,
    pub(crate) banner: String,
}

#[derive(Debug, thiserror::Error, Eq, PartialEq)]
pub(crate) enum PublicationDecodeError {
    #[error("Publication frame is not valid UTF-8")]
    NotUtf8,
    #[error("Publication frame is missing the '@' separator")]
    MissingSeparator,
    #[error("Publication frame has malformed address '{0}'")]
    MalformedAddress(String),
}

impl TopologyPublication {
    pub(crate) fn new(backups: Vec<SocketAddr>, banner: impl Into<String>) -> Self {
        TopologyPublication {
            backups,
            banner: banner.into(),
        }
    }

    pub(crate) fn encode(&self) -> Bytes {
        let mut frame = String::new();
        for addr in &self.backups {
            frame.push_str(&addr.to_string());
            frame.push(ADDRESS_SEPARATOR);
        }
        frame.push(PUBLICATION_SEPARATOR);
        frame.push_str(&self.banner);

        Bytes::from(frame)
    }

    pub(crate) fn decode(frame: &[u8]) -> Result<Self, PublicationDecodeError> {
        let text = std::str::from_utf8(frame).map_err(|_| PublicationDecodeError::NotUtf8)?;
        let separator_at = text
            .find(PUBLICATION_SEPARATOR)
            .ok_or(PublicationDecodeError::MissingSeparator)?;
        let (address_list, rest) = text.split_at(separator_at);

        let mut backups = Vec::new();
        for address in address_list.split(ADDRESS_SEPARATOR).filter(|a| !a.is_empty()) {
            let addr = SocketAddr::from_str(address)
                .map_err(|_| PublicationDecodeError::MalformedAddress(address.to_string()))?;
            backups.push(addr);
        }

        Ok(TopologyPublication {
            backups,
            banner: rest[PUBLICATION_SEPARATOR.len_utf8()..].to_string(),
        })
    }
}
