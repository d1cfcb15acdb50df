// Copyright (c) 2024-present, spectre-store
// This source code is licensed under both the Apache 2.0 and MIT License
// (found in the LICENSE-* files in the repository)

use crate::coding::{read_string, write_string, DecodeError, EncodeError};
use byteorder::{ReadBytesExt, WriteBytesExt};
use serde::{Deserialize, Serialize};
use std::io::{Read, Write};
use varint_rs::{VarintReader, VarintWriter};

/// Timestamp in integer seconds since the unix epoch
pub type UnixTimestamp = u64;

/// The kind of mutation that produced an event
///
/// The discriminant order (CREATE < UPDATE < DELETE) is used as the
/// deterministic tie-break for events sharing a timestamp.
#[derive(Copy, Clone, Debug, Eq, PartialEq, Ord, PartialOrd, Hash, Serialize, Deserialize)]
pub enum Verb {
    /// Resource was created
    Create,

    /// Resource was updated (new snapshot)
    Update,

    /// Resource was deleted
    Delete,
}

impl TryFrom<u8> for Verb {
    type Error = ();

    fn try_from(value: u8) -> Result<Self, Self::Error> {
        match value {
            0 => Ok(Self::Create),
            1 => Ok(Self::Update),
            2 => Ok(Self::Delete),
            _ => Err(()),
        }
    }
}

impl From<Verb> for u8 {
    fn from(value: Verb) -> Self {
        match value {
            Verb::Create => 0,
            Verb::Update => 1,
            Verb::Delete => 2,
        }
    }
}

/// Coarse health classification derived from a resource snapshot
#[derive(
    Copy, Clone, Debug, Default, Eq, PartialEq, Ord, PartialOrd, Hash, Serialize, Deserialize,
)]
pub enum Status {
    /// Resource is operating normally
    Healthy,

    /// Resource is degraded but functional
    Warning,

    /// Resource is failing
    Error,

    /// No classification rule matched
    #[default]
    Unknown,
}

impl TryFrom<u8> for Status {
    type Error = ();

    fn try_from(value: u8) -> Result<Self, ()> {
        match value {
            0 => Ok(Self::Healthy),
            1 => Ok(Self::Warning),
            2 => Ok(Self::Error),
            3 => Ok(Self::Unknown),
            _ => Err(()),
        }
    }
}

impl From<Status> for u8 {
    fn from(value: Status) -> Self {
        match value {
            Status::Healthy => 0,
            Status::Warning => 1,
            Status::Error => 2,
            Status::Unknown => 3,
        }
    }
}

/// Status classification plus a human-readable message
#[derive(Clone, Debug, Default, Eq, PartialEq, Serialize, Deserialize)]
pub struct StatusSummary {
    /// Derived status
    pub status: Status,

    /// Short human-readable explanation
    pub message: String,
}

impl StatusSummary {
    /// Creates a new status summary.
    pub fn new<M: Into<String>>(status: Status, message: M) -> Self {
        Self {
            status,
            message: message.into(),
        }
    }
}

/// Identity of a Kubernetes resource
///
/// `uid` disambiguates recreations under the same name.
#[derive(Clone, Debug, Default, Eq, PartialEq, Hash, Serialize, Deserialize)]
pub struct ResourceIdentity {
    /// API group (empty string for the core group)
    pub group: String,

    /// API version
    pub version: String,

    /// Resource kind
    pub kind: String,

    /// Namespace (empty string for cluster-scoped resources)
    pub namespace: String,

    /// Resource name
    pub name: String,

    /// Unique id assigned by the API server
    pub uid: String,

    /// For Kubernetes `Event` resources: the uid of the object the
    /// event is about, lifted out of the payload during enrichment
    pub involved_object_uid: Option<String>,
}

impl ResourceIdentity {
    /// Starts building an identity.
    #[must_use]
    pub fn builder() -> ResourceIdentityBuilder {
        ResourceIdentityBuilder::default()
    }
}

impl std::fmt::Display for ResourceIdentity {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}/{} {}/{}", self.group, self.kind, self.namespace, self.name)
    }
}

/// Builder for [`ResourceIdentity`]
#[derive(Default)]
pub struct ResourceIdentityBuilder(ResourceIdentity);

impl ResourceIdentityBuilder {
    /// Sets the API group.
    #[must_use]
    pub fn group<S: Into<String>>(mut self, group: S) -> Self {
        self.0.group = group.into();
        self
    }

    /// Sets the API version.
    #[must_use]
    pub fn version<S: Into<String>>(mut self, version: S) -> Self {
        self.0.version = version.into();
        self
    }

    /// Sets the resource kind.
    #[must_use]
    pub fn kind<S: Into<String>>(mut self, kind: S) -> Self {
        self.0.kind = kind.into();
        self
    }

    /// Sets the namespace.
    #[must_use]
    pub fn namespace<S: Into<String>>(mut self, namespace: S) -> Self {
        self.0.namespace = namespace.into();
        self
    }

    /// Sets the resource name.
    #[must_use]
    pub fn name<S: Into<String>>(mut self, name: S) -> Self {
        self.0.name = name.into();
        self
    }

    /// Sets the uid.
    #[must_use]
    pub fn uid<S: Into<String>>(mut self, uid: S) -> Self {
        self.0.uid = uid.into();
        self
    }

    /// Builds the identity.
    #[must_use]
    pub fn build(self) -> ResourceIdentity {
        self.0
    }
}

/// Stable event identifier, derived from (uid, timestamp, verb)
#[derive(Copy, Clone, Debug, Eq, PartialEq, Ord, PartialOrd, Hash)]
pub struct EventId(u128);

impl EventId {
    pub(crate) fn derive(uid: &str, ts: UnixTimestamp, verb: Verb) -> Self {
        let mut buf = Vec::with_capacity(uid.len() + 9);
        buf.extend(uid.as_bytes());
        buf.extend(ts.to_le_bytes());
        buf.push(u8::from(verb));
        Self(xxhash_rust::xxh3::xxh3_128(&buf))
    }
}

impl std::fmt::Display for EventId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{:032x}", self.0)
    }
}

/// An immutable resource mutation record
///
/// The payload is the full resource snapshot at the time of the
/// mutation, kept as an opaque byte string.
#[derive(Clone, Debug, Eq, PartialEq, Serialize, Deserialize)]
pub struct Event {
    /// Timestamp of the mutation
    pub ts: UnixTimestamp,

    /// Identity of the mutated resource
    pub identity: ResourceIdentity,

    /// Mutation verb
    pub verb: Verb,

    /// Derived status summary
    pub status: StatusSummary,

    /// Full resource snapshot
    ///
    /// Supports up to 2^32 bytes
    pub payload: Vec<u8>,
}

impl Event {
    /// Creates a new event with an [`Status::Unknown`] status.
    ///
    /// # Panics
    ///
    /// Panics if the payload length is greater than 2^32.
    pub fn new(
        identity: ResourceIdentity,
        ts: UnixTimestamp,
        verb: Verb,
        payload: Vec<u8>,
    ) -> Self {
        assert!(
            u32::try_from(payload.len()).is_ok(),
            "payloads can be 2^32 bytes in length",
        );

        Self {
            ts,
            identity,
            verb,
            status: StatusSummary::default(),
            payload,
        }
    }

    /// Returns the stable identifier of this event.
    #[must_use]
    pub fn id(&self) -> EventId {
        EventId::derive(&self.identity.uid, self.ts, self.verb)
    }

    /// Serializes the event relative to a block's min timestamp.
    pub(crate) fn encode_into<W: Write>(
        &self,
        writer: &mut W,
        base_ts: UnixTimestamp,
    ) -> Result<(), EncodeError> {
        writer.write_u64_varint(self.ts - base_ts)?;
        writer.write_u8(u8::from(self.verb))?;
        writer.write_u8(u8::from(self.status.status))?;
        write_string(writer, &self.status.message)?;

        write_string(writer, &self.identity.group)?;
        write_string(writer, &self.identity.version)?;
        write_string(writer, &self.identity.kind)?;
        write_string(writer, &self.identity.namespace)?;
        write_string(writer, &self.identity.name)?;
        write_string(writer, &self.identity.uid)?;

        // NOTE: Zero length doubles as "absent"; uids are never empty
        write_string(
            writer,
            self.identity.involved_object_uid.as_deref().unwrap_or(""),
        )?;

        // NOTE: Payloads are limited to 32-bit length
        #[allow(clippy::cast_possible_truncation)]
        writer.write_u32_varint(self.payload.len() as u32)?;
        writer.write_all(&self.payload)?;

        Ok(())
    }

    /// Deserializes an event relative to a block's min timestamp.
    pub(crate) fn decode_from<R: Read>(
        reader: &mut R,
        base_ts: UnixTimestamp,
    ) -> Result<Self, DecodeError> {
        let ts = base_ts + reader.read_u64_varint()?;

        let verb = reader.read_u8()?;
        let verb = Verb::try_from(verb).map_err(|()| DecodeError::InvalidTag(("Verb", verb)))?;

        let status = reader.read_u8()?;
        let status =
            Status::try_from(status).map_err(|()| DecodeError::InvalidTag(("Status", status)))?;

        let message = read_string(reader)?;

        let group = read_string(reader)?;
        let version = read_string(reader)?;
        let kind = read_string(reader)?;
        let namespace = read_string(reader)?;
        let name = read_string(reader)?;
        let uid = read_string(reader)?;

        let involved_object_uid = Some(read_string(reader)?).filter(|s| !s.is_empty());

        let payload_len = reader.read_u32_varint()? as usize;
        let mut payload = vec![0u8; payload_len];
        reader.read_exact(&mut payload)?;

        Ok(Self {
            ts,
            identity: ResourceIdentity {
                group,
                version,
                kind,
                namespace,
                name,
                uid,
                involved_object_uid,
            },
            verb,
            status: StatusSummary::new(status, message),
            payload,
        })
    }

    /// Approximate in-memory size, used for block sizing.
    #[must_use]
    pub fn size(&self) -> usize {
        std::mem::size_of::<UnixTimestamp>()
            + 2
            + self.status.message.len()
            + self.identity.group.len()
            + self.identity.version.len()
            + self.identity.kind.len()
            + self.identity.namespace.len()
            + self.identity.name.len()
            + self.identity.uid.len()
            + self
                .identity
                .involved_object_uid
                .as_ref()
                .map_or(0, String::len)
            + self.payload.len()
    }

    /// Deterministic ordering key for merge tie-breaks:
    /// uid first, then verb order (CREATE < UPDATE < DELETE).
    #[must_use]
    pub(crate) fn tie_break_key(&self) -> (&str, u8) {
        (&self.identity.uid, u8::from(self.verb))
    }
}
