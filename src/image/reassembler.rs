//! Reassembles SSDV images from fragments.
//!
//! Fragments are grouped into sessions by `(sender, image_id)`. Image ids are
//! only 8 bits and get reused, so a session is restarted (a new *instance*)
//! when:
//!
//! - nothing was received for it for 15 minutes, or
//! - packet 0 arrives for a session that already holds other data. An
//!   identical copy of a stored packet 0 is a repeat, not a restart.
//!
//! Every slot is first-writer-wins. Once a slot becomes complete it's stored,
//! the image is scheduled for rendering and the packet is handed back to the
//! caller for forwarding.

use std::collections::{
    BTreeMap,
    HashMap,
    hash_map::Entry,
};

use bytes::{
    Bytes,
    BytesMut,
};
use chrono::{
    DateTime,
    TimeDelta,
    Utc,
};

use crate::{
    database::{
        self,
        Database,
    },
    image::{
        Fragment,
        FragmentBody,
        SSDV_PACKET_LENGTH,
        SsdvPacket,
        render::{
            PendingRenders,
            RenderJob,
        },
    },
};

const STALE_AFTER_MINUTES: i64 = 15;

/// Offset of the data in a compact SSDV packet.
const COMPACT_DATA_OFFSET: usize = 9;
const FIRST_HALF_LENGTH: usize = 86;

#[derive(Debug, thiserror::Error)]
#[error("image reassembler error")]
pub enum Error {
    Database(#[from] database::Error),
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub enum Accepted {
    /// The fragment completed a slot.
    Complete { instance: i64, packet: SsdvPacket },
    /// Half of a slot is stored, the other half is missing.
    HalfPending { instance: i64 },
    /// The slot (or half) was already filled. Nothing changed.
    Duplicate { instance: i64 },
}

#[derive(Clone, Debug, PartialEq, Eq, Hash)]
struct SessionKey {
    call: String,
    image_id: u8,
}

#[derive(Debug)]
struct Session {
    instance: i64,
    updated: DateTime<Utc>,
    packets: BTreeMap<u16, SsdvPacket>,
    halves: HashMap<u16, [Option<Bytes>; 2]>,
}

impl Session {
    fn new(instance: i64, now: DateTime<Utc>) -> Self {
        Self {
            instance,
            updated: now,
            packets: BTreeMap::new(),
            halves: HashMap::new(),
        }
    }

    fn is_stale(&self, now: DateTime<Utc>) -> bool {
        now - self.updated > TimeDelta::minutes(STALE_AFTER_MINUTES)
    }

    /// Whether `fragment` is the start of a new image with a reused id.
    fn is_restarted_by(&self, fragment: &Fragment) -> bool {
        if fragment.packet_id != 0 {
            return false;
        }

        match self.packets.get(&0) {
            Some(stored) => !matches_stored(stored, &fragment.body),
            // the other half of packet 0 is no reason to restart
            None => {
                self.packets.keys().any(|packet_id| *packet_id != 0)
                    || self.halves.keys().any(|packet_id| *packet_id != 0)
            }
        }
    }

    /// All complete packets, ordered by packet id.
    fn concatenated(&self) -> Bytes {
        let mut buffer = BytesMut::with_capacity(self.packets.len() * SSDV_PACKET_LENGTH);
        for packet in self.packets.values() {
            buffer.extend_from_slice(packet.as_bytes());
        }
        buffer.freeze()
    }
}

fn matches_stored(stored: &SsdvPacket, body: &FragmentBody) -> bool {
    match body {
        FragmentBody::Packet(packet) => packet == stored,
        FragmentBody::Half { index, data } => {
            let start = COMPACT_DATA_OFFSET + if *index == 0 { 0 } else { FIRST_HALF_LENGTH };
            stored.as_bytes().get(start..start + data.len()) == Some(&data[..])
        }
    }
}

async fn create_instance(
    database: &Database,
    key: &SessionKey,
    now: DateTime<Utc>,
) -> Result<i64, Error> {
    let mut transaction = database.transaction().await?;
    let instance = transaction
        .create_image_instance(&key.call, key.image_id, now)
        .await?;
    transaction.commit().await?;

    tracing::debug!(call = %key.call, image_id = key.image_id, instance, "new image instance");

    Ok(instance)
}

#[derive(Debug)]
pub struct Reassembler {
    database: Database,
    renders: PendingRenders,
    sessions: HashMap<SessionKey, Session>,
}

impl Reassembler {
    pub fn new(database: Database, renders: PendingRenders) -> Self {
        Self {
            database,
            renders,
            sessions: HashMap::new(),
        }
    }

    pub async fn accept(
        &mut self,
        sender: &str,
        fragment: Fragment,
        now: DateTime<Utc>,
    ) -> Result<Accepted, Error> {
        self.sessions.retain(|_, session| !session.is_stale(now));

        let key = SessionKey {
            call: sender.to_owned(),
            image_id: fragment.image_id,
        };

        if !self.sessions.contains_key(&key) {
            if let Some(session) = self.restore(&key).await? {
                self.sessions.insert(key.clone(), session);
            }
        }

        let start_new = match self.sessions.get(&key) {
            None => true,
            Some(session) => session.is_stale(now) || session.is_restarted_by(&fragment),
        };

        let session = match self.sessions.entry(key.clone()) {
            Entry::Occupied(entry) if !start_new => entry.into_mut(),
            Entry::Occupied(mut entry) => {
                let instance = create_instance(&self.database, &key, now).await?;
                entry.insert(Session::new(instance, now));
                entry.into_mut()
            }
            Entry::Vacant(entry) => {
                let instance = create_instance(&self.database, &key, now).await?;
                entry.insert(Session::new(instance, now))
            }
        };
        let instance = session.instance;
        let packet_id = fragment.packet_id;

        if session.packets.contains_key(&packet_id) {
            return Ok(Accepted::Duplicate { instance });
        }

        let packet = match fragment.body {
            FragmentBody::Packet(packet) => packet,
            FragmentBody::Half { index, data } => {
                let index = usize::from(index.min(1));
                let halves = session.halves.entry(packet_id).or_default();
                if halves[index].is_some() {
                    return Ok(Accepted::Duplicate { instance });
                }

                // the new half is only kept once the joined packet is stored
                let Some(other) = &halves[1 - index]
                else {
                    halves[index] = Some(data);
                    session.updated = now;
                    return Ok(Accepted::HalfPending { instance });
                };
                let (first, second) = if index == 0 {
                    (&data, other)
                }
                else {
                    (other, &data)
                };
                Fragment::join_halves(sender, fragment.image_id, packet_id, first, second)
            }
        };

        let mut transaction = self.database.transaction().await?;
        let inserted = transaction
            .upsert_image_fragment(instance, sender, &packet, now)
            .await?;
        transaction.touch_image_instance(instance, now).await?;
        transaction.commit().await?;

        session.halves.remove(&packet_id);

        if !inserted {
            tracing::debug!(call = %sender, instance, packet_id, "packet already stored");
            return Ok(Accepted::Duplicate { instance });
        }

        session.packets.insert(packet_id, packet.clone());
        session.updated = now;

        self.renders.schedule(RenderJob {
            instance,
            call: sender.to_owned(),
            image_id: key.image_id,
            ssdv: session.concatenated(),
        });

        Ok(Accepted::Complete { instance, packet })
    }

    /// Rebuilds a session from the database, e.g. after a restart.
    async fn restore(&self, key: &SessionKey) -> Result<Option<Session>, Error> {
        let mut transaction = self.database.transaction().await?;
        let Some(instance) = transaction
            .latest_image_instance(&key.call, key.image_id)
            .await?
        else {
            return Ok(None);
        };
        let fragments = transaction.fragments_for(&key.call, key.image_id).await?;
        transaction.commit().await?;

        tracing::debug!(
            call = %key.call,
            image_id = key.image_id,
            instance = instance.instance,
            packets = fragments.len(),
            "restored image session"
        );

        Ok(Some(Session {
            instance: instance.instance,
            updated: instance.updated,
            packets: fragments.into_iter().collect(),
            halves: HashMap::new(),
        }))
    }
}
