//! Takes raw lines from a source and routes them through classification,
//! decoding, storage and forwarding.

use chrono::{
    DateTime,
    Utc,
};

use crate::{
    aprs::{
        self,
        Envelope,
        ImagePayload,
        Payload,
        PositionReport,
    },
    database::{
        self,
        Database,
    },
    forward::{
        self,
        Forwarder,
        OutboundPacket,
    },
    image::{
        Fragment,
        reassembler::{
            self,
            Accepted,
            Reassembler,
        },
        render::PendingRenders,
    },
    position::{
        Position,
        decode_log,
    },
};

#[derive(Debug, thiserror::Error)]
#[error("pipeline error")]
pub enum Error {
    Database(#[from] database::Error),
    Reassembler(#[from] reassembler::Error),
    Forward(#[from] forward::Error),
}

#[derive(Clone, Debug)]
pub struct PipelineConfig {
    /// Our own callsign. Receiver of frames that carry no path.
    pub call: String,
}

/// What happened to the lines so far.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct Counters {
    pub lines: usize,
    /// Not an APECAN frame, or cut off.
    pub malformed: usize,
    /// APECAN frame with a payload we don't know.
    pub unrecognized: usize,
    /// Payload failed to decode.
    pub decode_errors: usize,
    pub positions: usize,
    pub log_records: usize,
    pub log_duplicates: usize,
    pub image_packets: usize,
    pub image_duplicates: usize,
}

#[derive(Debug)]
pub struct Pipeline {
    config: PipelineConfig,
    database: Database,
    reassembler: Reassembler,
    forwarder: Option<Forwarder>,
    counters: Counters,
}

impl Pipeline {
    pub fn new(
        config: PipelineConfig,
        database: Database,
        renders: PendingRenders,
        forwarder: Option<Forwarder>,
    ) -> Self {
        Self {
            config,
            reassembler: Reassembler::new(database.clone(), renders),
            database,
            forwarder,
            counters: Counters::default(),
        }
    }

    pub fn counters(&self) -> Counters {
        self.counters
    }

    pub async fn handle_line(&mut self, line: &str, received: DateTime<Utc>) -> Result<(), Error> {
        self.counters.lines += 1;

        let Some(envelope) = aprs::classify(line, &self.config.call)
        else {
            self.counters.malformed += 1;
            tracing::trace!(%line, "ignoring line");
            return Ok(());
        };

        let Envelope {
            sender,
            receiver,
            payload,
            ..
        } = envelope;

        match payload {
            Payload::Position(report) => {
                self.handle_position(&sender, &receiver, &report, received)
                    .await?;
            }
            Payload::Image(payload) => {
                self.handle_image(&sender, &receiver, &payload, received)
                    .await?;
            }
            Payload::Log(encoded) => {
                self.handle_log(&sender, &receiver, &encoded, received)
                    .await?;
            }
            Payload::Unrecognized { marker } => {
                self.counters.unrecognized += 1;
                tracing::debug!(call = %sender, %marker, "unrecognized payload");
            }
        }

        Ok(())
    }

    async fn handle_position(
        &mut self,
        sender: &str,
        receiver: &str,
        report: &PositionReport,
        received: DateTime<Utc>,
    ) -> Result<(), Error> {
        let position = match Position::decode(report, received) {
            Ok(position) => position,
            Err(error) => {
                self.counters.decode_errors += 1;
                tracing::debug!(call = %sender, ?error, "invalid position");
                return Ok(());
            }
        };

        let mut transaction = self.database.transaction().await?;
        transaction
            .upsert_position(sender, receiver, &position, received)
            .await?;
        transaction.commit().await?;

        self.counters.positions += 1;
        tracing::info!(
            call = %sender,
            time = %position.time,
            latitude = position.latitude,
            longitude = position.longitude,
            altitude = position.altitude,
            "received position"
        );

        Ok(())
    }

    async fn handle_image(
        &mut self,
        sender: &str,
        receiver: &str,
        payload: &ImagePayload,
        received: DateTime<Utc>,
    ) -> Result<(), Error> {
        let fragment = match Fragment::parse(payload, sender) {
            Ok(fragment) => fragment,
            Err(error) => {
                self.counters.decode_errors += 1;
                tracing::debug!(call = %sender, ?error, "invalid image fragment");
                return Ok(());
            }
        };
        let image_id = fragment.image_id;
        let packet_id = fragment.packet_id;

        match self.reassembler.accept(sender, fragment, received).await? {
            Accepted::Complete { instance, packet } => {
                self.counters.image_packets += 1;
                tracing::info!(call = %sender, image_id, packet_id, instance, "received image packet");

                if let Some(forwarder) = &self.forwarder {
                    forwarder
                        .push(OutboundPacket::new(&packet, received, receiver))
                        .await?;
                }
            }
            Accepted::HalfPending { instance } => {
                tracing::debug!(call = %sender, image_id, packet_id, instance, "received half of image packet");
            }
            Accepted::Duplicate { instance } => {
                self.counters.image_duplicates += 1;
                tracing::debug!(call = %sender, image_id, packet_id, instance, "duplicate image packet");
            }
        }

        Ok(())
    }

    async fn handle_log(
        &mut self,
        sender: &str,
        receiver: &str,
        encoded: &str,
        received: DateTime<Utc>,
    ) -> Result<(), Error> {
        let records = match decode_log(encoded) {
            Ok(records) => records,
            Err(error) => {
                self.counters.decode_errors += 1;
                tracing::debug!(call = %sender, ?error, "invalid log backlog");
                return Ok(());
            }
        };

        let mut transaction = self.database.transaction().await?;
        let report = transaction
            .insert_log_batch(sender, receiver, &records, received)
            .await?;
        transaction.commit().await?;

        self.counters.log_records += report.inserted;
        self.counters.log_duplicates += report.duplicates;

        if report.duplicates > 0 {
            tracing::info!(call = %sender, inserted = report.inserted, duplicates = report.duplicates, "received log records, some already stored");
        }
        else {
            tracing::info!(call = %sender, inserted = report.inserted, "received log records");
        }

        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use bytes::BufMut;
    use chrono::{
        TimeZone,
        Utc,
    };
    use parking_lot::Mutex;

    use crate::{
        base91,
        database::{
            Database,
            Origin,
        },
        forward::{
            DeliveryError,
            Forwarder,
            PacketBatch,
            Uplink,
        },
        image::{
            render::PendingRenders,
            tests::compact_payload,
        },
        pipeline::{
            Counters,
            Pipeline,
            PipelineConfig,
        },
    };

    #[derive(Clone, Default)]
    struct RecordingUplink {
        sent: Arc<Mutex<Vec<PacketBatch>>>,
    }

    impl Uplink for RecordingUplink {
        async fn send(&self, batch: &PacketBatch) -> Result<(), DeliveryError> {
            self.sent.lock().push(batch.clone());
            Ok(())
        }
    }

    async fn pipeline(forwarder: Option<Forwarder>) -> (Pipeline, Database, PendingRenders) {
        let database = Database::in_memory().await.unwrap();
        let renders = PendingRenders::default();
        let pipeline = Pipeline::new(
            PipelineConfig {
                call: "N0CALL".to_owned(),
            },
            database.clone(),
            renders.clone(),
            forwarder,
        );
        (pipeline, database, renders)
    }

    #[tokio::test]
    async fn it_stores_positions() {
        let (mut pipeline, database, _renders) = pipeline(None).await;
        let received = Utc.with_ymd_and_hms(2024, 6, 2, 10, 5, 0).unwrap();

        pipeline
            .handle_line("DL7AD-12>APECAN,qAR,DB0XYZ-10:/100000h/3x!!QsNNOS]Ahello", received)
            .await
            .unwrap();

        let mut transaction = database.transaction().await.unwrap();
        let stored = transaction
            .position_at("DL7AD-12", Utc.with_ymd_and_hms(2024, 6, 2, 10, 0, 0).unwrap())
            .await
            .unwrap()
            .unwrap();
        assert_eq!(stored.origin, Origin::Position);
        assert_eq!(stored.latitude, 52.5);
        assert_eq!(stored.comment.as_deref(), Some("hello"));
        assert_eq!(stored.receiver, "DB0XYZ-10");
        assert_eq!(pipeline.counters().positions, 1);
    }

    #[tokio::test]
    async fn it_reassembles_and_forwards_image_packets() {
        let uplink = RecordingUplink::default();
        let forwarder = Forwarder::new(uplink.clone(), 1);
        let (mut pipeline, _database, renders) = pipeline(Some(forwarder.clone())).await;
        let received = Utc.with_ymd_and_hms(2024, 6, 2, 10, 5, 0).unwrap();

        for packet_id in [0, 1, 1] {
            let payload = compact_payload(2, packet_id, 0x42);
            pipeline
                .handle_line(&format!("DL7AD-12>APECAN:{{{{I{}", payload.encoded()), received)
                .await
                .unwrap();
        }
        forwarder.flush().await.unwrap();

        let counters = pipeline.counters();
        assert_eq!(counters.image_packets, 2);
        assert_eq!(counters.image_duplicates, 1);

        let sent = uplink.sent.lock().clone();
        assert_eq!(sent.len(), 2);
        let packet = &sent[0].packets[0];
        assert!(packet.packet.starts_with("5568"));
        assert_eq!(packet.receiver, "N0CALL");

        let jobs = renders.take();
        assert_eq!(jobs.len(), 1);
        assert_eq!(jobs[0].ssdv.len(), 2 * 256);
    }

    #[tokio::test]
    async fn it_counts_log_duplicates() {
        let (mut pipeline, _database, _renders) = pipeline(None).await;
        let received = Utc.with_ymd_and_hms(2024, 6, 2, 10, 5, 0).unwrap();

        let mut data = Vec::new();
        for time in [1_717_286_400u32, 1_717_286_460] {
            data.put_u32_le(time);
            data.put_u16_le(32768);
            data.put_u16_le(32768);
            data.put_u16_le(1000);
        }
        let line = format!("DL7AD-12>APECAN:{{{{L{}", base91::encode(&data));

        pipeline.handle_line(&line, received).await.unwrap();
        pipeline.handle_line(&line, received).await.unwrap();

        let counters = pipeline.counters();
        assert_eq!(counters.log_records, 2);
        assert_eq!(counters.log_duplicates, 2);
    }

    #[tokio::test]
    async fn it_counts_what_it_cant_use() {
        let (mut pipeline, _database, _renders) = pipeline(None).await;
        let received = Utc::now();

        for line in [
            "# aprsc 2.1.14",
            "DL7AD>APRS:!4903.50N/07201.75W-",
            "DL7AD>APECAN:/0923",
            "DL7AD>APECAN:>status",
            "DL7AD>APECAN:{{I!!!!",
            "DL7AD>APECAN:!/!!!!!!!!O!!!",
        ] {
            pipeline.handle_line(line, received).await.unwrap();
        }

        assert_eq!(
            pipeline.counters(),
            Counters {
                lines: 6,
                malformed: 3,
                unrecognized: 1,
                decode_errors: 1,
                positions: 1,
                ..Default::default()
            }
        );
    }
}
