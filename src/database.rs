use std::{
    ops::{
        Deref,
        DerefMut,
    },
    str::FromStr,
};

use chrono::{
    DateTime,
    Utc,
};
use sqlx::{
    Row,
    Sqlite,
    SqliteConnection,
    SqlitePool,
    sqlite::{
        SqliteConnectOptions,
        SqlitePoolOptions,
        SqliteRow,
    },
    types::Json,
};

use crate::{
    image::SsdvPacket,
    position::{
        LogRecord,
        Position,
        TelemetryChannels,
        TrackPoint,
    },
};

#[derive(Debug, thiserror::Error)]
#[error("database error")]
pub enum Error {
    Sqlx(#[from] sqlx::error::Error),
    Migrate(#[from] sqlx::migrate::MigrateError),
}

#[derive(Clone, Debug)]
pub struct Database {
    pool: SqlitePool,
}

impl Database {
    pub async fn connect(database_url: &str) -> Result<Self, Error> {
        let options = SqliteConnectOptions::from_str(database_url)?.create_if_missing(true);

        let mut pool_options = SqlitePoolOptions::new();
        if database_url.contains(":memory:") {
            // every connection would open its own empty database
            pool_options = pool_options
                .max_connections(1)
                .idle_timeout(None)
                .max_lifetime(None);
        }

        let pool = pool_options.connect_with(options).await?;

        sqlx::migrate!("./migrations").run(&pool).await?;

        Ok(Self { pool })
    }

    pub async fn in_memory() -> Result<Self, Error> {
        Self::connect("sqlite::memory:").await
    }

    pub async fn transaction(&self) -> Result<Transaction<'_>, Error> {
        let inner = self.pool.begin().await?;
        Ok(Transaction { inner })
    }
}

#[derive(Debug)]
pub struct Transaction<'c> {
    inner: sqlx::Transaction<'c, Sqlite>,
}

impl<'c> Deref for Transaction<'c> {
    type Target = SqliteConnection;

    fn deref(&self) -> &Self::Target {
        &*self.inner
    }
}

impl<'c> DerefMut for Transaction<'c> {
    fn deref_mut(&mut self) -> &mut Self::Target {
        &mut *self.inner
    }
}

/// Where a stored position came from.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Origin {
    /// A live position report
    Position,
    /// A record from a log backlog
    Log,
}

impl Origin {
    pub fn as_str(&self) -> &'static str {
        match self {
            Origin::Position => "position",
            Origin::Log => "log",
        }
    }
}

impl FromStr for Origin {
    type Err = sqlx::error::Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "position" => Ok(Origin::Position),
            "log" => Ok(Origin::Log),
            _ => Err(sqlx::error::Error::Decode(format!("invalid origin: {s}").into())),
        }
    }
}

/// A row of the `position` table.
#[derive(Clone, Debug, PartialEq)]
pub struct StoredPosition {
    pub call: String,
    pub time: DateTime<Utc>,
    pub origin: Origin,
    pub latitude: f64,
    pub longitude: f64,
    pub altitude: f64,
    pub gps_fix: Option<bool>,
    pub comment: Option<String>,
    pub telemetry: Option<TelemetryChannels>,
    pub track_point: Option<TrackPoint>,
    pub receiver: String,
    pub received: DateTime<Utc>,
}

impl StoredPosition {
    fn from_row(row: &SqliteRow) -> Result<Self, Error> {
        let sequence: Option<i64> = row.try_get("sequence")?;
        let channels = [
            row.try_get::<Option<i64>, _>("tel1")?,
            row.try_get::<Option<i64>, _>("tel2")?,
            row.try_get::<Option<i64>, _>("tel3")?,
            row.try_get::<Option<i64>, _>("tel4")?,
            row.try_get::<Option<i64>, _>("tel5")?,
        ];
        let telemetry = sequence.map(|sequence| {
            TelemetryChannels {
                sequence: sequence as u16,
                values: channels.map(|value| value.unwrap_or_default() as u16),
            }
        });

        let track_point: Option<Json<TrackPoint>> = row.try_get("track_point")?;
        let origin: String = row.try_get("origin")?;

        Ok(Self {
            call: row.try_get("call")?,
            time: row.try_get("time")?,
            origin: origin.parse()?,
            latitude: row.try_get("latitude")?,
            longitude: row.try_get("longitude")?,
            altitude: row.try_get("altitude")?,
            gps_fix: row.try_get("gps_fix")?,
            comment: row.try_get("comment")?,
            telemetry,
            track_point: track_point.map(|json| json.0),
            receiver: row.try_get("receiver")?,
            received: row.try_get("received")?,
        })
    }
}

/// Outcome of [`Transaction::insert_log_batch`].
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct LogInsertReport {
    pub inserted: usize,
    pub duplicates: usize,
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ImageInstance {
    pub instance: i64,
    pub call: String,
    pub image_id: u8,
    pub created: DateTime<Utc>,
    pub updated: DateTime<Utc>,
}

impl<'c> Transaction<'c> {
    pub async fn commit(self) -> Result<(), Error> {
        self.inner.commit().await?;
        Ok(())
    }

    pub async fn rollback(self) -> Result<(), Error> {
        self.inner.rollback().await?;
        Ok(())
    }

    /// Stores a position. A later report for the same `(call, time)` replaces
    /// the earlier one.
    pub async fn upsert_position(
        &mut self,
        call: &str,
        receiver: &str,
        position: &Position,
        received: DateTime<Utc>,
    ) -> Result<(), Error> {
        let telemetry = position.telemetry.as_ref();
        let channel = |i: usize| telemetry.map(|telemetry| i64::from(telemetry.values[i]));

        sqlx::query(
            r#"
            insert into position (
                call, time, origin, latitude, longitude, altitude, gps_fix, comment,
                sequence, tel1, tel2, tel3, tel4, tel5, track_point, receiver, received
            )
            values ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11, $12, $13, $14, $15, $16, $17)
            on conflict (call, time) do update set
                origin = excluded.origin,
                latitude = excluded.latitude,
                longitude = excluded.longitude,
                altitude = excluded.altitude,
                gps_fix = excluded.gps_fix,
                comment = excluded.comment,
                sequence = excluded.sequence,
                tel1 = excluded.tel1,
                tel2 = excluded.tel2,
                tel3 = excluded.tel3,
                tel4 = excluded.tel4,
                tel5 = excluded.tel5,
                track_point = excluded.track_point,
                receiver = excluded.receiver,
                received = excluded.received
            "#,
        )
        .bind(call)
        .bind(position.time)
        .bind(Origin::Position.as_str())
        .bind(position.latitude)
        .bind(position.longitude)
        .bind(position.altitude)
        .bind(position.gps_fix)
        .bind(position.comment.as_deref())
        .bind(telemetry.map(|telemetry| i64::from(telemetry.sequence)))
        .bind(channel(0))
        .bind(channel(1))
        .bind(channel(2))
        .bind(channel(3))
        .bind(channel(4))
        .bind(position.track_point.as_ref().map(Json))
        .bind(receiver)
        .bind(received)
        .execute(&mut *self.inner)
        .await?;

        Ok(())
    }

    /// Stores log backlog records. Records that are already stored are kept
    /// and counted as duplicates.
    pub async fn insert_log_batch(
        &mut self,
        call: &str,
        receiver: &str,
        records: &[LogRecord],
        received: DateTime<Utc>,
    ) -> Result<LogInsertReport, Error> {
        let mut report = LogInsertReport::default();

        for record in records {
            let result = sqlx::query(
                r#"
                insert into position (call, time, origin, latitude, longitude, altitude, receiver, received)
                values ($1, $2, $3, $4, $5, $6, $7, $8)
                on conflict (call, time) do nothing
                "#,
            )
            .bind(call)
            .bind(record.time)
            .bind(Origin::Log.as_str())
            .bind(record.latitude)
            .bind(record.longitude)
            .bind(f64::from(record.altitude))
            .bind(receiver)
            .bind(received)
            .execute(&mut *self.inner)
            .await?;

            if result.rows_affected() > 0 {
                report.inserted += 1;
            }
            else {
                report.duplicates += 1;
            }
        }

        Ok(report)
    }

    pub async fn position_at(
        &mut self,
        call: &str,
        time: DateTime<Utc>,
    ) -> Result<Option<StoredPosition>, Error> {
        sqlx::query("select * from position where call = $1 and time = $2")
            .bind(call)
            .bind(time)
            .fetch_optional(&mut *self.inner)
            .await?
            .as_ref()
            .map(StoredPosition::from_row)
            .transpose()
    }

    pub async fn create_image_instance(
        &mut self,
        call: &str,
        image_id: u8,
        now: DateTime<Utc>,
    ) -> Result<i64, Error> {
        let result = sqlx::query(
            "insert into image_instance (call, image_id, created, updated) values ($1, $2, $3, $3)",
        )
        .bind(call)
        .bind(i64::from(image_id))
        .bind(now)
        .execute(&mut *self.inner)
        .await?;

        Ok(result.last_insert_rowid())
    }

    pub async fn touch_image_instance(
        &mut self,
        instance: i64,
        now: DateTime<Utc>,
    ) -> Result<(), Error> {
        sqlx::query("update image_instance set updated = $1 where instance = $2")
            .bind(now)
            .bind(instance)
            .execute(&mut *self.inner)
            .await?;
        Ok(())
    }

    pub async fn latest_image_instance(
        &mut self,
        call: &str,
        image_id: u8,
    ) -> Result<Option<ImageInstance>, Error> {
        let row = sqlx::query(
            r#"
            select instance, call, image_id, created, updated from image_instance
            where call = $1 and image_id = $2
            order by instance desc
            limit 1
            "#,
        )
        .bind(call)
        .bind(i64::from(image_id))
        .fetch_optional(&mut *self.inner)
        .await?;

        let Some(row) = row
        else {
            return Ok(None);
        };

        Ok(Some(ImageInstance {
            instance: row.try_get("instance")?,
            call: row.try_get("call")?,
            image_id: row.try_get::<i64, _>("image_id")? as u8,
            created: row.try_get("created")?,
            updated: row.try_get("updated")?,
        }))
    }

    /// Stores a complete SSDV packet. The first packet stored for a slot wins.
    ///
    /// Returns whether the packet was newly inserted.
    pub async fn upsert_image_fragment(
        &mut self,
        instance: i64,
        call: &str,
        packet: &SsdvPacket,
        received: DateTime<Utc>,
    ) -> Result<bool, Error> {
        let result = sqlx::query(
            r#"
            insert into image_fragment (instance, call, image_id, packet_id, data, received)
            values ($1, $2, $3, $4, $5, $6)
            on conflict (instance, packet_id) do nothing
            "#,
        )
        .bind(instance)
        .bind(call)
        .bind(i64::from(packet.image_id()))
        .bind(i64::from(packet.packet_id()))
        .bind(packet.as_bytes())
        .bind(received)
        .execute(&mut *self.inner)
        .await?;

        Ok(result.rows_affected() > 0)
    }

    /// Packets of the latest instance of an image, ordered by packet id.
    pub async fn fragments_for(
        &mut self,
        call: &str,
        image_id: u8,
    ) -> Result<Vec<(u16, SsdvPacket)>, Error> {
        let rows = sqlx::query(
            r#"
            select packet_id, data from image_fragment
            where instance = (
                select instance from image_instance
                where call = $1 and image_id = $2
                order by instance desc
                limit 1
            )
            order by packet_id
            "#,
        )
        .bind(call)
        .bind(i64::from(image_id))
        .fetch_all(&mut *self.inner)
        .await?;

        let mut fragments = Vec::with_capacity(rows.len());
        for row in rows {
            let packet_id = row.try_get::<i64, _>("packet_id")? as u16;
            let data: Vec<u8> = row.try_get("data")?;
            if let Some(packet) = SsdvPacket::from_bytes(data) {
                fragments.push((packet_id, packet));
            }
            else {
                tracing::warn!(%call, image_id, packet_id, "ignoring malformed stored packet");
            }
        }

        Ok(fragments)
    }
}
