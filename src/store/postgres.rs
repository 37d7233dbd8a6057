use std::{
    sync::Arc,
    time::{Duration, Instant},
};

use async_trait::async_trait;
use chrono::{DateTime, NaiveDateTime, TimeZone, Utc};
use log::{debug, error, info, warn};
use serde::{Deserialize, Serialize};
use tokio::sync::Mutex;
use tokio_postgres::{types::Type as SQLType, Client, NoTls, Row, Statement};

use super::{ReadingRecord, ReadingStore, StorageError};
use crate::message::Reading;

#[inline]
fn default_user() -> String {
    "postgres".to_string()
}
#[inline]
fn default_connect_timeout() -> Option<Duration> {
    Some(Duration::from_secs(10))
}
#[inline]
fn default_reconnect_interval() -> Duration {
    Duration::from_secs(5)
}
#[inline]
fn default_tname() -> String {
    "dados_lixo".to_string()
}

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct Config {
    pub(crate) host: String,
    pub(crate) port: Option<u16>,
    #[serde(default = "default_user")]
    pub(crate) user: String,
    pub(crate) password: Option<String>,
    pub(crate) dbname: Option<String>,
    options: Option<String>,
    #[serde(default = "default_connect_timeout", with = "humantime_serde")]
    connect_timeout: Option<Duration>,
    keepalive: Option<bool>,
    #[serde(default, with = "humantime_serde")]
    keepalive_idle: Option<Duration>,
    // How long to fail fast after a failed connection attempt
    // optional, default: 5s
    #[serde(default = "default_reconnect_interval", with = "humantime_serde")]
    reconnect_interval: Duration,

    #[serde(default = "default_tname")]
    tname: String,
}

impl Config {
    pub(crate) fn with_host(host: String) -> Self {
        Self {
            host,
            port: None,
            user: default_user(),
            password: None,
            dbname: None,
            options: None,
            connect_timeout: default_connect_timeout(),
            keepalive: None,
            keepalive_idle: None,
            reconnect_interval: default_reconnect_interval(),
            tname: default_tname(),
        }
    }

    fn build(&self) -> tokio_postgres::Config {
        let mut builder = tokio_postgres::Config::new();
        builder.user(&self.user).host(&self.host);
        self.port.map(|port| builder.port(port));
        self.password
            .as_ref()
            .map(|password| builder.password(password));
        self.dbname.as_ref().map(|dbname| builder.dbname(dbname));
        self.options.as_ref().map(|options| builder.options(options));
        self.connect_timeout
            .map(|connect_timeout| builder.connect_timeout(connect_timeout));
        self.keepalive.map(|keepalive| builder.keepalives(keepalive));
        self.keepalive_idle
            .map(|keepalive_idle| builder.keepalives_idle(keepalive_idle));
        builder
    }
}

struct Session {
    client: Client,
    insert_stmt: Statement,
    select_stmt: Statement,
}

impl Session {
    async fn open(config: &Config) -> Result<Self, StorageError> {
        debug!("connecting to database `{}`", config.host);
        let (client, connection) =
            config
                .build()
                .connect(NoTls)
                .await
                .map_err(|source| StorageError::Connect {
                    host: config.host.clone(),
                    source,
                })?;
        info!("connected to database `{}`", config.host);
        tokio::spawn({
            let host = config.host.clone();
            async move {
                if let Err(e) = connection.await {
                    error!("connection to `{}` error: {}", host, e);
                }
            }
        });

        Self::init_table(&client, config).await?;

        let init_err = |source| StorageError::Init {
            table: config.tname.clone(),
            source,
        };
        let insert_sql = format!(
            "INSERT INTO {} (sensor_id, nivel_lixo) VALUES ($1, $2)",
            config.tname
        );
        let insert_stmt = client
            .prepare_typed(&insert_sql, &[SQLType::TEXT, SQLType::FLOAT8])
            .await
            .map_err(init_err)?;
        let select_sql = format!(
            "SELECT sensor_id, nivel_lixo, data_hora FROM {} ORDER BY data_hora DESC LIMIT $1",
            config.tname
        );
        let select_stmt = client
            .prepare_typed(&select_sql, &[SQLType::INT8])
            .await
            .map_err(init_err)?;

        Ok(Self {
            client,
            insert_stmt,
            select_stmt,
        })
    }

    async fn init_table(client: &Client, config: &Config) -> Result<(), StorageError> {
        debug!(
            "initializing table `{}` for database `{}`",
            config.tname, config.host
        );
        let sql = format!(
            "
            CREATE TABLE IF NOT EXISTS {tname} (
                id          BIGSERIAL PRIMARY KEY,
                sensor_id   TEXT NOT NULL,
                nivel_lixo  DOUBLE PRECISION,
                data_hora   TIMESTAMPTZ NOT NULL DEFAULT now()
            );
            CREATE INDEX IF NOT EXISTS {tname}_data_hora ON {tname} (data_hora DESC);
        ",
            tname = config.tname
        );
        client
            .batch_execute(&sql)
            .await
            .map_err(|source| StorageError::Init {
                table: config.tname.clone(),
                source,
            })?;
        info!(
            "initialized table `{}` for database `{}`",
            config.tname, config.host
        );
        Ok(())
    }
}

/// Reads a record timestamp. Tables created elsewhere may use a plain
/// `TIMESTAMP` column, whose values are taken as UTC.
fn data_hora(row: &Row, idx: usize) -> Result<DateTime<Utc>, tokio_postgres::Error> {
    if accepts_naive(row.columns()[idx].type_()) {
        let naive: NaiveDateTime = row.try_get(idx)?;
        Ok(naive_as_utc(naive))
    } else {
        row.try_get(idx)
    }
}

fn accepts_naive(type_: &SQLType) -> bool {
    *type_ == SQLType::TIMESTAMP
}

fn naive_as_utc(naive: NaiveDateTime) -> DateTime<Utc> {
    Utc.from_utc_datetime(&naive)
}

#[derive(Default)]
struct Slot {
    session: Option<Arc<Session>>,
    retry_after: Option<Instant>,
}

/// Appends readings to a PostgreSQL table.
///
/// The connection is opened on first use and re-opened once it closes. After
/// a failed attempt, calls fail fast until `reconnect_interval` has passed.
pub struct PostgresStore {
    config: Config,
    slot: Mutex<Slot>,
}

impl PostgresStore {
    pub async fn new(config: Config) -> Self {
        let store = Self {
            config,
            slot: Mutex::new(Slot::default()),
        };
        if let Err(e) = store.session().await {
            warn!("database not ready, will retry on demand: {}", e);
        }
        store
    }

    async fn session(&self) -> Result<Arc<Session>, StorageError> {
        let mut slot = self.slot.lock().await;
        if let Some(session) = slot.session.as_ref() {
            if !session.client.is_closed() {
                return Ok(session.clone());
            }
            warn!("connection to `{}` closed, reconnecting", self.config.host);
            slot.session = None;
        }
        if let Some(retry_after) = slot.retry_after {
            let now = Instant::now();
            if now < retry_after {
                return Err(StorageError::Unavailable(format!(
                    "database `{}` unreachable, next attempt in {:?}",
                    self.config.host,
                    retry_after - now
                )));
            }
        }

        match Session::open(&self.config).await {
            Ok(session) => {
                let session = Arc::new(session);
                slot.session = Some(session.clone());
                slot.retry_after = None;
                Ok(session)
            }
            Err(e) => {
                slot.retry_after = Some(Instant::now() + self.config.reconnect_interval);
                Err(e)
            }
        }
    }

    fn query_err(&self) -> impl Fn(tokio_postgres::Error) -> StorageError + '_ {
        move |source| StorageError::Query {
            table: self.config.tname.clone(),
            source,
        }
    }
}

#[async_trait]
impl ReadingStore for PostgresStore {
    async fn append(&self, reading: &Reading) -> Result<(), StorageError> {
        debug!(
            "submitting {:?} into database `{}`",
            reading, self.config.host
        );
        let session = self.session().await?;
        session
            .client
            .execute(
                &session.insert_stmt,
                &[&reading.sensor_id, &reading.fill_level],
            )
            .await
            .map_err(self.query_err())?;
        Ok(())
    }

    async fn list_recent(&self, limit: usize) -> Result<Vec<ReadingRecord>, StorageError> {
        let session = self.session().await?;
        let limit = i64::try_from(limit).unwrap_or(i64::MAX);
        let rows = session
            .client
            .query(&session.select_stmt, &[&limit])
            .await
            .map_err(self.query_err())?;

        rows.into_iter()
            .map(|row| -> Result<ReadingRecord, tokio_postgres::Error> {
                let sensor_id: String = row.try_get(0)?;
                let nivel_lixo: Option<f64> = row.try_get(1)?;
                let data_hora = data_hora(&row, 2)?;
                Ok(ReadingRecord {
                    sensor_id,
                    nivel_lixo: nivel_lixo.unwrap_or(f64::NAN),
                    data_hora,
                })
            })
            .collect::<Result<_, _>>()
            .map_err(self.query_err())
    }
}
