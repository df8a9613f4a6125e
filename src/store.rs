// Station store: SQLite table of geo-tagged stations, keyed by uuid.

use anyhow::{Context, Result};
use parking_lot::Mutex;
use rusqlite::{params, Connection};
use tracing::{debug, info};

use crate::config::StorageConfig;
use crate::ingest::StationRecord;

const SCHEMA: &str = "
CREATE TABLE IF NOT EXISTS stations (
    uuid TEXT PRIMARY KEY,
    name TEXT,
    url TEXT,
    country TEXT,
    tags TEXT,
    lat REAL,
    lng REAL,
    source TEXT
);
CREATE INDEX IF NOT EXISTS idx_stations_lat_lng ON stations (lat, lng);
";

pub struct StationStore {
    conn: Mutex<Connection>,
}

impl StationStore {
    pub fn open(storage: &StorageConfig) -> Result<Self> {
        let conn = match storage.path() {
            Some(path) => Connection::open(path)
                .with_context(|| format!("opening station database {}", path.display()))?,
            None => Connection::open_in_memory().context("opening in-memory station database")?,
        };
        conn.execute_batch(SCHEMA).context("creating stations table")?;
        info!("station store ready ({})", storage.describe());
        Ok(Self {
            conn: Mutex::new(conn),
        })
    }

    /// Insert or replace stations by uuid in one transaction.
    pub fn upsert_all(&self, stations: &[StationRecord]) -> Result<usize> {
        let mut conn = self.conn.lock();
        let tx = conn.transaction()?;
        {
            let mut stmt = tx.prepare(
                "INSERT INTO stations (uuid, name, url, country, tags, lat, lng, source)
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8)
                 ON CONFLICT(uuid) DO UPDATE SET
                    name = excluded.name,
                    url = excluded.url,
                    country = excluded.country,
                    tags = excluded.tags,
                    lat = excluded.lat,
                    lng = excluded.lng,
                    source = excluded.source",
            )?;
            for s in stations {
                stmt.execute(params![
                    s.uuid, s.name, s.url, s.country, s.tags, s.lat, s.lng, s.source
                ])?;
            }
        }
        tx.commit()?;
        debug!("upserted {} stations", stations.len());
        Ok(stations.len())
    }

    /// Stations that carry coordinates, at most `limit` rows.
    pub fn query_with_coords(&self, limit: u32) -> Result<Vec<StationRecord>> {
        let conn = self.conn.lock();
        let mut stmt = conn.prepare(
            "SELECT uuid, name, url, country, tags, lat, lng, source FROM stations
             WHERE lat IS NOT NULL AND lng IS NOT NULL LIMIT ?1",
        )?;
        let rows = stmt.query_map(params![limit], |row| {
            Ok(StationRecord {
                uuid: row.get(0)?,
                name: row.get(1)?,
                url: row.get(2)?,
                country: row.get(3)?,
                tags: row.get(4)?,
                lat: row.get(5)?,
                lng: row.get(6)?,
                source: row.get(7)?,
            })
        })?;
        let stations = rows.collect::<rusqlite::Result<Vec<_>>>()?;
        Ok(stations)
    }

    pub fn count(&self) -> Result<u64> {
        let conn = self.conn.lock();
        let n: i64 = conn.query_row("SELECT COUNT(*) FROM stations", [], |row| row.get(0))?;
        Ok(n as u64)
    }
}
