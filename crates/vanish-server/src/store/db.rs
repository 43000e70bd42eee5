use std::path::Path;
use std::sync::Arc;
use std::time::{SystemTime, UNIX_EPOCH};

use anyhow::{Context, Result};
use redb::{Database, ReadableTable, TableDefinition};
use tracing::debug;
use uuid::Uuid;

use super::crypto::EncryptionKey;
use super::model::{Note, NoteMeta, NoteRecord, ValidNote};

const NOTES: TableDefinition<&str, &[u8]> = TableDefinition::new("notes");
const COUNTERS: TableDefinition<&str, u64> = TableDefinition::new("counters");
const NOTE_SEQ_KEY: &str = "note_seq";

/// Outcome of [`Store::fetch_and_consume`].
#[derive(Debug, PartialEq)]
pub enum FetchResult {
    /// Note served; views remain and the note is still stored.
    Served(Note),
    /// Note served for the last time and deleted in the same transaction.
    Consumed(Note),
    /// Note was already expired when fetched; it has now been deleted.
    Expired,
    /// No note with that id.
    NotFound,
}

impl FetchResult {
    /// The served snapshot, if the fetch succeeded.
    pub fn note(&self) -> Option<&Note> {
        match self {
            Self::Served(note) | Self::Consumed(note) => Some(note),
            Self::Expired | Self::NotFound => None,
        }
    }
}

/// Current Unix time in seconds.
pub fn unix_now() -> i64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default()
        .as_secs() as i64
}

/// Thread-safe handle to the redb store.
#[derive(Clone)]
pub struct Store {
    pub(crate) db: Arc<Database>,
    key: Arc<EncryptionKey>,
}

impl Store {
    /// Open (or create) the database at `path`, using `key` for note encryption.
    pub fn open(path: &Path, key: EncryptionKey) -> Result<Self> {
        let db = Database::create(path).context("open redb database")?;

        // Ensure all tables exist.
        let write_txn = db.begin_write()?;
        write_txn.open_table(NOTES)?;
        write_txn.open_table(COUNTERS)?;
        write_txn.open_table(super::users::USERS)?;
        write_txn.open_table(super::users::SESSIONS)?;
        write_txn.commit()?;

        Ok(Self {
            db: Arc::new(db),
            key: Arc::new(key),
        })
    }

    /// Persist a validated note for `owner`. Assigns the id, the insertion
    /// sequence and a zero view count.
    pub fn create(&self, owner: &str, note: &ValidNote) -> Result<Note> {
        let now = unix_now();
        let id = Uuid::new_v4().to_string();

        let (content_encrypted, nonce) =
            super::crypto::encrypt(&self.key, note.content.as_bytes()).context("encrypt content")?;

        let write_txn = self.db.begin_write()?;
        let record = {
            let mut counters = write_txn.open_table(COUNTERS)?;
            let seq = counters.get(NOTE_SEQ_KEY)?.map(|g| g.value()).unwrap_or(0) + 1;
            counters.insert(NOTE_SEQ_KEY, seq)?;

            let record = NoteRecord {
                owner: owner.to_owned(),
                title: note.title.clone(),
                content_encrypted,
                nonce,
                created_at: now,
                expires_at: note.expires_at,
                current_views: 0,
                max_views: note.max_views,
                seq,
            };

            let bytes = encode(&record)?;
            let mut table = write_txn.open_table(NOTES)?;
            table.insert(id.as_str(), bytes.as_slice())?;
            record
        };
        write_txn.commit()?;

        debug!(note_id = %id, owner = %owner, max_views = note.max_views, "stored note");
        Ok(Note {
            id,
            owner: record.owner.clone(),
            title: record.title.clone(),
            content: note.content.clone(),
            created_at: record.created_at,
            expires_at: record.expires_at,
            current_views: 0,
            max_views: record.max_views,
        })
    }

    /// Serve a note once, consuming one view.
    ///
    /// The lookup, both expiry checks, the counter update and any delete run
    /// inside a single write transaction. redb admits one writer at a time, so
    /// concurrent fetches of the same note are serialized and a note with one
    /// view left is served to exactly one caller.
    pub fn fetch_and_consume(&self, id: &str) -> Result<FetchResult> {
        self.fetch_and_consume_at(id, unix_now())
    }

    pub(crate) fn fetch_and_consume_at(&self, id: &str, now: i64) -> Result<FetchResult> {
        // Ids are UUIDs; anything else can't exist. Normalize the spelling so
        // upper-case links still resolve.
        let Ok(uuid) = Uuid::parse_str(id) else {
            return Ok(FetchResult::NotFound);
        };
        let id = uuid.to_string();

        let write_txn = self.db.begin_write()?;
        let result = {
            let mut table = write_txn.open_table(NOTES)?;

            // Copy the bytes out so the AccessGuard is dropped before mutation.
            let raw_bytes: Option<Vec<u8>> =
                table.get(id.as_str())?.map(|guard| guard.value().to_vec());

            match raw_bytes {
                None => FetchResult::NotFound,
                Some(bytes) => {
                    let mut record = decode(&bytes)?;

                    if record.is_expired(now) {
                        table.remove(id.as_str())?;
                        debug!(note_id = %id, "deleted expired note on fetch");
                        FetchResult::Expired
                    } else {
                        record.current_views = record.current_views.saturating_add(1);
                        let note = self.open_note(&id, &record)?;

                        if record.is_expired(now) {
                            table.remove(id.as_str())?;
                            debug!(note_id = %id, views = record.current_views, "note consumed");
                            FetchResult::Consumed(note)
                        } else {
                            let updated = encode(&record)?;
                            table.insert(id.as_str(), updated.as_slice())?;
                            FetchResult::Served(note)
                        }
                    }
                }
            }
        };
        write_txn.commit()?;
        Ok(result)
    }

    /// All notes owned by `owner`, in creation order. Expiry is neither
    /// evaluated nor acted on here.
    pub fn list_owned(&self, owner: &str) -> Result<Vec<NoteMeta>> {
        let read_txn = self.db.begin_read()?;
        let table = read_txn.open_table(NOTES)?;

        let mut owned = Vec::new();
        for item in table.iter()? {
            let (k, v) = item?;
            let record = decode(v.value())?;
            if record.owner == owner {
                owned.push((record.seq, record.meta(k.value())));
            }
        }
        owned.sort_by_key(|(seq, _)| *seq);
        Ok(owned.into_iter().map(|(_, meta)| meta).collect())
    }

    fn open_note(&self, id: &str, record: &NoteRecord) -> Result<Note> {
        let plaintext =
            super::crypto::decrypt(&self.key, &record.content_encrypted, &record.nonce)
                .context("decrypt content")?;
        let content = String::from_utf8(plaintext).context("note content is not valid UTF-8")?;

        Ok(Note {
            id: id.to_owned(),
            owner: record.owner.clone(),
            title: record.title.clone(),
            content,
            created_at: record.created_at,
            expires_at: record.expires_at,
            current_views: record.current_views,
            max_views: record.max_views,
        })
    }
}

fn encode(record: &NoteRecord) -> Result<Vec<u8>> {
    bincode::serde::encode_to_vec(record, bincode::config::standard()).context("bincode encode note")
}

fn decode(bytes: &[u8]) -> Result<NoteRecord> {
    let (record, _) = bincode::serde::decode_from_slice(bytes, bincode::config::standard())
        .context("bincode decode note")?;
    Ok(record)
}
