//! # Message Store
//!
//! [`MessageStore`] is the durable outbound queue. It owns one collection,
//! hands out ids, enforces the capacity bound, and drives each message through
//! its delivery lifecycle.
//!
//! ## Architecture
//!
//! ```text
//!  caller threads                      housekeeper thread
//!       │                                      │ (Weak)
//!       ▼                                      ▼
//! ┌───────────────────────────────────────────────────────────┐
//! │ Shared                                                     │
//! │   table: MessageTable        (prebuilt SQL, immutable)     │
//! │   state: Mutex<State>                                      │
//! │            provider: Option<P>   ◄── start / rebind / stop │
//! │            config:   StoreConfig ◄── start / update        │
//! └───────────────────────────────────────────────────────────┘
//! ```
//!
//! Every operation, including the housekeeper's, takes the single state lock
//! for its whole duration. The capacity check and the insert it guards run
//! under the same lock, so the bound is exact for one store instance. Nothing
//! coordinates two processes opening the same file.
//!
//! ## Lock Ordering
//!
//! The housekeeper handle lives outside the state lock. Reconfiguration stops
//! the old housekeeper first (it may be waiting on the state lock for its
//! pass), then takes the state lock, then spawns the replacement. A rejected
//! reconfiguration leaves the provider and config alone and respawns the
//! housekeeper it stopped.

use std::path::Path;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use rusqlite::{params, Connection, OptionalExtension, Row, Transaction};
use tracing::{debug, error, info, warn};

use crate::config::{ProviderOptions, StoreConfig};
use crate::error::{Error, Result};
use crate::housekeeper::{Housekeeper, HousekeeperState, INITIAL_DELAY};
use crate::provider::{ConnectionProvider, SqliteProvider};
use crate::repair::{self, RepairReport};
use crate::schema::{self, CollectionName, MessageTable};
use crate::sequence::{self, MAX_MESSAGE_ID};
use crate::types::{
    DataTransportToken, MessageId, Priority, Qos, StoredMessage, Timestamp,
};

// =============================================================================
// Purge Report
// =============================================================================

/// Rows removed by one [`MessageStore::delete_stale_messages`] call.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct PurgeReport {
    pub dropped: usize,
    pub confirmed: usize,
    pub published_qos0: usize,
}

impl PurgeReport {
    /// Total number of rows removed.
    pub fn total(&self) -> usize {
        self.dropped + self.confirmed + self.published_qos0
    }
}

// =============================================================================
// Shared State
// =============================================================================

struct State<P> {
    provider: Option<P>,
    config: StoreConfig,
}

/// Everything the housekeeper needs to reach, behind one lock.
struct Shared<P> {
    table: MessageTable,
    /// Highest id the sequence may hand out before it resets.
    id_limit: i64,
    state: Mutex<State<P>>,
}

impl<P: ConnectionProvider> Shared<P> {
    fn lock(&self) -> MutexGuard<'_, State<P>> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn unavailable(&self) -> Error {
        Error::StoreUnavailable {
            collection: self.table.name.to_string(),
        }
    }

    /// Runs `f` with the attached provider and current config, under the lock.
    fn with_provider<T>(
        &self,
        f: impl FnOnce(&mut P, &MessageTable, &StoreConfig) -> Result<T>,
    ) -> Result<T> {
        let mut state = self.lock();
        let State { provider, config } = &mut *state;
        let provider = provider.as_mut().ok_or_else(|| self.unavailable())?;
        f(provider, &self.table, config)
    }

    /// Runs `f` inside one transaction of the attached provider.
    fn transaction<T>(&self, f: impl FnOnce(&Transaction<'_>, &MessageTable) -> Result<T>) -> Result<T> {
        self.with_provider(|provider, table, _| provider.with_connection(|tx| f(tx, table)))
    }

    fn delete_stale_messages(&self, purge_age: Duration) -> Result<PurgeReport> {
        let cutoff = Timestamp::now().saturating_sub(purge_age).as_millis();

        let report = self.transaction(|tx, table| {
            Ok(PurgeReport {
                dropped: tx.execute(&table.delete_dropped, [cutoff])?,
                confirmed: tx.execute(&table.delete_confirmed, [cutoff])?,
                published_qos0: tx.execute(&table.delete_published_qos0, [cutoff])?,
            })
        })?;

        debug!(
            collection = %self.table.name,
            dropped = report.dropped,
            confirmed = report.confirmed,
            published_qos0 = report.published_qos0,
            "deleted stale messages"
        );
        Ok(report)
    }

    fn repair(&self) -> Result<RepairReport> {
        self.with_provider(|provider, table, _| {
            let report = provider.with_connection(|tx| repair::deduplicate(tx, table))?;
            if !report.is_clean() {
                provider.checkpoint().map_err(|e| match e {
                    Error::Storage(source) => Error::Repair {
                        step: "checkpoint",
                        source,
                    },
                    other => other,
                })?;
                info!(
                    collection = %table.name,
                    duplicate_ids = report.duplicate_ids,
                    rows_removed = report.rows_removed,
                    "repair complete"
                );
            }
            Ok(report)
        })
    }

    fn checkpoint(&self) -> Result<()> {
        self.with_provider(|provider, _, _| provider.checkpoint())
    }

    /// One housekeeper pass. Each step is attempted even if an earlier one
    /// failed.
    fn housekeeping_pass(&self) -> Result<()> {
        let config = {
            let state = self.lock();
            if state.provider.is_none() {
                return Err(self.unavailable());
            }
            state.config.clone()
        };

        match self.delete_stale_messages(config.purge_age()) {
            Ok(report) if report.total() > 0 => {
                info!(collection = %self.table.name, purged = report.total(), "purged stale messages");
            }
            Ok(_) => {}
            Err(e) => error!(collection = %self.table.name, step = "purge", error = %e, "housekeeping step failed"),
        }

        if config.repair_enabled {
            if let Err(e) = self.repair() {
                error!(collection = %self.table.name, step = "repair", error = %e, "housekeeping step failed");
            }
        }

        if config.checkpoint_enabled {
            if let Err(e) = self.checkpoint() {
                error!(collection = %self.table.name, step = "checkpoint", error = %e, "housekeeping step failed");
            }
        }

        Ok(())
    }
}

// =============================================================================
// Message Store
// =============================================================================

/// A durable, priority-ordered, QoS-aware outbound message queue.
///
/// The store is created detached. [`start`](Self::start) attaches a
/// [`ConnectionProvider`], creates the schema and spawns the housekeeper.
/// All operations on a detached store fail with
/// [`Error::StoreUnavailable`].
///
/// `MessageStore` is `Sync`; share it between threads with an `Arc`.
///
/// # Example
///
/// ```rust,no_run
/// use outboxdb::{MessageStore, Priority, Qos, StoreConfig};
///
/// let store = MessageStore::open("outbox.db", "ds_messages", StoreConfig::default())?;
///
/// let id = store.store("spBv1.0/group/DDATA/edge", Some(b"payload".as_slice()), Qos::AT_LEAST_ONCE, false, Priority::new(7))?;
///
/// if let Some(next) = store.get_next_message()? {
///     // hand `next` to the transport...
///     store.mark_as_published(next.id)?;
/// }
/// store.mark_as_confirmed(id)?;
/// # Ok::<(), outboxdb::Error>(())
/// ```
pub struct MessageStore<P: ConnectionProvider = SqliteProvider> {
    housekeeper: Mutex<Option<Housekeeper>>,
    shared: Arc<Shared<P>>,
}

impl MessageStore<SqliteProvider> {
    /// Opens (or creates) a database file and starts a store on it.
    pub fn open(
        path: impl AsRef<Path>,
        collection: &str,
        config: StoreConfig,
    ) -> Result<Self> {
        let provider = SqliteProvider::open(path, &ProviderOptions::default())?;
        let store = Self::new(collection)?;
        store.start(provider, config)?;
        Ok(store)
    }

    /// Starts a store on a private in-memory database.
    pub fn open_in_memory(collection: &str, config: StoreConfig) -> Result<Self> {
        let store = Self::new(collection)?;
        store.start(SqliteProvider::open_in_memory()?, config)?;
        Ok(store)
    }
}

impl<P: ConnectionProvider> MessageStore<P> {
    // =========================================================================
    // Lifecycle
    // =========================================================================

    /// Creates a detached store for `collection`.
    ///
    /// # Errors
    ///
    /// `Error::Validation` if `collection` is not a valid identifier.
    pub fn new(collection: &str) -> Result<Self> {
        Self::with_id_limit(collection, MAX_MESSAGE_ID)
    }

    fn with_id_limit(collection: &str, id_limit: i64) -> Result<Self> {
        let name = CollectionName::new(collection)?;
        Ok(Self {
            housekeeper: Mutex::new(None),
            shared: Arc::new(Shared {
                table: MessageTable::new(name),
                id_limit,
                state: Mutex::new(State {
                    provider: None,
                    config: StoreConfig::default(),
                }),
            }),
        })
    }

    /// Attaches `provider`, creates the schema and starts the housekeeper.
    ///
    /// A provider that is already attached is replaced and dropped.
    pub fn start(&self, provider: P, config: StoreConfig) -> Result<()> {
        self.reconfigure(Some(provider), config)?;
        info!(collection = %self.shared.table.name, "message store started");
        Ok(())
    }

    /// Re-applies configuration to an attached store.
    ///
    /// Recreates any missing schema objects and restarts the housekeeper on
    /// the new interval. Stored rows are kept. Safe to call repeatedly.
    pub fn update(&self, config: StoreConfig) -> Result<()> {
        self.reconfigure(None, config)?;
        info!(collection = %self.shared.table.name, "message store configuration updated");
        Ok(())
    }

    /// Swaps the connection provider, returning the previous one.
    ///
    /// The swap happens under the store lock, so no operation observes a
    /// half-bound provider. Starts the housekeeper if the store was detached.
    pub fn rebind(&self, provider: P) -> Result<Option<P>> {
        let mut slot = self.lock_housekeeper();

        let (previous, config) = {
            let mut state = self.shared.lock();
            let mut provider = provider;
            provider.with_connection(|tx| schema::ensure_schema(tx, &self.shared.table))?;
            (state.provider.replace(provider), state.config.clone())
        };

        if slot.is_none() {
            *slot = Some(self.spawn_housekeeper(&config)?);
        }

        info!(
            collection = %self.shared.table.name,
            replaced = previous.is_some(),
            "connection provider rebound"
        );
        Ok(previous)
    }

    /// Stops the housekeeper and detaches the provider, returning it.
    ///
    /// Rows are untouched; starting again with the same database resumes
    /// where the store left off.
    pub fn stop(&self) -> Option<P> {
        if let Some(mut housekeeper) = self.lock_housekeeper().take() {
            housekeeper.stop();
        }

        let provider = self.shared.lock().provider.take();
        if provider.is_some() {
            info!(collection = %self.shared.table.name, "message store stopped");
        }
        provider
    }

    /// Returns true if a provider is attached.
    pub fn is_attached(&self) -> bool {
        self.shared.lock().provider.is_some()
    }

    /// The collection this store manages.
    pub fn collection(&self) -> &str {
        self.shared.table.name.as_str()
    }

    /// The configuration currently in effect.
    pub fn config(&self) -> StoreConfig {
        self.shared.lock().config.clone()
    }

    /// State of the background housekeeper.
    pub fn housekeeper_state(&self) -> HousekeeperState {
        self.lock_housekeeper()
            .as_ref()
            .map_or(HousekeeperState::Stopped, Housekeeper::state)
    }

    /// Number of housekeeper passes run since the last (re)configuration.
    pub fn housekeeper_passes(&self) -> u64 {
        self.lock_housekeeper()
            .as_ref()
            .map_or(0, Housekeeper::passes)
    }

    fn lock_housekeeper(&self) -> MutexGuard<'_, Option<Housekeeper>> {
        self.housekeeper.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Shared path of `start` (with a provider) and `update` (without).
    ///
    /// On failure the previous provider and config stay in effect, and a
    /// housekeeper that was running is restarted with the previous config.
    fn reconfigure(&self, provider: Option<P>, config: StoreConfig) -> Result<()> {
        config.validate()?;

        let mut slot = self.lock_housekeeper();
        let was_running = match slot.take() {
            Some(mut housekeeper) => {
                housekeeper.stop();
                true
            }
            None => false,
        };

        if let Err(e) = self.apply(provider, &config) {
            if was_running {
                let previous = self.shared.lock().config.clone();
                match self.spawn_housekeeper(&previous) {
                    Ok(housekeeper) => *slot = Some(housekeeper),
                    Err(spawn_err) => error!(
                        collection = %self.shared.table.name,
                        error = %spawn_err,
                        "failed to restart housekeeper"
                    ),
                }
            }
            warn!(collection = %self.shared.table.name, error = %e, "reconfiguration rejected");
            return Err(e);
        }

        *slot = Some(self.spawn_housekeeper(&config)?);
        Ok(())
    }

    /// Readies the schema on the incoming (or attached) provider, then
    /// installs it along with `config`. Nothing changes on error.
    fn apply(&self, provider: Option<P>, config: &StoreConfig) -> Result<()> {
        let mut state = self.shared.lock();
        match provider {
            Some(mut incoming) => {
                incoming.with_connection(|tx| schema::ensure_schema(tx, &self.shared.table))?;
                state.provider = Some(incoming);
            }
            None => {
                let attached = state
                    .provider
                    .as_mut()
                    .ok_or_else(|| self.shared.unavailable())?;
                attached.with_connection(|tx| schema::ensure_schema(tx, &self.shared.table))?;
            }
        }
        state.config = config.clone();
        Ok(())
    }

    fn spawn_housekeeper(&self, config: &StoreConfig) -> Result<Housekeeper> {
        let shared = Arc::downgrade(&self.shared);
        Housekeeper::spawn(
            self.shared.table.name.to_string(),
            INITIAL_DELAY,
            config.housekeeper_interval(),
            move || match shared.upgrade() {
                Some(shared) => shared.housekeeping_pass(),
                None => Ok(()),
            },
        )
    }

    // =========================================================================
    // Insert
    // =========================================================================

    /// Queues a new message and returns its id.
    ///
    /// # Errors
    ///
    /// - `Error::Validation` if `topic` is empty or whitespace
    /// - `Error::CapacityExceeded` if the store is full and `priority` is not
    ///   reserved
    /// - `Error::StoreUnavailable` if no provider is attached
    pub fn store(
        &self,
        topic: &str,
        payload: Option<&[u8]>,
        qos: Qos,
        retain: bool,
        priority: Priority,
    ) -> Result<MessageId> {
        if topic.trim().is_empty() {
            return Err(Error::validation("topic", "must not be empty"));
        }

        let id_limit = self.shared.id_limit;
        self.shared.with_provider(|provider, table, config| {
            if !priority.is_reserved() {
                let count = provider.with_connection(|tx| count_rows(tx, table))?;
                debug!(collection = %table.name, count, capacity = config.capacity, "checking capacity");
                if count >= u64::from(config.capacity) {
                    error!(
                        collection = %table.name,
                        count,
                        capacity = config.capacity,
                        "message store full, rejecting message"
                    );
                    return Err(Error::CapacityExceeded {
                        capacity: config.capacity,
                        count,
                    });
                }
            }

            let created_on = Timestamp::now();
            let insert = |provider: &mut P| {
                provider.with_connection(|tx| {
                    let id = sequence::next_id(tx, table, id_limit)?;
                    tx.prepare_cached(&table.insert)?.execute(params![
                        id.as_raw(),
                        topic,
                        qos.as_raw(),
                        retain,
                        priority.as_raw(),
                        created_on.as_millis(),
                        payload,
                    ])?;
                    Ok(id)
                })
            };

            let id = match insert(&mut *provider) {
                Err(Error::SequenceExhausted { limit, .. }) => {
                    warn!(collection = %table.name, limit, "message id sequence exhausted, retrying after reset");
                    provider.with_connection(|tx| sequence::reset(tx, table))?;
                    insert(&mut *provider)?
                }
                other => other?,
            };

            debug!(collection = %table.name, %id, topic, priority = %priority, "stored message");
            Ok(id)
        })
    }

    // =========================================================================
    // Reads
    // =========================================================================

    /// Returns the message with `id`, payload included.
    pub fn get(&self, id: MessageId) -> Result<Option<StoredMessage>> {
        self.shared.transaction(|tx, table| {
            Ok(tx
                .prepare_cached(&table.get)?
                .query_row([id.as_raw()], |row| message_from_row(row, true))
                .optional()?)
        })
    }

    /// Returns the next message to publish, payload included.
    ///
    /// Among unpublished rows: lowest priority value first, then oldest
    /// `created_on`, then lowest id.
    pub fn get_next_message(&self) -> Result<Option<StoredMessage>> {
        self.shared.transaction(|tx, table| {
            Ok(tx
                .prepare_cached(&table.next)?
                .query_row([], |row| message_from_row(row, true))
                .optional()?)
        })
    }

    /// All unpublished messages in publish order, without payloads.
    pub fn get_unpublished_messages(&self) -> Result<Vec<StoredMessage>> {
        self.list(|table| &table.list_unpublished)
    }

    /// Published, unconfirmed, not dropped `qos > 0` messages, without payloads.
    pub fn get_in_flight_messages(&self) -> Result<Vec<StoredMessage>> {
        self.list(|table| &table.list_in_flight)
    }

    /// Dropped messages awaiting purge, without payloads.
    pub fn get_dropped_messages(&self) -> Result<Vec<StoredMessage>> {
        self.list(|table| &table.list_dropped)
    }

    /// Number of rows in the collection.
    pub fn get_message_count(&self) -> Result<u64> {
        self.shared.transaction(count_rows)
    }

    fn list(&self, sql: impl FnOnce(&MessageTable) -> &String) -> Result<Vec<StoredMessage>> {
        self.shared.transaction(|tx, table| {
            let mut stmt = tx.prepare_cached(sql(table))?;
            let rows = stmt.query_map([], |row| message_from_row(row, false))?;
            Ok(rows.collect::<rusqlite::Result<Vec<_>>>()?)
        })
    }

    // =========================================================================
    // Lifecycle Transitions
    // =========================================================================

    /// Marks a message as handed to the transport.
    ///
    /// Unknown ids are ignored.
    pub fn mark_as_published(&self, id: MessageId) -> Result<()> {
        let now = Timestamp::now().as_millis();
        self.update_one("published", id, |tx, table| {
            tx.execute(&table.set_published, params![now, id.as_raw()])
        })
    }

    /// Marks a message as handed to the transport and records its token.
    pub fn mark_as_published_with_token(
        &self,
        id: MessageId,
        token: &DataTransportToken,
    ) -> Result<()> {
        let now = Timestamp::now().as_millis();
        self.update_one("published", id, |tx, table| {
            tx.execute(
                &table.set_published_with_token,
                params![now, token.message_id, token.session_id, id.as_raw()],
            )
        })
    }

    /// Marks a message as confirmed by the broker.
    ///
    /// Only a published, not dropped message can be confirmed. For unknown,
    /// unpublished or dropped ids this is a no-op.
    pub fn mark_as_confirmed(&self, id: MessageId) -> Result<()> {
        let now = Timestamp::now().as_millis();
        self.update_one("confirmed", id, |tx, table| {
            tx.execute(&table.set_confirmed, params![now, id.as_raw()])
        })
    }

    fn update_one(
        &self,
        transition: &'static str,
        id: MessageId,
        f: impl FnOnce(&Transaction<'_>, &MessageTable) -> rusqlite::Result<usize>,
    ) -> Result<()> {
        let updated = self.shared.transaction(|tx, table| Ok(f(tx, table)?))?;
        if updated == 0 {
            debug!(collection = %self.shared.table.name, %id, transition, "no message with this id");
        }
        Ok(())
    }

    /// Requeues every in-flight message. Returns the number of rows requeued.
    ///
    /// Used after a reconnect: the broker session is gone, so unconfirmed
    /// messages must be sent again.
    pub fn unpublish_all_in_flight_messages(&self) -> Result<usize> {
        let count = self
            .shared
            .transaction(|tx, table| Ok(tx.execute(&table.unpublish_in_flight, [])?))?;
        info!(collection = %self.shared.table.name, count, "requeued in-flight messages");
        Ok(count)
    }

    /// Marks every in-flight message as dropped. Returns the number of rows.
    pub fn drop_all_in_flight_messages(&self) -> Result<usize> {
        let now = Timestamp::now().as_millis();
        let count = self
            .shared
            .transaction(|tx, table| Ok(tx.execute(&table.drop_in_flight, [now])?))?;
        info!(collection = %self.shared.table.name, count, "dropped in-flight messages");
        Ok(count)
    }

    // =========================================================================
    // Maintenance
    // =========================================================================

    /// Deletes terminal rows older than `purge_age`.
    ///
    /// Three independent deletions: dropped rows by `dropped_on`, confirmed
    /// rows by `confirmed_on`, published `qos = 0` rows by `published_on`.
    /// A zero age deletes every eligible row.
    pub fn delete_stale_messages(&self, purge_age: Duration) -> Result<PurgeReport> {
        self.shared.delete_stale_messages(purge_age)
    }

    /// Removes duplicate-id rows and rebuilds the unique id index.
    ///
    /// A no-op on a consistent table.
    pub fn repair(&self) -> Result<RepairReport> {
        self.shared.repair()
    }

    /// Forces the engine to flush its log into the database file.
    pub fn checkpoint(&self) -> Result<()> {
        self.shared.checkpoint()
    }

    /// Runs `f` on the raw connection, under the store lock.
    ///
    /// For diagnostics. Writes made here bypass every store invariant.
    pub fn with_plain_connection<T>(&self, f: impl FnOnce(&Connection) -> Result<T>) -> Result<T> {
        self.shared
            .with_provider(|provider, _, _| provider.with_plain_connection(f))
    }
}

// =============================================================================
// Row Mapping
// =============================================================================

fn count_rows(tx: &Transaction<'_>, table: &MessageTable) -> Result<u64> {
    let count: i64 = tx
        .prepare_cached(&table.count)?
        .query_row([], |row| row.get(0))?;
    Ok(count.max(0) as u64)
}

/// Maps a row selected with the metadata columns (and `payload` last when
/// `with_payload` is set).
fn message_from_row(row: &Row<'_>, with_payload: bool) -> rusqlite::Result<StoredMessage> {
    let published_message_id: Option<i32> = row.get(7)?;
    let session_id: Option<String> = row.get(8)?;
    let transport_token = match (published_message_id, session_id) {
        (Some(message_id), Some(session_id)) => Some(DataTransportToken {
            message_id,
            session_id,
        }),
        _ => None,
    };

    let timestamp = |idx: usize| -> rusqlite::Result<Option<Timestamp>> {
        Ok(row.get::<_, Option<i64>>(idx)?.map(Timestamp::from_millis))
    };

    Ok(StoredMessage {
        id: MessageId::from_raw(row.get(0)?),
        topic: row.get(1)?,
        qos: Qos::new(row.get(2)?),
        retain: row.get(3)?,
        priority: Priority::new(row.get(4)?),
        created_on: Timestamp::from_millis(row.get(5)?),
        published_on: timestamp(6)?,
        confirmed_on: timestamp(9)?,
        dropped_on: timestamp(10)?,
        payload: if with_payload { row.get(11)? } else { None },
        transport_token,
    })
}

// =============================================================================
// Tests
// =============================================================================
