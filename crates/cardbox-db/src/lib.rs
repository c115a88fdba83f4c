//! Persistent contacts database engine.
//!
//! Stores personal contact records in an embedded SQLite database, keeps
//! multiple source-specific copies of the same real-world person
//! synchronized into a single presented `aggregate` contact, and answers
//! queries about them.
//!
//! The engine is built from three tightly-coupled subsystems:
//!
//! - the **aggregation engine** ([`aggregate_ops`]): matches incoming
//!   contacts to existing aggregates by heuristic scoring, promotes
//!   constituent details onto aggregates, applies aggregate edits back
//!   down to constituents, and regenerates aggregates when constituents
//!   change or disappear;
//! - the **write pipeline** ([`writer`]): validates detail constraints,
//!   recomputes derived fields, orchestrates the row stores and the
//!   aggregation engine inside a single transaction, and accumulates
//!   change sets for notification;
//! - the **sync delta protocol** ([`sync_ops`]): computes the subset of
//!   local state a sync peer must see and applies remote changes under a
//!   conflict policy, reporting deletions via a tombstone table.
//!
//! Side channels: an out-of-band key/value store ([`oob_ops`]), the
//! identity map ([`identity_ops`]), and the transient presence store
//! boundary ([`transient`]).

mod aggregate_ops;
pub mod comparator;
mod contact_store;
mod identity_ops;
mod oob_ops;
pub mod registry;
mod relationship_ops;
mod schema;
mod sync_ops;
pub mod transient;
mod writer;

use std::collections::{BTreeMap, BTreeSet};
use std::ops;
use std::path::PathBuf;
use std::sync::{Arc, Mutex};

use cardbox_core::{ContactId, ContactRecord, DetailKind, Relationship, Timestamp};
use rusqlite::Connection;
use snafu::{Location, Snafu};
use tokio::sync::broadcast;
use tracing::debug;

pub use crate::identity_ops::Identity;
pub use crate::oob_ops::OobValue;
pub use crate::sync_ops::{ConflictPolicy, SyncFetchResult};
pub use crate::transient::{MemoryTransientStore, TransientStore};

const LOG_TARGET: &str = "cardbox::db";

/// Error classification exposed through per-item error maps, ordered by
/// severity: when a batch observes several errors, the maximum is
/// returned as the overall result.
#[derive(Copy, Clone, Debug, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum ErrorKind {
    DoesNotExist,
    BadArgument,
    NotSupported,
    AlreadyExists,
    InvalidDetail,
    InvalidRelationship,
    InvalidContactType,
    LimitReached,
    Locked,
    Unspecified,
}

#[derive(Debug, Snafu)]
#[snafu(visibility(pub(crate)))]
pub enum DbError {
    #[snafu(display("Does not exist"))]
    DoesNotExist {
        #[snafu(implicit)]
        location: Location,
    },
    #[snafu(display("Already exists"))]
    AlreadyExists {
        #[snafu(implicit)]
        location: Location,
    },
    #[snafu(display("Invalid detail: {reason}"))]
    InvalidDetail {
        reason: String,
        #[snafu(implicit)]
        location: Location,
    },
    #[snafu(display("Invalid relationship: {reason}"))]
    InvalidRelationship {
        reason: String,
        #[snafu(implicit)]
        location: Location,
    },
    #[snafu(display("Invalid contact type"))]
    InvalidContactType {
        #[snafu(implicit)]
        location: Location,
    },
    #[snafu(display("Singular detail limit reached"))]
    LimitReached {
        #[snafu(implicit)]
        location: Location,
    },
    #[snafu(display("Bad argument: {reason}"))]
    BadArgument {
        reason: String,
        #[snafu(implicit)]
        location: Location,
    },
    #[snafu(display("Not supported"))]
    NotSupported {
        #[snafu(implicit)]
        location: Location,
    },
    #[snafu(display("Locked by a failed batch"))]
    Locked {
        #[snafu(implicit)]
        location: Location,
    },
    #[snafu(display("Unspecified failure: {reason}"))]
    Unspecified {
        reason: String,
        #[snafu(implicit)]
        location: Location,
    },
    #[snafu(transparent)]
    Sql {
        source: rusqlite::Error,
        #[snafu(implicit)]
        location: Location,
    },
    #[snafu(display("Database schema version {db_ver} is newer than supported {code_ver}"))]
    DbVersionTooHigh {
        db_ver: u32,
        code_ver: u32,
        #[snafu(implicit)]
        location: Location,
    },
}

pub type DbResult<T> = std::result::Result<T, DbError>;

impl DbError {
    pub fn kind(&self) -> ErrorKind {
        match self {
            Self::DoesNotExist { .. } => ErrorKind::DoesNotExist,
            Self::AlreadyExists { .. } => ErrorKind::AlreadyExists,
            Self::InvalidDetail { .. } => ErrorKind::InvalidDetail,
            Self::InvalidRelationship { .. } => ErrorKind::InvalidRelationship,
            Self::InvalidContactType { .. } => ErrorKind::InvalidContactType,
            Self::LimitReached { .. } => ErrorKind::LimitReached,
            Self::BadArgument { .. } => ErrorKind::BadArgument,
            Self::NotSupported { .. } => ErrorKind::NotSupported,
            Self::Locked { .. } => ErrorKind::Locked,
            Self::Unspecified { .. }
            | Self::Sql { .. }
            | Self::DbVersionTooHigh { .. } => ErrorKind::Unspecified,
        }
    }

    pub(crate) fn from_kind(kind: ErrorKind) -> Self {
        match kind {
            ErrorKind::DoesNotExist => DoesNotExistSnafu.build(),
            ErrorKind::AlreadyExists => AlreadyExistsSnafu.build(),
            ErrorKind::InvalidDetail => InvalidDetailSnafu {
                reason: "invalid detail in batch",
            }
            .build(),
            ErrorKind::InvalidRelationship => InvalidRelationshipSnafu {
                reason: "invalid relationship in batch",
            }
            .build(),
            ErrorKind::InvalidContactType => InvalidContactTypeSnafu.build(),
            ErrorKind::LimitReached => LimitReachedSnafu.build(),
            ErrorKind::BadArgument => BadArgumentSnafu {
                reason: "bad argument in batch",
            }
            .build(),
            ErrorKind::NotSupported => NotSupportedSnafu.build(),
            ErrorKind::Locked => LockedSnafu.build(),
            ErrorKind::Unspecified => UnspecifiedSnafu {
                reason: "batch failed",
            }
            .build(),
        }
    }
}

/// Per-item error map for batch operations: input index → error kind.
pub type ErrorMap = BTreeMap<usize, ErrorKind>;

/// Lifecycle of one aggregate within a transaction.
///
/// `Nonexistent → Created → (Updated*) → ChildlessPending → Removed`;
/// a childless-pending aggregate is revived to `Updated` if a new
/// constituent appears before commit.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub(crate) enum AggregateLifecycle {
    Created,
    Updated,
    ChildlessPending,
    Removed,
}

impl AggregateLifecycle {
    fn on_constituent_changed(self) -> Self {
        match self {
            Self::Created => Self::Created,
            Self::Updated | Self::ChildlessPending => Self::Updated,
            Self::Removed => Self::Removed,
        }
    }

    fn on_childless(self) -> Self {
        match self {
            Self::Removed => Self::Removed,
            _ => Self::ChildlessPending,
        }
    }
}

/// Change sets accumulated over one transaction, dropped wholesale on
/// rollback. Deliberately constructed inside the transaction scope and
/// never stored on the engine.
#[derive(Debug, Default)]
pub(crate) struct ChangeSet {
    added: BTreeSet<ContactId>,
    changed: BTreeSet<ContactId>,
    presence_changed: BTreeSet<ContactId>,
    removed: BTreeSet<ContactId>,
    affected_sync_targets: BTreeSet<String>,
    aggregates: BTreeMap<ContactId, AggregateLifecycle>,
}

impl ChangeSet {
    pub(crate) fn note_added(&mut self, id: ContactId) {
        self.added.insert(id);
    }

    pub(crate) fn note_changed(&mut self, id: ContactId) {
        if !self.added.contains(&id) {
            self.changed.insert(id);
        }
    }

    pub(crate) fn note_presence_changed(&mut self, id: ContactId) {
        self.presence_changed.insert(id);
    }

    pub(crate) fn note_removed(&mut self, id: ContactId) {
        self.added.remove(&id);
        self.changed.remove(&id);
        self.presence_changed.remove(&id);
        self.removed.insert(id);
    }

    pub(crate) fn note_sync_target(&mut self, sync_target: &str) {
        // Aggregate and local-device changes do not constitute sync
        // activity.
        if !sync_target.is_empty()
            && sync_target != "aggregate"
            && sync_target != "local"
            && sync_target != "was_local"
        {
            self.affected_sync_targets.insert(sync_target.to_owned());
        }
    }

    /// A sync peer applying its own update is not re-notified about it.
    pub(crate) fn suppress_sync_target(&mut self, sync_target: &str) {
        self.affected_sync_targets.remove(sync_target);
    }

    pub(crate) fn aggregate_created(&mut self, id: ContactId) {
        self.aggregates.insert(id, AggregateLifecycle::Created);
        self.note_added(id);
    }

    pub(crate) fn aggregate_updated(&mut self, id: ContactId) {
        let state = self
            .aggregates
            .get(&id)
            .copied()
            .map(AggregateLifecycle::on_constituent_changed)
            .unwrap_or(AggregateLifecycle::Updated);
        self.aggregates.insert(id, state);
        if state == AggregateLifecycle::Updated {
            self.note_changed(id);
        }
    }

    pub(crate) fn aggregate_childless(&mut self, id: ContactId) {
        let state = self
            .aggregates
            .get(&id)
            .copied()
            .map(AggregateLifecycle::on_childless)
            .unwrap_or(AggregateLifecycle::ChildlessPending);
        self.aggregates.insert(id, state);
    }

    pub(crate) fn aggregate_removed(&mut self, id: ContactId) {
        self.aggregates.insert(id, AggregateLifecycle::Removed);
        self.note_removed(id);
    }

    /// Aggregates still pending removal when the transaction is about to
    /// commit. These must be pruned before the commit happens.
    pub(crate) fn childless_pending(&self) -> Vec<ContactId> {
        self.aggregates
            .iter()
            .filter(|(_, state)| **state == AggregateLifecycle::ChildlessPending)
            .map(|(id, _)| *id)
            .collect()
    }

    pub(crate) fn is_empty(&self) -> bool {
        self.added.is_empty()
            && self.changed.is_empty()
            && self.presence_changed.is_empty()
            && self.removed.is_empty()
            && self.affected_sync_targets.is_empty()
    }

    pub(crate) fn removed_ids(&self) -> impl Iterator<Item = ContactId> + '_ {
        self.removed.iter().copied()
    }
}

/// Senders for the outbound change signals. Emission order is fixed:
/// added → changed → presenceChanged → syncContactsChanged → removed.
#[derive(Clone)]
struct Notifier {
    contacts_added: broadcast::Sender<Vec<ContactId>>,
    contacts_changed: broadcast::Sender<Vec<ContactId>>,
    presence_changed: broadcast::Sender<Vec<ContactId>>,
    sync_contacts_changed: broadcast::Sender<Vec<String>>,
    contacts_removed: broadcast::Sender<Vec<ContactId>>,
    self_contact_id_changed: broadcast::Sender<(ContactId, ContactId)>,
}

impl Notifier {
    fn new() -> Self {
        let (contacts_added, _) = broadcast::channel(64);
        let (contacts_changed, _) = broadcast::channel(64);
        let (presence_changed, _) = broadcast::channel(64);
        let (sync_contacts_changed, _) = broadcast::channel(64);
        let (contacts_removed, _) = broadcast::channel(64);
        let (self_contact_id_changed, _) = broadcast::channel(8);
        Self {
            contacts_added,
            contacts_changed,
            presence_changed,
            sync_contacts_changed,
            contacts_removed,
            self_contact_id_changed,
        }
    }

    fn emit(&self, change_set: &ChangeSet) {
        if !change_set.added.is_empty() {
            let _ = self
                .contacts_added
                .send(change_set.added.iter().copied().collect());
        }
        if !change_set.changed.is_empty() {
            let _ = self
                .contacts_changed
                .send(change_set.changed.iter().copied().collect());
        }
        if !change_set.presence_changed.is_empty() {
            let _ = self
                .presence_changed
                .send(change_set.presence_changed.iter().copied().collect());
        }
        if !change_set.affected_sync_targets.is_empty() {
            let _ = self
                .sync_contacts_changed
                .send(change_set.affected_sync_targets.iter().cloned().collect());
        }
        if !change_set.removed.is_empty() {
            let _ = self
                .contacts_removed
                .send(change_set.removed.iter().copied().collect());
        }
    }
}

/// A write transaction plus hooks to run after a successful commit.
///
/// Dropping the context without calling [`commit`](Self::commit) rolls
/// the transaction back and discards the hooks.
pub(crate) struct WriteTxCtx<'conn> {
    tx: rusqlite::Transaction<'conn>,
    on_commit: Mutex<Vec<Box<dyn FnOnce() + 'static>>>,
}

impl<'conn> From<rusqlite::Transaction<'conn>> for WriteTxCtx<'conn> {
    fn from(tx: rusqlite::Transaction<'conn>) -> Self {
        Self {
            tx,
            on_commit: Mutex::new(vec![]),
        }
    }
}

impl<'conn> ops::Deref for WriteTxCtx<'conn> {
    type Target = rusqlite::Transaction<'conn>;

    fn deref(&self) -> &Self::Target {
        &self.tx
    }
}

impl WriteTxCtx<'_> {
    pub(crate) fn on_commit(&self, f: impl FnOnce() + 'static) {
        self.on_commit
            .lock()
            .expect("Locking failed")
            .push(Box::new(f));
    }

    fn commit(self) -> DbResult<()> {
        let Self { tx, on_commit } = self;

        tx.commit()?;

        for hook in on_commit.lock().expect("Locking failed").drain(..) {
            hook();
        }
        Ok(())
    }
}

/// Handle to one contacts database.
///
/// Single-writer, multiple-reader: all access to the connection is
/// serialized by one mutex; operations within one call run in a single
/// transaction and see a consistent snapshot.
pub struct ContactsDb {
    conn: Mutex<Connection>,
    transient: Arc<dyn TransientStore>,
    notifier: Notifier,
}

impl ContactsDb {
    pub fn open(path: impl Into<PathBuf>) -> DbResult<Self> {
        let path = path.into();
        debug!(target: LOG_TARGET, path = %path.display(), "Opening contacts database");
        Self::open_inner(Connection::open(path)?)
    }

    pub fn open_in_memory() -> DbResult<Self> {
        debug!(target: LOG_TARGET, "Opening in-memory contacts database");
        Self::open_inner(Connection::open_in_memory()?)
    }

    fn open_inner(conn: Connection) -> DbResult<Self> {
        schema::prepare_database(&conn)?;

        Ok(Self {
            conn: Mutex::new(conn),
            transient: Arc::new(MemoryTransientStore::default()),
            notifier: Notifier::new(),
        })
    }

    /// Replaces the transient presence store, e.g. with a shared-memory
    /// implementation owned by another component.
    pub fn with_transient_store(mut self, store: Arc<dyn TransientStore>) -> Self {
        self.transient = store;
        self
    }

    pub(crate) fn transient(&self) -> &Arc<dyn TransientStore> {
        &self.transient
    }

    pub(crate) fn write_with<T>(
        &self,
        f: impl FnOnce(&WriteTxCtx) -> DbResult<T>,
    ) -> DbResult<T> {
        let mut conn = self.conn.lock().expect("Locking failed");
        let ctx = WriteTxCtx::from(conn.transaction()?);

        let res = f(&ctx)?;

        ctx.commit()?;
        Ok(res)
    }

    pub(crate) fn read_with<T>(&self, f: impl FnOnce(&Connection) -> DbResult<T>) -> DbResult<T> {
        let conn = self.conn.lock().expect("Locking failed");
        f(&conn)
    }

    /// Registers the post-commit notification hook for a transaction's
    /// change set.
    pub(crate) fn notify_on_commit(&self, ctx: &WriteTxCtx, change_set: ChangeSet) {
        if change_set.is_empty() {
            return;
        }
        let notifier = self.notifier.clone();
        ctx.on_commit(move || notifier.emit(&change_set));
    }

    pub fn subscribe_contacts_added(&self) -> broadcast::Receiver<Vec<ContactId>> {
        self.notifier.contacts_added.subscribe()
    }

    pub fn subscribe_contacts_changed(&self) -> broadcast::Receiver<Vec<ContactId>> {
        self.notifier.contacts_changed.subscribe()
    }

    pub fn subscribe_presence_changed(&self) -> broadcast::Receiver<Vec<ContactId>> {
        self.notifier.presence_changed.subscribe()
    }

    pub fn subscribe_sync_contacts_changed(&self) -> broadcast::Receiver<Vec<String>> {
        self.notifier.sync_contacts_changed.subscribe()
    }

    pub fn subscribe_contacts_removed(&self) -> broadcast::Receiver<Vec<ContactId>> {
        self.notifier.contacts_removed.subscribe()
    }

    pub fn subscribe_self_contact_id_changed(
        &self,
    ) -> broadcast::Receiver<(ContactId, ContactId)> {
        self.notifier.self_contact_id_changed.subscribe()
    }

    // ---- Contact reads ----

    pub fn get_contact(&self, id: ContactId) -> DbResult<Option<ContactRecord>> {
        self.read_with(|conn| contact_store::get_contact(conn, id))
    }

    pub fn get_contacts(&self, ids: &[ContactId]) -> DbResult<Vec<ContactRecord>> {
        self.read_with(|conn| {
            ids.iter()
                .filter_map(|id| contact_store::get_contact(conn, *id).transpose())
                .collect()
        })
    }

    pub fn contact_exists(&self, id: ContactId) -> DbResult<Option<cardbox_core::SyncTarget>> {
        self.read_with(|conn| contact_store::contact_sync_target(conn, id))
    }

    // ---- Write pipeline ----

    /// Saves a batch of contacts. New records (id 0) are created and
    /// their ids filled in; existing records are updated. `mask`
    /// restricts updates to the named detail kinds (empty = all).
    ///
    /// Per-item failures land in `error_map`; the worst kind observed is
    /// returned. Transactional failures roll the whole batch back.
    pub fn save_contacts(
        &self,
        contacts: &mut [ContactRecord],
        mask: &[DetailKind],
        error_map: &mut ErrorMap,
    ) -> DbResult<()> {
        writer::save_batch(self, contacts, mask, error_map)
    }

    /// Removes contacts and their tombstones atomically; prunes childless
    /// aggregates and regenerates affected ones.
    pub fn remove_contacts(&self, ids: &[ContactId], error_map: &mut ErrorMap) -> DbResult<()> {
        writer::remove_batch(self, ids, error_map)
    }

    // ---- Relationships ----

    pub fn save_relationships(
        &self,
        relationships: &[Relationship],
        error_map: &mut ErrorMap,
    ) -> DbResult<()> {
        relationship_ops::save_batch(self, relationships, error_map)
    }

    pub fn remove_relationships(
        &self,
        relationships: &[Relationship],
        error_map: &mut ErrorMap,
    ) -> DbResult<()> {
        relationship_ops::remove_batch(self, relationships, error_map)
    }

    pub fn relationships_for(&self, id: ContactId) -> DbResult<Vec<Relationship>> {
        self.read_with(|conn| relationship_ops::relationships_for(conn, id))
    }

    // ---- Sync delta protocol ----

    pub fn fetch_sync_contacts(
        &self,
        sync_target: &str,
        since: Timestamp,
        exported_ids: &[ContactId],
    ) -> DbResult<SyncFetchResult> {
        sync_ops::fetch(self, sync_target, since, exported_ids)
    }

    pub fn update_sync_contacts(
        &self,
        sync_target: &str,
        policy: ConflictPolicy,
        pairs: &[(Option<ContactRecord>, Option<ContactRecord>)],
    ) -> DbResult<()> {
        sync_ops::update(self, sync_target, policy, pairs)
    }

    // ---- OOB store ----

    pub fn store_oob(&self, scope: &str, values: &BTreeMap<String, OobValue>) -> DbResult<()> {
        self.write_with(|ctx| oob_ops::store(ctx, scope, values))
    }

    pub fn remove_oob(&self, scope: &str, keys: &[&str]) -> DbResult<()> {
        self.write_with(|ctx| oob_ops::remove(ctx, scope, keys))
    }

    pub fn remove_oob_all(&self, scope: &str) -> DbResult<()> {
        self.write_with(|ctx| oob_ops::remove_scope(ctx, scope))
    }

    pub fn fetch_oob(&self, scope: &str, keys: &[&str]) -> DbResult<BTreeMap<String, OobValue>> {
        self.read_with(|conn| oob_ops::fetch(conn, scope, keys))
    }

    // ---- Identities ----

    pub fn self_contact_id(&self) -> DbResult<ContactId> {
        self.read_with(identity_ops::self_contact_id)
    }

    /// Identities are fixed by the engine; external mutation is refused.
    pub fn set_identity(&self, _identity: Identity, _contact_id: ContactId) -> DbResult<()> {
        NotSupportedSnafu.fail()
    }
}

#[cfg(test)]
mod tests;
