mod accounts;
mod conflict;
mod error;
mod queries;
mod reservations;
mod servers;
mod sweep;

pub use conflict::{find_conflict, has_conflict};
pub use error::EngineError;

use std::io;
use std::path::Path;
use std::sync::Arc;
use std::sync::atomic::{AtomicI64, Ordering};

use dashmap::DashMap;
use tokio::sync::{Mutex, OwnedRwLockWriteGuard, RwLock};

use crate::clock::Clock;
use crate::limits::{MAX_LOCK_ATTEMPTS, MAX_RESERVATIONS_PER_SERVER};
use crate::model::*;
use crate::wal::{Wal, WalHandle};

pub type SharedServerState = Arc<RwLock<ServerState>>;

pub struct Engine {
    servers: DashMap<ServerId, SharedServerState>,
    /// Reverse lookup: reservation id → server id.
    reservation_index: DashMap<ReservationId, ServerId>,
    server_names: DashMap<String, ServerId>,
    accounts: DashMap<UserId, Account>,
    usernames: DashMap<String, UserId>,
    next_server_id: AtomicI64,
    next_reservation_id: AtomicI64,
    next_account_id: AtomicI64,
    wal: WalHandle,
    clock: Arc<dyn Clock>,
    /// Most active reservations one server may hold.
    reservation_cap: usize,
    /// Held for name-uniqueness checks, server/account deletion and compaction.
    /// Always taken before any server row lock.
    registry: Mutex<()>,
}

/// Apply a reservation event to one server row (caller holds the lock).
/// Multi-server events are applied to each locked row in turn; each row only
/// keeps what belongs to it.
fn apply_to_server(
    state: &mut ServerState,
    event: &Event,
    index: &DashMap<ReservationId, ServerId>,
) {
    match event {
        Event::ReservationCreated { reservation } => {
            if reservation.server_id == state.id {
                state.insert_reservation(reservation.clone());
                index.insert(reservation.id, state.id);
            }
        }
        Event::ReservationUpdated { reservation, .. } => {
            state.remove_reservation(reservation.id);
            if reservation.server_id == state.id {
                state.insert_reservation(reservation.clone());
                index.insert(reservation.id, state.id);
            }
        }
        Event::ReservationCancelled { id, at, .. } => {
            if let Some(r) = state.reservation_mut(*id) {
                r.status = ReservationStatus::Cancelled;
                r.updated_at = *at;
            }
        }
        Event::ReservationExpired { id, at, .. } => {
            if let Some(r) = state.reservation_mut(*id) {
                r.status = ReservationStatus::Expired;
                r.updated_at = *at;
            }
        }
        Event::ReservationDeleted { id, .. } => {
            if state.remove_reservation(*id).is_some() {
                index.remove(id);
            }
        }
        Event::AccountDeleted { id } => {
            // Only terminal rows can remain for a deleted account.
            state.reservations.retain(|r| {
                let owned = r.user_id == *id;
                if owned {
                    index.remove(&r.id);
                }
                !owned
            });
        }
        Event::ServerUpdated {
            name,
            connection,
            maintenance,
            ..
        } => {
            state.name = name.clone();
            state.connection = connection.clone();
            state.set_maintenance(*maintenance);
            return;
        }
        Event::ServerDeleted { .. } => {
            for r in state.reservations.drain(..) {
                index.remove(&r.id);
            }
            state.deleted = true;
            return;
        }
        Event::ServerCreated { .. }
        | Event::AccountRegistered { .. }
        | Event::AccountPasswordChanged { .. }
        | Event::AccountRoleChanged { .. }
        | Event::Counters { .. } => return,
    }
    state.sync_status();
}

/// Servers whose row lock must be held while `event` is applied.
/// `None` means every server.
fn touched_servers(event: &Event) -> Option<Vec<ServerId>> {
    let ids = match event {
        Event::ServerUpdated { id, .. } | Event::ServerDeleted { id } => vec![*id],
        Event::ReservationCreated { reservation } => vec![reservation.server_id],
        Event::ReservationUpdated {
            from_server,
            reservation,
        } => {
            if *from_server == reservation.server_id {
                vec![*from_server]
            } else {
                vec![*from_server, reservation.server_id]
            }
        }
        Event::ReservationCancelled { server_id, .. }
        | Event::ReservationExpired { server_id, .. }
        | Event::ReservationDeleted { server_id, .. } => vec![*server_id],
        Event::AccountDeleted { .. } => return None,
        Event::ServerCreated { .. }
        | Event::AccountRegistered { .. }
        | Event::AccountPasswordChanged { .. }
        | Event::AccountRoleChanged { .. }
        | Event::Counters { .. } => Vec::new(),
    };
    Some(ids)
}

fn bump(counter: &AtomicI64, seen: i64) {
    counter.fetch_max(seen + 1, Ordering::Relaxed);
}

fn next_of(counter: &AtomicI64) -> i64 {
    counter.load(Ordering::Relaxed)
}

impl Engine {
    /// Replay the WAL at `wal_path` and start its writer task.
    /// Must be called inside a tokio runtime.
    pub fn new(wal_path: &Path, clock: Arc<dyn Clock>) -> io::Result<Self> {
        let replay = Wal::replay(wal_path)?;
        if replay.discarded_bytes > 0 {
            tracing::warn!(
                "discarded {} bytes of torn or corrupt WAL tail in {}",
                replay.discarded_bytes,
                wal_path.display()
            );
        }
        let wal = WalHandle::spawn(Wal::open(wal_path)?);

        let engine = Self {
            servers: DashMap::new(),
            reservation_index: DashMap::new(),
            server_names: DashMap::new(),
            accounts: DashMap::new(),
            usernames: DashMap::new(),
            next_server_id: AtomicI64::new(1),
            next_reservation_id: AtomicI64::new(1),
            next_account_id: AtomicI64::new(1),
            wal,
            clock,
            reservation_cap: MAX_RESERVATIONS_PER_SERVER,
            registry: Mutex::new(()),
        };

        for event in &replay.events {
            engine.replay_event(event);
        }
        tracing::info!(
            "replayed {} events: {} servers, {} reservations, {} accounts",
            replay.events.len(),
            engine.servers.len(),
            engine.reservation_index.len(),
            engine.accounts.len()
        );

        Ok(engine)
    }

    // Replay has sole ownership of every Arc, so try_write always succeeds.
    // Never use blocking_write here: this runs inside an async context.
    fn replay_event(&self, event: &Event) {
        let arcs: Vec<SharedServerState> = match touched_servers(event) {
            Some(ids) => ids.iter().filter_map(|id| self.server(*id)).collect(),
            None => self.servers_by_id(),
        };
        let mut guards: Vec<_> = arcs
            .iter()
            .map(|s| s.try_write().expect("replay: uncontended write"))
            .collect();
        let mut locked: Vec<&mut ServerState> = guards.iter_mut().map(|g| &mut **g).collect();
        self.apply(event, &mut locked);
    }

    /// Apply a committed event to memory. `locked` holds the row guard of
    /// every server the event touches.
    fn apply(&self, event: &Event, locked: &mut [&mut ServerState]) {
        match event {
            Event::ServerCreated {
                id,
                name,
                connection,
            } => {
                let state = ServerState::new(*id, name.clone(), connection.clone());
                self.servers.insert(*id, Arc::new(RwLock::new(state)));
                self.server_names.insert(name.clone(), *id);
                bump(&self.next_server_id, *id);
            }
            Event::ServerUpdated { id, name, .. } => {
                if let Some(state) = locked.iter().find(|s| s.id == *id)
                    && state.name != *name
                {
                    self.server_names.remove(&state.name);
                    self.server_names.insert(name.clone(), *id);
                }
            }
            Event::ServerDeleted { id } => {
                if let Some(state) = locked.iter().find(|s| s.id == *id) {
                    self.server_names.remove(&state.name);
                }
                self.servers.remove(id);
            }
            Event::AccountRegistered {
                id,
                username,
                role,
                password,
            } => {
                self.accounts.insert(
                    *id,
                    Account {
                        id: *id,
                        username: username.clone(),
                        role: *role,
                        password: password.clone(),
                    },
                );
                self.usernames.insert(username.clone(), *id);
                bump(&self.next_account_id, *id);
            }
            Event::AccountPasswordChanged { id, password } => {
                if let Some(mut account) = self.accounts.get_mut(id) {
                    account.password = Some(password.clone());
                }
            }
            Event::Counters {
                next_server_id,
                next_reservation_id,
                next_account_id,
            } => {
                self.next_server_id.fetch_max(*next_server_id, Ordering::Relaxed);
                self.next_reservation_id
                    .fetch_max(*next_reservation_id, Ordering::Relaxed);
                self.next_account_id.fetch_max(*next_account_id, Ordering::Relaxed);
            }
            Event::AccountRoleChanged { id, role } => {
                if let Some(mut account) = self.accounts.get_mut(id) {
                    account.role = *role;
                }
            }
            Event::AccountDeleted { id } => {
                if let Some((_, account)) = self.accounts.remove(id) {
                    self.usernames.remove(&account.username);
                }
            }
            Event::ReservationCreated { reservation } => {
                bump(&self.next_reservation_id, reservation.id);
            }
            Event::ReservationUpdated { .. }
            | Event::ReservationCancelled { .. }
            | Event::ReservationExpired { .. }
            | Event::ReservationDeleted { .. } => {}
        }

        for state in locked.iter_mut() {
            apply_to_server(state, event, &self.reservation_index);
        }
    }

    /// Durable append, then apply. Nothing is mutated if the append fails.
    pub(super) async fn commit(
        &self,
        event: Event,
        locked: &mut [&mut ServerState],
    ) -> Result<(), EngineError> {
        self.wal.append(event.clone()).await?;
        self.apply(&event, locked);
        Ok(())
    }

    #[cfg(test)]
    pub(crate) fn with_reservation_cap(mut self, cap: usize) -> Self {
        self.reservation_cap = cap;
        self
    }

    pub fn now_ms(&self) -> Ms {
        self.clock.now_ms()
    }

    fn server(&self, id: ServerId) -> Option<SharedServerState> {
        self.servers.get(&id).map(|e| e.value().clone())
    }

    /// Every server handle, ascending by id (the lock order).
    fn servers_by_id(&self) -> Vec<SharedServerState> {
        let mut ids: Vec<(ServerId, SharedServerState)> = self
            .servers
            .iter()
            .map(|e| (*e.key(), e.value().clone()))
            .collect();
        ids.sort_by_key(|(id, _)| *id);
        ids.into_iter().map(|(_, s)| s).collect()
    }

    /// Write-lock every server in ascending id order.
    async fn lock_all_servers(&self) -> Vec<OwnedRwLockWriteGuard<ServerState>> {
        let mut guards = Vec::new();
        for shared in self.servers_by_id() {
            let guard = shared.write_owned().await;
            if !guard.deleted {
                guards.push(guard);
            }
        }
        guards
    }

    pub(super) fn reservation_server(&self, id: ReservationId) -> Option<ServerId> {
        self.reservation_index.get(&id).map(|e| *e.value())
    }

    /// Resolve a reservation to its server and take that row lock. The index is
    /// re-checked after locking since a concurrent update may have moved it.
    pub(super) async fn lock_reservation(
        &self,
        id: ReservationId,
    ) -> Result<OwnedRwLockWriteGuard<ServerState>, EngineError> {
        for _ in 0..MAX_LOCK_ATTEMPTS {
            let server_id = self
                .reservation_server(id)
                .ok_or_else(|| EngineError::reservation_not_found(id))?;
            let Some(shared) = self.server(server_id) else {
                continue;
            };
            let guard = shared.write_owned().await;
            if holds(&guard, id) {
                return Ok(guard);
            }
        }
        Err(EngineError::reservation_not_found(id))
    }

    /// Lock the server holding reservation `id` and, when different, server
    /// `to`, in ascending id order. The second guard is `None` when `to` is the
    /// same server or does not exist.
    pub(super) async fn lock_move(
        &self,
        id: ReservationId,
        to: ServerId,
    ) -> Result<
        (
            OwnedRwLockWriteGuard<ServerState>,
            Option<OwnedRwLockWriteGuard<ServerState>>,
        ),
        EngineError,
    > {
        for _ in 0..MAX_LOCK_ATTEMPTS {
            let from_id = self
                .reservation_server(id)
                .ok_or_else(|| EngineError::reservation_not_found(id))?;
            let Some(from) = self.server(from_id) else {
                continue;
            };
            let target = if from_id == to { None } else { self.server(to) };
            let Some(target) = target else {
                let guard = from.write_owned().await;
                if holds(&guard, id) {
                    return Ok((guard, None));
                }
                continue;
            };

            let (from_guard, to_guard) = if from_id < to {
                let f = from.write_owned().await;
                let t = target.write_owned().await;
                (f, t)
            } else {
                let t = target.write_owned().await;
                let f = from.write_owned().await;
                (f, t)
            };
            if holds(&from_guard, id) {
                return Ok((from_guard, Some(to_guard)));
            }
        }
        Err(EngineError::reservation_not_found(id))
    }

    /// Rewrite the WAL as a minimal snapshot of the current state.
    ///
    /// Holds the registry lock and every server's read lock, so no commit can
    /// interleave with the snapshot.
    pub async fn compact_wal(&self) -> Result<(), EngineError> {
        let _registry = self.registry.lock().await;

        let servers = self.servers_by_id();
        let mut guards = Vec::with_capacity(servers.len());
        for shared in &servers {
            guards.push(shared.read().await);
        }

        // Every id allocation happens under the registry or a row lock, so
        // the counters are stable from here on.
        let mut events = vec![Event::Counters {
            next_server_id: next_of(&self.next_server_id),
            next_reservation_id: next_of(&self.next_reservation_id),
            next_account_id: next_of(&self.next_account_id),
        }];

        let mut accounts: Vec<Account> = self.accounts.iter().map(|e| e.value().clone()).collect();
        accounts.sort_by_key(|a| a.id);
        for a in accounts {
            events.push(Event::AccountRegistered {
                id: a.id,
                username: a.username,
                role: a.role,
                password: a.password,
            });
        }

        for state in guards.iter().filter(|s| !s.deleted) {
            events.push(Event::ServerCreated {
                id: state.id,
                name: state.name.clone(),
                connection: state.connection.clone(),
            });
            if state.status == ServerStatus::Maintenance {
                events.push(Event::ServerUpdated {
                    id: state.id,
                    name: state.name.clone(),
                    connection: state.connection.clone(),
                    maintenance: true,
                });
            }
            for r in &state.reservations {
                events.push(Event::ReservationCreated {
                    reservation: r.clone(),
                });
            }
        }

        let count = events.len();
        self.wal.compact(events).await?;
        tracing::info!("WAL compacted to {count} events");
        Ok(())
    }

    pub async fn wal_appends_since_compact(&self) -> u64 {
        self.wal.appends_since_compact().await
    }
}

fn holds(state: &ServerState, id: ReservationId) -> bool {
    !state.deleted && state.reservation(id).is_some()
}
