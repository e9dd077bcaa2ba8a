use serde::{Deserialize, Serialize};

/// Unix milliseconds, UTC. The only time type.
pub type Ms = i64;

pub type ServerId = i64;
pub type ReservationId = i64;
pub type UserId = i64;

/// Half-open interval `[start, end)`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct Span {
    pub start: Ms,
    pub end: Ms,
}

impl Span {
    pub fn new(start: Ms, end: Ms) -> Self {
        debug_assert!(start < end, "Span start must be before end");
        Self { start, end }
    }

    pub fn duration_ms(&self) -> Ms {
        self.end - self.start
    }

    /// Touching boundaries (`self.end == other.start`) do not overlap.
    pub fn overlaps(&self, other: &Span) -> bool {
        self.start < other.end && other.start < self.end
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum ServerStatus {
    Available,
    Reserved,
    /// Administrative lock. Never set or cleared by the reservation lifecycle.
    Maintenance,
}

impl ServerStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            ServerStatus::Available => "available",
            ServerStatus::Reserved => "reserved",
            ServerStatus::Maintenance => "maintenance",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum ReservationStatus {
    Active,
    Cancelled,
    Expired,
}

impl ReservationStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            ReservationStatus::Active => "active",
            ReservationStatus::Cancelled => "cancelled",
            ReservationStatus::Expired => "expired",
        }
    }
}

/// Caller classification, decided once when a session is authenticated.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Role {
    Ordinary,
    Elevated,
}

impl Role {
    pub fn as_str(&self) -> &'static str {
        match self {
            Role::Ordinary => "user",
            Role::Elevated => "root",
        }
    }

    pub fn parse(s: &str) -> Option<Role> {
        match s.to_ascii_lowercase().as_str() {
            "user" | "ordinary" => Some(Role::Ordinary),
            "root" | "admin" | "elevated" => Some(Role::Elevated),
            _ => None,
        }
    }
}

/// Identity the engine acts on behalf of.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Caller {
    pub id: UserId,
    pub role: Role,
}

impl Caller {
    pub fn new(id: UserId, role: Role) -> Self {
        Self { id, role }
    }

    pub fn is_elevated(&self) -> bool {
        self.role == Role::Elevated
    }

    /// Elevated callers see everything; ordinary callers only their own records.
    pub fn can_see(&self, owner: UserId) -> bool {
        self.is_elevated() || self.id == owner
    }
}

/// Connection attributes of a server. Opaque to the reservation engine.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Connection {
    pub address: Option<String>,
    pub login: Option<String>,
    pub secret: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Reservation {
    pub id: ReservationId,
    pub server_id: ServerId,
    pub user_id: UserId,
    pub span: Span,
    pub status: ReservationStatus,
    pub created_at: Ms,
    pub updated_at: Ms,
}

impl Reservation {
    pub fn is_active(&self) -> bool {
        self.status == ReservationStatus::Active
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Account {
    pub id: UserId,
    pub username: String,
    pub role: Role,
    /// Login password. `None` until set; such accounts log in with the
    /// shared registration password.
    pub password: Option<String>,
}

/// One server row plus every reservation that references it.
///
/// The write lock around a `ServerState` is the row lock: every transition
/// that touches this server's reservations or status happens while holding it.
#[derive(Debug, Clone)]
pub struct ServerState {
    pub id: ServerId,
    pub name: String,
    pub connection: Connection,
    pub status: ServerStatus,
    /// All reservations (any status), sorted by `span.start`.
    pub reservations: Vec<Reservation>,
    /// Set when the row is deleted so waiters that already hold the Arc back off.
    pub deleted: bool,
}

impl ServerState {
    pub fn new(id: ServerId, name: String, connection: Connection) -> Self {
        Self {
            id,
            name,
            connection,
            status: ServerStatus::Available,
            reservations: Vec::new(),
            deleted: false,
        }
    }

    /// Insert reservation maintaining sort order by span.start.
    pub fn insert_reservation(&mut self, reservation: Reservation) {
        let pos = self
            .reservations
            .partition_point(|r| r.span.start <= reservation.span.start);
        self.reservations.insert(pos, reservation);
    }

    pub fn remove_reservation(&mut self, id: ReservationId) -> Option<Reservation> {
        let pos = self.reservations.iter().position(|r| r.id == id)?;
        Some(self.reservations.remove(pos))
    }

    pub fn reservation(&self, id: ReservationId) -> Option<&Reservation> {
        self.reservations.iter().find(|r| r.id == id)
    }

    pub fn reservation_mut(&mut self, id: ReservationId) -> Option<&mut Reservation> {
        self.reservations.iter_mut().find(|r| r.id == id)
    }

    /// Active reservations whose span overlaps the query window.
    /// Everything at or after the first start >= `query.end` is skipped.
    pub fn overlapping_active(&self, query: &Span) -> impl Iterator<Item = &Reservation> {
        let right_bound = self
            .reservations
            .partition_point(|r| r.span.start < query.end);
        let start = query.start;
        self.reservations[..right_bound]
            .iter()
            .filter(move |r| r.is_active() && r.span.end > start)
    }

    pub fn active_count(&self) -> usize {
        self.reservations.iter().filter(|r| r.is_active()).count()
    }

    /// Recompute the cached status from the active reservations.
    /// Maintenance is left untouched.
    pub fn sync_status(&mut self) {
        if self.status == ServerStatus::Maintenance {
            return;
        }
        self.status = if self.active_count() > 0 {
            ServerStatus::Reserved
        } else {
            ServerStatus::Available
        };
    }

    pub fn set_maintenance(&mut self, on: bool) {
        if on {
            self.status = ServerStatus::Maintenance;
        } else if self.status == ServerStatus::Maintenance {
            self.status = ServerStatus::Available;
            self.sync_status();
        }
    }
}

/// The event types, flat. This is the WAL record format; one event per
/// committed transaction.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum Event {
    ServerCreated {
        id: ServerId,
        name: String,
        connection: Connection,
    },
    ServerUpdated {
        id: ServerId,
        name: String,
        connection: Connection,
        maintenance: bool,
    },
    ServerDeleted {
        id: ServerId,
    },
    AccountRegistered {
        id: UserId,
        username: String,
        role: Role,
        password: Option<String>,
    },
    AccountPasswordChanged {
        id: UserId,
        password: String,
    },
    AccountRoleChanged {
        id: UserId,
        role: Role,
    },
    AccountDeleted {
        id: UserId,
    },
    /// Also used by compaction to restore terminal reservations verbatim.
    ReservationCreated {
        reservation: Reservation,
    },
    /// Carries the full edited row; `from_server` is where it lived before.
    ReservationUpdated {
        from_server: ServerId,
        reservation: Reservation,
    },
    ReservationCancelled {
        id: ReservationId,
        server_id: ServerId,
        at: Ms,
    },
    ReservationExpired {
        id: ReservationId,
        server_id: ServerId,
        at: Ms,
    },
    ReservationDeleted {
        id: ReservationId,
        server_id: ServerId,
    },
    /// Id high-water marks. Written first by compaction so ids of removed
    /// rows are never handed out again.
    Counters {
        next_server_id: ServerId,
        next_reservation_id: ReservationId,
        next_account_id: UserId,
    },
}

// ── Inputs ───────────────────────────────────────────────────────

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct NewServer {
    pub name: String,
    pub connection: Connection,
}

/// Partial server update. `None` leaves a field unchanged; for connection
/// attributes `Some(None)` clears the value.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ServerPatch {
    pub name: Option<String>,
    pub address: Option<Option<String>>,
    pub login: Option<Option<String>>,
    pub secret: Option<Option<String>>,
    pub maintenance: Option<bool>,
}

/// Partial reservation edit. `None` keeps the current value, read under
/// the row lock.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ReservationPatch {
    pub server_id: Option<ServerId>,
    pub start: Option<Ms>,
    pub end: Option<Ms>,
}

impl ServerPatch {
    pub fn is_empty(&self) -> bool {
        *self == ServerPatch::default()
    }
}

// ── Query result types ───────────────────────────────────────────

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ServerInfo {
    pub id: ServerId,
    pub name: String,
    pub status: ServerStatus,
    pub address: Option<String>,
    pub login: Option<String>,
    /// Only populated for elevated callers.
    pub secret: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ReservationInfo {
    pub id: ReservationId,
    pub server_id: ServerId,
    pub server_name: String,
    pub user_id: UserId,
    pub username: Option<String>,
    pub start: Ms,
    pub end: Ms,
    pub status: ReservationStatus,
    /// Connection attributes, only for elevated callers.
    pub connection: Option<Connection>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AccountInfo {
    pub id: UserId,
    pub username: String,
    pub role: Role,
}

impl From<&Account> for AccountInfo {
    fn from(a: &Account) -> Self {
        Self {
            id: a.id,
            username: a.username.clone(),
            role: a.role,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn reservation(
        id: ReservationId,
        start: Ms,
        end: Ms,
        status: ReservationStatus,
    ) -> Reservation {
        Reservation {
            id,
            server_id: 1,
            user_id: 1,
            span: Span::new(start, end),
            status,
            created_at: 0,
            updated_at: 0,
        }
    }

    fn server_with(reservations: Vec<Reservation>) -> ServerState {
        let mut s = ServerState::new(1, "s1".into(), Connection::default());
        for r in reservations {
            s.insert_reservation(r);
        }
        s
    }

    #[test]
    fn span_overlap() {
        let a = Span::new(100, 200);
        let b = Span::new(150, 250);
        let c = Span::new(200, 300);
        assert!(a.overlaps(&b));
        assert!(b.overlaps(&a));
        assert!(!a.overlaps(&c)); // adjacent, not overlapping
        assert!(!c.overlaps(&a));
        assert_eq!(a.duration_ms(), 100);
    }

    #[test]
    fn span_containment_overlaps() {
        let outer = Span::new(100, 400);
        let inner = Span::new(150, 300);
        assert!(outer.overlaps(&inner));
        assert!(inner.overlaps(&outer));
    }

    #[test]
    fn reservations_kept_sorted() {
        let s = server_with(vec![
            reservation(1, 300, 400, ReservationStatus::Active),
            reservation(2, 100, 200, ReservationStatus::Cancelled),
            reservation(3, 200, 300, ReservationStatus::Active),
        ]);
        let starts: Vec<Ms> = s.reservations.iter().map(|r| r.span.start).collect();
        assert_eq!(starts, vec![100, 200, 300]);
    }

    #[test]
    fn overlapping_active_ignores_terminal() {
        let s = server_with(vec![
            reservation(1, 100, 200, ReservationStatus::Cancelled),
            reservation(2, 150, 250, ReservationStatus::Expired),
            reservation(3, 180, 260, ReservationStatus::Active),
        ]);
        let hits: Vec<_> = s.overlapping_active(&Span::new(120, 190)).map(|r| r.id).collect();
        assert_eq!(hits, vec![3]);
    }

    #[test]
    fn overlapping_active_adjacent_not_included() {
        let s = server_with(vec![reservation(1, 100, 200, ReservationStatus::Active)]);
        assert_eq!(s.overlapping_active(&Span::new(200, 300)).count(), 0);
        assert_eq!(s.overlapping_active(&Span::new(0, 100)).count(), 0);
        assert_eq!(s.overlapping_active(&Span::new(199, 300)).count(), 1);
    }

    #[test]
    fn overlapping_active_long_reservation_spanning_query() {
        let s = server_with(vec![reservation(1, 0, 10_000, ReservationStatus::Active)]);
        assert_eq!(s.overlapping_active(&Span::new(500, 600)).count(), 1);
    }

    #[test]
    fn sync_status_tracks_active_reservations() {
        let mut s = server_with(vec![reservation(1, 100, 200, ReservationStatus::Active)]);
        s.sync_status();
        assert_eq!(s.status, ServerStatus::Reserved);

        s.reservation_mut(1).unwrap().status = ReservationStatus::Cancelled;
        s.sync_status();
        assert_eq!(s.status, ServerStatus::Available);
    }

    #[test]
    fn sync_status_never_clears_maintenance() {
        let mut s = server_with(vec![]);
        s.set_maintenance(true);
        s.sync_status();
        assert_eq!(s.status, ServerStatus::Maintenance);

        s.insert_reservation(reservation(1, 100, 200, ReservationStatus::Active));
        s.sync_status();
        assert_eq!(s.status, ServerStatus::Maintenance);

        s.set_maintenance(false);
        assert_eq!(s.status, ServerStatus::Reserved);
    }

    #[test]
    fn remove_nonexistent_returns_none() {
        let mut s = server_with(vec![reservation(1, 100, 200, ReservationStatus::Active)]);
        assert!(s.remove_reservation(42).is_none());
        assert_eq!(s.reservations.len(), 1);
    }

    #[test]
    fn role_parse_aliases() {
        assert_eq!(Role::parse("root"), Some(Role::Elevated));
        assert_eq!(Role::parse("ADMIN"), Some(Role::Elevated));
        assert_eq!(Role::parse("user"), Some(Role::Ordinary));
        assert_eq!(Role::parse("superuser"), None);
    }

    #[test]
    fn caller_visibility() {
        let alice = Caller::new(7, Role::Ordinary);
        let root = Caller::new(1, Role::Elevated);
        assert!(alice.can_see(7));
        assert!(!alice.can_see(8));
        assert!(root.can_see(8));
    }

    #[test]
    fn event_serialization_roundtrip() {
        let event = Event::ReservationCreated {
            reservation: reservation(9, 1000, 2000, ReservationStatus::Active),
        };
        let bytes = bincode::serialize(&event).unwrap();
        let decoded: Event = bincode::deserialize(&bytes).unwrap();
        assert_eq!(event, decoded);
    }
}
