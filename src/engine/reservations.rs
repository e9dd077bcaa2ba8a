use tracing::info;

use crate::model::*;
use crate::observability::{
    CONFLICTS_TOTAL, RESERVATIONS_CANCELLED_TOTAL, RESERVATIONS_CREATED_TOTAL,
};

use super::conflict::{find_conflict, validate_span};
use super::{Engine, EngineError};

impl Engine {
    /// Book `[start, end)` on `server_id` for the caller. The overlap check
    /// and the status change to `reserved` happen under the server's row lock.
    pub async fn create_reservation(
        &self,
        caller: Caller,
        server_id: ServerId,
        start: Ms,
        end: Ms,
    ) -> Result<ReservationInfo, EngineError> {
        let now = self.now_ms();
        let span = validate_span(start, end, now)?;
        self.require_account(caller.id)?;

        let shared = self
            .server(server_id)
            .ok_or_else(|| EngineError::server_not_found(server_id))?;
        let mut state = shared.write().await;
        if state.deleted {
            return Err(EngineError::server_not_found(server_id));
        }
        if state.status == ServerStatus::Maintenance {
            return Err(EngineError::Unavailable(server_id));
        }
        if state.active_count() >= self.reservation_cap {
            return Err(EngineError::LimitExceeded("too many active reservations on server"));
        }
        if let Some(existing) = find_conflict(&state, &span, None) {
            metrics::counter!(CONFLICTS_TOTAL).increment(1);
            return Err(EngineError::Conflict(existing));
        }
        // Account deletion write-locks every server, so this re-check is stable.
        self.require_account(caller.id)?;

        let reservation = Reservation {
            id: self.allocate_reservation_id(),
            server_id,
            user_id: caller.id,
            span,
            status: ReservationStatus::Active,
            created_at: now,
            updated_at: now,
        };
        self.commit(
            Event::ReservationCreated {
                reservation: reservation.clone(),
            },
            &mut [&mut *state],
        )
        .await?;

        metrics::counter!(RESERVATIONS_CREATED_TOTAL).increment(1);
        info!(
            reservation_id = reservation.id,
            server_id,
            user_id = caller.id,
            "reservation created [{}, {})",
            span.start,
            span.end
        );
        Ok(self.reservation_info(caller, &state, &reservation))
    }

    /// Edit server and/or interval of an active reservation. Moving to another
    /// server holds both row locks so the old server is released and the new
    /// one reserved in the same transaction.
    pub async fn update_reservation(
        &self,
        caller: Caller,
        id: ReservationId,
        server_id: ServerId,
        start: Ms,
        end: Ms,
    ) -> Result<ReservationInfo, EngineError> {
        let patch = ReservationPatch {
            server_id: Some(server_id),
            start: Some(start),
            end: Some(end),
        };
        self.patch_reservation(caller, id, patch).await
    }

    /// Like [`Engine::update_reservation`], with fields left out of `patch`
    /// taken from the row as it stands once locked.
    pub async fn patch_reservation(
        &self,
        caller: Caller,
        id: ReservationId,
        patch: ReservationPatch,
    ) -> Result<ReservationInfo, EngineError> {
        let now = self.now_ms();
        let (mut from, mut to) = match patch.server_id {
            Some(target) => self.lock_move(id, target).await?,
            None => (self.lock_reservation(id).await?, None),
        };

        let current = from
            .reservation(id)
            .cloned()
            .ok_or_else(|| EngineError::reservation_not_found(id))?;
        check_mutable(caller, &current)?;
        let server_id = patch.server_id.unwrap_or(current.server_id);
        let start = patch.start.unwrap_or(current.span.start);
        let end = patch.end.unwrap_or(current.span.end);
        let span = validate_span(start, end, now)?;

        let from_server = from.id;
        let updated = Reservation {
            server_id,
            span,
            updated_at: now,
            ..current
        };
        let event = Event::ReservationUpdated {
            from_server,
            reservation: updated.clone(),
        };

        if server_id == from_server {
            if let Some(existing) = find_conflict(&from, &span, Some(id)) {
                metrics::counter!(CONFLICTS_TOTAL).increment(1);
                return Err(EngineError::Conflict(existing));
            }
            self.commit(event, &mut [&mut *from]).await?;
            info!(reservation_id = id, server_id, "reservation updated [{start}, {end})");
            return Ok(self.reservation_info(caller, &from, &updated));
        }

        let Some(target) = to.as_mut().filter(|t| !t.deleted) else {
            return Err(EngineError::server_not_found(server_id));
        };
        if target.status == ServerStatus::Maintenance {
            return Err(EngineError::Unavailable(server_id));
        }
        if target.active_count() >= self.reservation_cap {
            return Err(EngineError::LimitExceeded("too many active reservations on server"));
        }
        if let Some(existing) = find_conflict(target, &span, Some(id)) {
            metrics::counter!(CONFLICTS_TOTAL).increment(1);
            return Err(EngineError::Conflict(existing));
        }

        self.commit(event, &mut [&mut *from, &mut **target]).await?;
        info!(
            reservation_id = id,
            from_server,
            server_id,
            "reservation moved [{start}, {end})"
        );
        Ok(self.reservation_info(caller, target, &updated))
    }

    /// `active → cancelled`. The server is released when no other active
    /// reservation remains on it.
    pub async fn cancel_reservation(
        &self,
        caller: Caller,
        id: ReservationId,
    ) -> Result<ReservationInfo, EngineError> {
        let mut state = self.lock_reservation(id).await?;
        let current = state
            .reservation(id)
            .cloned()
            .ok_or_else(|| EngineError::reservation_not_found(id))?;
        check_mutable(caller, &current)?;

        let at = self.now_ms();
        let server_id = state.id;
        self.commit(
            Event::ReservationCancelled { id, server_id, at },
            &mut [&mut *state],
        )
        .await?;

        metrics::counter!(RESERVATIONS_CANCELLED_TOTAL).increment(1);
        info!(
            reservation_id = id,
            server_id,
            user_id = caller.id,
            "reservation cancelled, server now {}",
            state.status.as_str()
        );
        let cancelled = state
            .reservation(id)
            .cloned()
            .ok_or_else(|| EngineError::reservation_not_found(id))?;
        Ok(self.reservation_info(caller, &state, &cancelled))
    }

    /// Hard delete from any status. Elevated only.
    pub async fn delete_reservation(
        &self,
        caller: Caller,
        id: ReservationId,
    ) -> Result<(), EngineError> {
        if !caller.is_elevated() {
            return Err(EngineError::Forbidden("only elevated callers may delete reservations"));
        }
        let mut state = self.lock_reservation(id).await?;
        let server_id = state.id;
        self.commit(
            Event::ReservationDeleted { id, server_id },
            &mut [&mut *state],
        )
        .await?;
        info!(reservation_id = id, server_id, "reservation deleted");
        Ok(())
    }

    fn allocate_reservation_id(&self) -> ReservationId {
        self.next_reservation_id
            .fetch_add(1, std::sync::atomic::Ordering::Relaxed)
    }
}

/// Scope, then status. An ordinary caller cannot tell someone else's
/// reservation from a missing one.
fn check_mutable(caller: Caller, reservation: &Reservation) -> Result<(), EngineError> {
    if !caller.can_see(reservation.user_id) {
        return Err(EngineError::reservation_not_found(reservation.id));
    }
    if !reservation.is_active() {
        return Err(EngineError::InvalidState(format!(
            "reservation {} is {}",
            reservation.id,
            reservation.status.as_str()
        )));
    }
    Ok(())
}
