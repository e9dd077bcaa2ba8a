use crate::model::*;

use super::{Engine, EngineError};

impl Engine {
    /// Every reservation visible to `caller`, newest start first.
    pub async fn list_reservations(&self, caller: Caller) -> Vec<ReservationInfo> {
        let mut out = Vec::new();
        for shared in self.servers_by_id() {
            let state = shared.read().await;
            if state.deleted {
                continue;
            }
            for r in state.reservations.iter().filter(|r| caller.can_see(r.user_id)) {
                out.push(self.reservation_info(caller, &state, r));
            }
        }
        out.sort_by(|a, b| b.start.cmp(&a.start).then(b.id.cmp(&a.id)));
        out
    }

    pub async fn get_reservation(
        &self,
        caller: Caller,
        id: ReservationId,
    ) -> Result<ReservationInfo, EngineError> {
        let server_id = self
            .reservation_server(id)
            .ok_or_else(|| EngineError::reservation_not_found(id))?;
        let shared = self
            .server(server_id)
            .ok_or_else(|| EngineError::reservation_not_found(id))?;
        let state = shared.read().await;
        state
            .reservation(id)
            .filter(|r| !state.deleted && caller.can_see(r.user_id))
            .map(|r| self.reservation_info(caller, &state, r))
            .ok_or_else(|| EngineError::reservation_not_found(id))
    }

    pub async fn list_servers(&self, caller: Caller) -> Vec<ServerInfo> {
        let mut out = Vec::new();
        for shared in self.servers_by_id() {
            let state = shared.read().await;
            if !state.deleted {
                out.push(server_info(caller, &state));
            }
        }
        out
    }

    pub async fn get_server(
        &self,
        caller: Caller,
        id: ServerId,
    ) -> Result<ServerInfo, EngineError> {
        let shared = self
            .server(id)
            .ok_or_else(|| EngineError::server_not_found(id))?;
        let state = shared.read().await;
        if state.deleted {
            return Err(EngineError::server_not_found(id));
        }
        Ok(server_info(caller, &state))
    }

    /// Read model for one reservation row. Connection attributes are only
    /// attached for elevated callers.
    pub(super) fn reservation_info(
        &self,
        caller: Caller,
        state: &ServerState,
        r: &Reservation,
    ) -> ReservationInfo {
        ReservationInfo {
            id: r.id,
            server_id: state.id,
            server_name: state.name.clone(),
            user_id: r.user_id,
            username: self.accounts.get(&r.user_id).map(|a| a.username.clone()),
            start: r.span.start,
            end: r.span.end,
            status: r.status,
            connection: caller.is_elevated().then(|| state.connection.clone()),
        }
    }
}

/// Secrets are only returned to elevated callers.
pub(super) fn server_info(caller: Caller, state: &ServerState) -> ServerInfo {
    ServerInfo {
        id: state.id,
        name: state.name.clone(),
        status: state.status,
        address: state.connection.address.clone(),
        login: state.connection.login.clone(),
        secret: if caller.is_elevated() {
            state.connection.secret.clone()
        } else {
            None
        },
    }
}
