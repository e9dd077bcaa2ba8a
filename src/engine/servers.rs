use std::net::IpAddr;
use std::sync::atomic::Ordering;

use tracing::info;

use crate::limits::*;
use crate::model::*;

use super::queries::server_info;
use super::{Engine, EngineError};

impl Engine {
    pub async fn create_server(
        &self,
        caller: Caller,
        new: NewServer,
    ) -> Result<ServerInfo, EngineError> {
        require_elevated(caller, "only elevated callers may create servers")?;
        validate_server_name(&new.name)?;
        validate_connection(&new.connection)?;

        let _registry = self.registry.lock().await;
        if self.server_names.contains_key(&new.name) {
            return Err(EngineError::AlreadyExists(format!("server {:?}", new.name)));
        }
        if self.servers.len() >= MAX_SERVERS {
            return Err(EngineError::LimitExceeded("too many servers"));
        }

        let id = self.next_server_id.fetch_add(1, Ordering::Relaxed);
        self.commit(
            Event::ServerCreated {
                id,
                name: new.name.clone(),
                connection: new.connection,
            },
            &mut [],
        )
        .await?;
        info!(server_id = id, "server {:?} created", new.name);

        let shared = self
            .server(id)
            .ok_or_else(|| EngineError::server_not_found(id))?;
        let state = shared.read().await;
        Ok(server_info(caller, &state))
    }

    /// Rename, change connection attributes, or enter/leave maintenance.
    /// Leaving maintenance recomputes the status from active reservations.
    pub async fn update_server(
        &self,
        caller: Caller,
        id: ServerId,
        patch: ServerPatch,
    ) -> Result<ServerInfo, EngineError> {
        require_elevated(caller, "only elevated callers may modify servers")?;
        if patch.is_empty() {
            return Err(EngineError::InvalidInput("nothing to update".into()));
        }

        let _registry = self.registry.lock().await;
        let shared = self
            .server(id)
            .ok_or_else(|| EngineError::server_not_found(id))?;
        let mut state = shared.write().await;
        if state.deleted {
            return Err(EngineError::server_not_found(id));
        }

        let name = patch.name.unwrap_or_else(|| state.name.clone());
        if name != state.name {
            validate_server_name(&name)?;
            if self.server_names.contains_key(&name) {
                return Err(EngineError::AlreadyExists(format!("server {name:?}")));
            }
        }
        let mut connection = state.connection.clone();
        if let Some(address) = patch.address {
            connection.address = address;
        }
        if let Some(login) = patch.login {
            connection.login = login;
        }
        if let Some(secret) = patch.secret {
            connection.secret = secret;
        }
        validate_connection(&connection)?;
        let maintenance = patch
            .maintenance
            .unwrap_or(state.status == ServerStatus::Maintenance);

        self.commit(
            Event::ServerUpdated {
                id,
                name,
                connection,
                maintenance,
            },
            &mut [&mut *state],
        )
        .await?;
        info!(server_id = id, "server updated, status {}", state.status.as_str());
        Ok(server_info(caller, &state))
    }

    /// Refused while any active reservation references the server; terminal
    /// reservations go with it.
    pub async fn delete_server(&self, caller: Caller, id: ServerId) -> Result<(), EngineError> {
        require_elevated(caller, "only elevated callers may delete servers")?;

        let _registry = self.registry.lock().await;
        let shared = self
            .server(id)
            .ok_or_else(|| EngineError::server_not_found(id))?;
        let mut state = shared.write().await;
        if state.deleted {
            return Err(EngineError::server_not_found(id));
        }
        let active = state.active_count();
        if active > 0 {
            return Err(EngineError::InvalidState(format!(
                "server {id} has {active} active reservation(s)"
            )));
        }

        self.commit(Event::ServerDeleted { id }, &mut [&mut *state]).await?;
        info!(server_id = id, "server deleted");
        Ok(())
    }
}

pub(super) fn require_elevated(caller: Caller, msg: &'static str) -> Result<(), EngineError> {
    if caller.is_elevated() {
        Ok(())
    } else {
        Err(EngineError::Forbidden(msg))
    }
}

fn validate_server_name(name: &str) -> Result<(), EngineError> {
    if name.trim().is_empty() {
        return Err(EngineError::InvalidInput("server name must not be empty".into()));
    }
    if name.len() > MAX_SERVER_NAME_LEN {
        return Err(EngineError::InvalidInput("server name too long".into()));
    }
    Ok(())
}

fn validate_connection(connection: &Connection) -> Result<(), EngineError> {
    let fields = [&connection.address, &connection.login, &connection.secret];
    if fields
        .iter()
        .any(|f| f.as_ref().is_some_and(|v| v.len() > MAX_CONNECTION_FIELD_LEN))
    {
        return Err(EngineError::InvalidInput("connection attribute too long".into()));
    }
    if let Some(address) = &connection.address
        && address.parse::<IpAddr>().is_err()
    {
        return Err(EngineError::InvalidInput(format!(
            "address {address:?} is not an IP address"
        )));
    }
    Ok(())
}
