use std::sync::atomic::Ordering;

use tracing::info;

use crate::limits::*;
use crate::model::*;

use super::servers::require_elevated;
use super::{Engine, EngineError};

impl Engine {
    /// Register an account. With `password` unset the account logs in with
    /// the shared registration password until it sets its own.
    pub async fn register_account(
        &self,
        username: &str,
        role: Role,
        password: Option<&str>,
    ) -> Result<AccountInfo, EngineError> {
        validate_username(username)?;
        if let Some(password) = password {
            validate_password(password)?;
        }
        let _registry = self.registry.lock().await;
        self.register_locked(username, role, password).await
    }

    /// Elevated-only registration of a named account with its own password.
    pub async fn create_account(
        &self,
        caller: Caller,
        username: &str,
        password: Option<&str>,
        role: Role,
    ) -> Result<AccountInfo, EngineError> {
        require_elevated(caller, "only elevated callers may create users")?;
        self.register_account(username, role, password).await
    }

    async fn register_locked(
        &self,
        username: &str,
        role: Role,
        password: Option<&str>,
    ) -> Result<AccountInfo, EngineError> {
        if self.usernames.contains_key(username) {
            return Err(EngineError::AlreadyExists(format!("user {username:?}")));
        }
        if self.accounts.len() >= MAX_ACCOUNTS {
            return Err(EngineError::LimitExceeded("too many accounts"));
        }

        let id = self.next_account_id.fetch_add(1, Ordering::Relaxed);
        self.commit(
            Event::AccountRegistered {
                id,
                username: username.to_string(),
                role,
                password: password.map(str::to_string),
            },
            &mut [],
        )
        .await?;
        info!(user_id = id, "registered {} account {username:?}", role.as_str());
        Ok(AccountInfo {
            id,
            username: username.to_string(),
            role,
        })
    }

    /// The caller identity for a session user. Unknown usernames are
    /// registered as ordinary accounts when `register_unknown` is set.
    pub async fn resolve_caller(
        &self,
        username: &str,
        register_unknown: bool,
    ) -> Result<Caller, EngineError> {
        if let Some(caller) = self.lookup_caller(username) {
            return Ok(caller);
        }
        if !register_unknown {
            return Err(EngineError::NotFound(format!("user {username:?}")));
        }
        match self.register_account(username, Role::Ordinary, None).await {
            Ok(account) => Ok(Caller::new(account.id, account.role)),
            // Lost a race with another session registering the same name.
            Err(EngineError::AlreadyExists(_)) => self
                .lookup_caller(username)
                .ok_or_else(|| EngineError::NotFound(format!("user {username:?}"))),
            Err(e) => Err(e),
        }
    }

    /// Make sure the bootstrap account exists, is elevated and has a password
    /// of its own. `password`, when given, replaces the stored one.
    pub async fn ensure_root(
        &self,
        username: &str,
        password: Option<&str>,
    ) -> Result<Caller, EngineError> {
        validate_username(username)?;
        if let Some(password) = password {
            validate_password(password)?;
        }
        let _registry = self.registry.lock().await;

        let existing = self.account_by_name(username);
        if password.is_none() && existing.as_ref().is_none_or(|a| a.password.is_none()) {
            return Err(EngineError::InvalidInput(format!(
                "root account {username:?} needs a password"
            )));
        }
        let Some(account) = existing else {
            let account = self
                .register_locked(username, Role::Elevated, password)
                .await?;
            return Ok(Caller::new(account.id, account.role));
        };

        if account.role != Role::Elevated {
            self.commit(
                Event::AccountRoleChanged {
                    id: account.id,
                    role: Role::Elevated,
                },
                &mut [],
            )
            .await?;
            info!(user_id = account.id, "promoted {username:?} to root");
        }
        if let Some(new) = password
            && account.password.as_deref() != Some(new)
        {
            self.commit(
                Event::AccountPasswordChanged {
                    id: account.id,
                    password: new.to_string(),
                },
                &mut [],
            )
            .await?;
            info!(user_id = account.id, "root password updated");
        }
        Ok(Caller::new(account.id, Role::Elevated))
    }

    /// Stored login password for `username`; `Ok(None)` when the account
    /// has not set one yet.
    pub fn stored_password(&self, username: &str) -> Result<Option<String>, EngineError> {
        self.account_by_name(username)
            .map(|a| a.password)
            .ok_or_else(|| EngineError::NotFound(format!("user {username:?}")))
    }

    /// Accounts change their own password; elevated callers may change anyone's.
    pub async fn set_password(
        &self,
        caller: Caller,
        id: UserId,
        password: &str,
    ) -> Result<AccountInfo, EngineError> {
        if id != caller.id {
            require_elevated(caller, "only elevated callers may change other passwords")?;
        }
        validate_password(password)?;

        let _registry = self.registry.lock().await;
        let info = self
            .accounts
            .get(&id)
            .map(|a| AccountInfo::from(a.value()))
            .ok_or_else(|| EngineError::NotFound(format!("user {id}")))?;
        self.commit(
            Event::AccountPasswordChanged {
                id,
                password: password.to_string(),
            },
            &mut [],
        )
        .await?;
        info!(user_id = id, changed_by = caller.id, "password changed");
        Ok(info)
    }

    pub fn whoami(&self, caller: Caller) -> Result<AccountInfo, EngineError> {
        self.accounts
            .get(&caller.id)
            .map(|a| AccountInfo::from(a.value()))
            .ok_or_else(|| EngineError::NotFound(format!("user {}", caller.id)))
    }

    pub fn list_accounts(&self, caller: Caller) -> Result<Vec<AccountInfo>, EngineError> {
        require_elevated(caller, "only elevated callers may list users")?;
        let mut out: Vec<AccountInfo> = self
            .accounts
            .iter()
            .map(|e| AccountInfo::from(e.value()))
            .collect();
        out.sort_by_key(|a| a.id);
        Ok(out)
    }

    pub async fn set_role(
        &self,
        caller: Caller,
        id: UserId,
        role: Role,
    ) -> Result<AccountInfo, EngineError> {
        require_elevated(caller, "only elevated callers may change roles")?;
        if id == caller.id {
            return Err(EngineError::Forbidden("cannot change your own role"));
        }

        let _registry = self.registry.lock().await;
        let mut info = self
            .accounts
            .get(&id)
            .map(|a| AccountInfo::from(a.value()))
            .ok_or_else(|| EngineError::NotFound(format!("user {id}")))?;
        if info.role != role {
            self.commit(Event::AccountRoleChanged { id, role }, &mut [])
                .await?;
            info!(user_id = id, "role changed to {}", role.as_str());
            info.role = role;
        }
        Ok(info)
    }

    /// Refused while the account owns active reservations; its terminal
    /// reservations are removed with it.
    pub async fn delete_account(&self, caller: Caller, id: UserId) -> Result<(), EngineError> {
        require_elevated(caller, "only elevated callers may delete users")?;
        if id == caller.id {
            return Err(EngineError::Forbidden("cannot delete your own account"));
        }

        let _registry = self.registry.lock().await;
        if !self.accounts.contains_key(&id) {
            return Err(EngineError::NotFound(format!("user {id}")));
        }

        let mut guards = self.lock_all_servers().await;
        let active = guards
            .iter()
            .flat_map(|s| s.reservations.iter())
            .filter(|r| r.user_id == id && r.is_active())
            .count();
        if active > 0 {
            return Err(EngineError::InvalidState(format!(
                "user {id} has {active} active reservation(s)"
            )));
        }

        let mut locked: Vec<&mut ServerState> = guards.iter_mut().map(|g| &mut **g).collect();
        self.commit(Event::AccountDeleted { id }, &mut locked).await?;
        info!(user_id = id, "account deleted");
        Ok(())
    }

    pub(super) fn require_account(&self, id: UserId) -> Result<(), EngineError> {
        if self.accounts.contains_key(&id) {
            Ok(())
        } else {
            Err(EngineError::NotFound(format!("user {id}")))
        }
    }

    fn lookup_caller(&self, username: &str) -> Option<Caller> {
        self.account_by_name(username).map(|a| Caller::new(a.id, a.role))
    }

    fn account_by_name(&self, username: &str) -> Option<Account> {
        let id = *self.usernames.get(username)?.value();
        self.accounts.get(&id).map(|a| a.value().clone())
    }
}

fn validate_username(username: &str) -> Result<(), EngineError> {
    if username.trim().is_empty() {
        return Err(EngineError::InvalidInput("username must not be empty".into()));
    }
    if username.len() > MAX_USERNAME_LEN {
        return Err(EngineError::InvalidInput("username too long".into()));
    }
    Ok(())
}

fn validate_password(password: &str) -> Result<(), EngineError> {
    if password.is_empty() {
        return Err(EngineError::InvalidInput("password must not be empty".into()));
    }
    if password.len() > MAX_PASSWORD_LEN {
        return Err(EngineError::InvalidInput("password too long".into()));
    }
    Ok(())
}
