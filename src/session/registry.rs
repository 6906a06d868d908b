//! Process-scoped coordinator registry.
//!
//! Holds one [`CallSessionCoordinator`] per signed-in account, so session
//! lifecycle is an explicit create/remove rather than ambient global
//! state.

use crate::session::coordinator::CallSessionCoordinator;
use crate::types::call::AccountId;
use dashmap::DashMap;
use std::sync::Arc;

#[derive(Default)]
pub struct CoordinatorRegistry {
    coordinators: DashMap<AccountId, Arc<CallSessionCoordinator>>,
}

impl CoordinatorRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a coordinator, replacing any previous one for the account.
    pub fn insert(&self, coordinator: Arc<CallSessionCoordinator>) {
        self.coordinators
            .insert(coordinator.account_id().clone(), coordinator);
    }

    pub fn get(&self, account: &AccountId) -> Option<Arc<CallSessionCoordinator>> {
        self.coordinators.get(account).map(|c| Arc::clone(&c))
    }

    /// Remove and return the coordinator for an account. The caller is
    /// responsible for shutting it down.
    pub fn remove(&self, account: &AccountId) -> Option<Arc<CallSessionCoordinator>> {
        self.coordinators.remove(account).map(|(_, c)| c)
    }

    pub fn len(&self) -> usize {
        self.coordinators.len()
    }

    pub fn is_empty(&self) -> bool {
        self.coordinators.is_empty()
    }
}
