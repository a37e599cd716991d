//! Advisory edit locks.
//!
//! The server is the sole arbiter: a lock is only recorded locally after a
//! `success: true` reply, and a denial comes back as a value carrying the
//! holder. Nothing here queues, retries or steals a lock.

use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use crate::error::RealtimeError;
use crate::protocol::{channels, LockGrant, LockRequest, LockResult, ReleaseResult, ResourceRef, UserRef};
use crate::router::Router;

pub struct EditLockManager {
    router: Arc<Router>,
    user: UserRef,
    held: Mutex<HashMap<ResourceRef, LockGrant>>,
}

impl EditLockManager {
    pub fn new(router: Arc<Router>, user: UserRef) -> Self {
        Self {
            router,
            user,
            held: Mutex::new(HashMap::new()),
        }
    }

    fn held(&self) -> MutexGuard<'_, HashMap<ResourceRef, LockGrant>> {
        self.held.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Ask the server for an edit lock on a resource, or on one section of it.
    pub async fn acquire_edit_lock(
        &self,
        resource_type: &str,
        resource_id: &str,
        section_id: Option<&str>,
    ) -> Result<LockResult, RealtimeError> {
        let mut resource = ResourceRef::new(resource_type, resource_id);
        if let Some(section) = section_id {
            resource = resource.with_section(section);
        }
        self.acquire(resource).await
    }

    pub async fn acquire(&self, resource: ResourceRef) -> Result<LockResult, RealtimeError> {
        let request = LockRequest {
            resource: resource.clone(),
            user: self.user.clone(),
        };
        let result: LockResult = self.router.request(channels::LOCK_ACQUIRE, &request).await?;

        if result.success {
            match &result.lock_id {
                Some(lock_id) => {
                    log::debug!("Acquired edit lock {lock_id} on {resource}");
                    self.held().insert(
                        resource,
                        LockGrant {
                            lock_id: lock_id.clone(),
                            expires_at: result.expires_at,
                        },
                    );
                }
                None => log::warn!("Lock on {resource} granted without an id; not tracking it"),
            }
        } else {
            log::info!(
                "Edit lock on {resource} denied (held by {})",
                result
                    .held_by
                    .as_ref()
                    .map_or("unknown", UserRef::display_name)
            );
        }
        Ok(result)
    }

    /// Release a lock. `Ok(false)` means the server had no lock of ours to drop.
    pub async fn release_edit_lock(
        &self,
        resource_type: &str,
        resource_id: &str,
        section_id: Option<&str>,
    ) -> Result<bool, RealtimeError> {
        let mut resource = ResourceRef::new(resource_type, resource_id);
        if let Some(section) = section_id {
            resource = resource.with_section(section);
        }
        self.release(&resource).await
    }

    /// The local grant is forgotten even when the request fails.
    pub async fn release(&self, resource: &ResourceRef) -> Result<bool, RealtimeError> {
        self.held().remove(resource);
        let request = LockRequest {
            resource: resource.clone(),
            user: self.user.clone(),
        };
        let result: ReleaseResult = self.router.request(channels::LOCK_RELEASE, &request).await?;
        if !result.released {
            log::debug!("Server held no lock of ours on {resource}");
        }
        Ok(result.released)
    }

    /// Locks this client believes it holds, as last confirmed by the server.
    ///
    /// May be stale once the connection has dropped: the server releases a
    /// session's locks when it disconnects.
    pub fn held_locks(&self) -> Vec<(ResourceRef, LockGrant)> {
        self.held()
            .iter()
            .map(|(resource, grant)| (resource.clone(), grant.clone()))
            .collect()
    }

    pub fn holds(&self, resource: &ResourceRef) -> bool {
        self.held().contains_key(resource)
    }

    /// Drop the local view without contacting the server.
    pub fn forget_all(&self) -> usize {
        let mut held = self.held();
        let count = held.len();
        held.clear();
        count
    }
}
