use std::collections::BTreeMap;
use std::sync::{Arc, Mutex};

use thiserror::Error;
use tg_types::FieldId;

#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum RegistryError {
    #[error("field {field} is already held by {owner}")]
    AlreadyClaimed { field: FieldId, owner: String },
    #[error("field registry lock poisoned")]
    Poisoned,
}

type Owners = Arc<Mutex<BTreeMap<FieldId, String>>>;

/// Which worker currently owns each field. A field has at most one writer;
/// ownership lasts as long as the returned [`FieldLease`].
#[derive(Debug, Clone, Default)]
pub struct FieldRegistry {
    owners: Owners,
}

impl FieldRegistry {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    pub fn claim(
        &self,
        field: FieldId,
        owner: impl Into<String>,
    ) -> Result<FieldLease, RegistryError> {
        let owner = owner.into();
        let mut owners = self.owners.lock().map_err(|_| RegistryError::Poisoned)?;
        if let Some(current) = owners.get(&field) {
            return Err(RegistryError::AlreadyClaimed {
                field,
                owner: current.clone(),
            });
        }
        owners.insert(field.clone(), owner.clone());
        drop(owners);

        #[cfg(feature = "tracing")]
        tracing::debug!(field = %field, owner = %owner, "field claimed");
        Ok(FieldLease {
            owners: Arc::clone(&self.owners),
            field,
            owner,
        })
    }

    pub fn owner_of(&self, field: &FieldId) -> Result<Option<String>, RegistryError> {
        let owners = self.owners.lock().map_err(|_| RegistryError::Poisoned)?;
        Ok(owners.get(field).cloned())
    }

    pub fn claimed(&self) -> Result<Vec<FieldId>, RegistryError> {
        let owners = self.owners.lock().map_err(|_| RegistryError::Poisoned)?;
        Ok(owners.keys().cloned().collect())
    }
}

/// Releases the field when dropped.
#[derive(Debug)]
pub struct FieldLease {
    owners: Owners,
    field: FieldId,
    owner: String,
}

impl FieldLease {
    #[must_use]
    pub fn field(&self) -> &FieldId {
        &self.field
    }

    #[must_use]
    pub fn owner(&self) -> &str {
        &self.owner
    }
}

impl Drop for FieldLease {
    fn drop(&mut self) {
        // A poisoned map is still released so the field does not stay
        // claimed forever.
        let mut owners = match self.owners.lock() {
            Ok(owners) => owners,
            Err(poisoned) => poisoned.into_inner(),
        };
        owners.remove(&self.field);
    }
}

#[cfg(test)]
mod tests {
    use std::sync::{Arc, Barrier};
    use std::thread;

    use super::{FieldRegistry, RegistryError};
    use tg_types::FieldId;

    #[test]
    fn second_claim_fails_until_lease_drops() {
        let registry = FieldRegistry::new();
        let lease = registry.claim(FieldId::new("web"), "worker-1").expect("claim");
        assert_eq!(lease.owner(), "worker-1");
        assert_eq!(
            registry.claim(FieldId::new("web"), "worker-2").expect_err("held"),
            RegistryError::AlreadyClaimed {
                field: FieldId::new("web"),
                owner: "worker-1".to_owned()
            }
        );
        let other = registry.claim(FieldId::new("mail"), "worker-2").expect("independent field");
        assert_eq!(
            registry.claimed().expect("claimed"),
            vec![FieldId::new("mail"), FieldId::new("web")]
        );

        drop(lease);
        assert_eq!(registry.owner_of(&FieldId::new("web")).expect("owner"), None);
        registry.claim(FieldId::new("web"), "worker-2").expect("reclaim");
        drop(other);
    }

    #[test]
    fn concurrent_claims_grant_exactly_one_lease() {
        let registry = Arc::new(FieldRegistry::new());
        let barrier = Arc::new(Barrier::new(8));
        let handles: Vec<_> = (0..8)
            .map(|worker| {
                let registry = Arc::clone(&registry);
                let barrier = Arc::clone(&barrier);
                thread::spawn(move || {
                    let lease = registry.claim(FieldId::new("web"), format!("worker-{worker}"));
                    // Every claim lands before any lease is released.
                    barrier.wait();
                    lease.is_ok()
                })
            })
            .collect();
        let winners = handles
            .into_iter()
            .map(|handle| handle.join().expect("join"))
            .filter(|won| *won)
            .count();
        assert_eq!(winners, 1);
        assert_eq!(registry.owner_of(&FieldId::new("web")).expect("owner"), None);
    }

    #[test]
    fn poisoned_registry_reports_an_error() {
        let registry = Arc::new(FieldRegistry::new());
        let poisoner = Arc::clone(&registry);
        let _ = thread::spawn(move || {
            let _guard = poisoner.owners.lock().expect("lock");
            panic!("worker crashed while holding the registry");
        })
        .join();
        assert_eq!(
            registry.claim(FieldId::new("web"), "worker").expect_err("poisoned"),
            RegistryError::Poisoned
        );
    }
}
