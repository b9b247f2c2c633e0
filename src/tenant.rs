use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use dashmap::DashMap;

use crate::engine::{DEFAULT_JOURNAL_TIMEOUT, Engine};
use crate::escalator;
use crate::limits::*;

/// Knobs applied to every tenant engine and its background tasks.
#[derive(Debug, Clone, Copy)]
pub struct TenantSettings {
    pub compact_threshold: u64,
    pub escalation_interval: Duration,
    pub journal_timeout: Duration,
}

impl Default for TenantSettings {
    fn default() -> Self {
        Self {
            compact_threshold: 1000,
            escalation_interval: Duration::from_secs(30),
            journal_timeout: DEFAULT_JOURNAL_TIMEOUT,
        }
    }
}

/// Manages per-tenant engines. Each tenant gets its own Engine, journal,
/// escalator and compactor. Tenant = database name from the pgwire connection.
pub struct TenantManager {
    engines: DashMap<String, Arc<Engine>>,
    data_dir: PathBuf,
    settings: TenantSettings,
}

impl TenantManager {
    pub fn new(data_dir: PathBuf, settings: TenantSettings) -> Self {
        Self {
            engines: DashMap::new(),
            data_dir,
            settings,
        }
    }

    /// Get or lazily open the engine for `tenant`. Names that sanitize to the
    /// same file share one engine.
    pub fn get_or_create(&self, tenant: &str) -> std::io::Result<Arc<Engine>> {
        if tenant.len() > MAX_TENANT_NAME_LEN {
            return Err(std::io::Error::new(
                std::io::ErrorKind::InvalidInput,
                "tenant name too long",
            ));
        }

        // no path traversal through the database name
        let safe_name: String = tenant
            .chars()
            .filter(|c| c.is_alphanumeric() || *c == '_' || *c == '-')
            .collect();
        if safe_name.is_empty() {
            return Err(std::io::Error::new(
                std::io::ErrorKind::InvalidInput,
                "empty tenant name",
            ));
        }
        if let Some(engine) = self.engines.get(&safe_name) {
            return Ok(engine.value().clone());
        }
        if self.engines.len() >= MAX_TENANTS {
            return Err(std::io::Error::other("too many tenants"));
        }

        // Held across open so racing connections get the same engine.
        let entry = self.engines.entry(safe_name.clone());
        if let dashmap::mapref::entry::Entry::Occupied(existing) = &entry {
            return Ok(existing.get().clone());
        }
        let path = self.data_dir.join(format!("{safe_name}.wal"));
        let engine = Arc::new(Engine::open(&path)?.with_journal_timeout(self.settings.journal_timeout));
        entry.or_insert(engine.clone());

        tokio::spawn(escalator::run_escalator(engine.clone(), self.settings.escalation_interval));
        tokio::spawn(escalator::run_compactor(engine.clone(), self.settings.compact_threshold));

        tracing::info!("opened tenant {tenant} at {}", path.display());
        metrics::gauge!(crate::observability::TENANTS_ACTIVE).set(self.engines.len() as f64);
        Ok(engine)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::engine::NewRoom;
    use crate::model::*;
    use std::collections::BTreeSet;
    use std::fs;

    fn test_data_dir(name: &str) -> PathBuf {
        let dir = std::env::temp_dir().join("tutorflow_test_tenant").join(name);
        let _ = fs::remove_dir_all(&dir);
        fs::create_dir_all(&dir).unwrap();
        dir
    }

    fn room(name: &str) -> NewRoom {
        NewRoom {
            name: name.into(),
            building: "A".into(),
            floor: 1,
            capacity: 10,
            equipment: BTreeSet::new(),
        }
    }

    #[tokio::test]
    async fn tenant_isolation() {
        let dir = test_data_dir("isolation");
        let tm = TenantManager::new(dir, TenantSettings::default());
        let admin = Identity::new("m1", Role::Management);

        let eng_a = tm.get_or_create("campus_a").unwrap();
        let eng_b = tm.get_or_create("campus_b").unwrap();

        tokio_test::assert_ok!(eng_a.register_room(&admin, room("A101")).await);
        // same name is free in the other tenant
        tokio_test::assert_ok!(eng_b.register_room(&admin, room("A101")).await);
        tokio_test::assert_ok!(eng_a.register_room(&admin, room("A102")).await);

        assert_eq!(eng_a.find_rooms(&Default::default()).await.len(), 2);
        assert_eq!(eng_b.find_rooms(&Default::default()).await.len(), 1);
    }

    #[tokio::test]
    async fn tenant_lazy_creation() {
        let dir = test_data_dir("lazy");
        let tm = TenantManager::new(dir.clone(), TenantSettings::default());

        let entries: Vec<_> = fs::read_dir(&dir).unwrap().collect();
        assert!(entries.is_empty());

        let _eng = tm.get_or_create("my_db").unwrap();
        assert!(dir.join("my_db.wal").exists());
    }

    #[tokio::test]
    async fn tenant_same_engine_returned() {
        let dir = test_data_dir("same_eng");
        let tm = TenantManager::new(dir, TenantSettings::default());

        let eng1 = tm.get_or_create("foo").unwrap();
        let eng2 = tm.get_or_create("foo").unwrap();
        assert!(Arc::ptr_eq(&eng1, &eng2));
    }

    #[tokio::test]
    async fn tenant_name_sanitized() {
        let dir = test_data_dir("sanitize");
        let tm = TenantManager::new(dir.clone(), TenantSettings::default());

        let _eng = tm.get_or_create("../evil").unwrap();
        assert!(dir.join("evil.wal").exists());

        let result = tm.get_or_create("../..");
        assert!(result.is_err());
    }

    #[tokio::test]
    async fn names_sharing_a_file_share_an_engine() {
        let dir = test_data_dir("shared_file");
        let tm = TenantManager::new(dir.clone(), TenantSettings::default());
        let admin = Identity::new("m1", Role::Management);

        let dotted = tm.get_or_create("campus.a").unwrap();
        let plain = tm.get_or_create("campusa").unwrap();
        assert!(Arc::ptr_eq(&dotted, &plain));

        dotted.register_room(&admin, room("A101")).await.unwrap();
        tokio_test::assert_err!(plain.register_room(&admin, room("A101")).await);
        assert_eq!(plain.find_rooms(&Default::default()).await.len(), 1);

        let files: Vec<_> = fs::read_dir(&dir).unwrap().collect();
        assert_eq!(files.len(), 1);
        assert!(dir.join("campusa.wal").exists());
    }

    #[tokio::test]
    async fn tenant_name_too_long() {
        let dir = test_data_dir("name_too_long");
        let tm = TenantManager::new(dir, TenantSettings::default());

        let long_name = "x".repeat(MAX_TENANT_NAME_LEN + 1);
        let err = tm.get_or_create(&long_name).err().unwrap();
        assert!(err.to_string().contains("tenant name too long"));
    }

    #[tokio::test]
    async fn tenant_count_limit() {
        let dir = test_data_dir("count_limit");
        let tm = TenantManager::new(dir, TenantSettings::default());

        for i in 0..MAX_TENANTS {
            tm.get_or_create(&format!("t{i}")).unwrap();
        }
        let err = tm.get_or_create("one_more").err().unwrap();
        assert!(err.to_string().contains("too many tenants"));
    }

    #[tokio::test]
    async fn reopened_tenant_replays_its_journal() {
        let dir = test_data_dir("reopen");
        let admin = Identity::new("m1", Role::Management);
        {
            let tm = TenantManager::new(dir.clone(), TenantSettings::default());
            let engine = tm.get_or_create("campus").unwrap();
            engine.register_room(&admin, room("C301")).await.unwrap();
        }
        let tm = TenantManager::new(dir, TenantSettings::default());
        let engine = tm.get_or_create("campus").unwrap();
        assert_eq!(engine.get_room("C301").await.unwrap().capacity, 10);
    }
}
