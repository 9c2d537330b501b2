//! The container store: id table, netns table, lifecycle contracts.

use std::collections::HashMap;
use std::path::Path;
use std::sync::{Arc, RwLock};

use nix::unistd::Pid;

use crate::error::VkernError;
use crate::process::ProcessHandle;
use crate::state::container::{Container, RegistrationRecord};
use crate::state::ServerPool;
use crate::sysio::FsIo;
use crate::Result;

#[derive(Default)]
struct StoreTables {
    id_table: HashMap<String, Arc<Container>>,
    netns_table: HashMap<u64, Vec<Arc<Container>>>,
}

pub struct ContainerStore {
    io: Arc<dyn FsIo>,
    pool: Arc<dyn ServerPool>,
    tables: RwLock<StoreTables>,
}

impl ContainerStore {
    pub fn new(io: Arc<dyn FsIo>, pool: Arc<dyn ServerPool>) -> Self {
        ContainerStore {
            io,
            pool,
            tables: RwLock::new(StoreTables::default()),
        }
    }

    /// Inserts an incomplete container keyed by id and creates its FUSE
    /// server. When `netns` is given and another container already lives in
    /// that namespace, the new server is bound to the first joiner's data
    /// store, so the whole pod observes one set of emulated values.
    pub fn pre_register(&self, id: &str, netns: Option<&Path>) -> Result<Arc<Container>> {
        let mut tables = self.tables.write().unwrap();
        if tables.id_table.contains_key(id) {
            return Err(VkernError::AlreadyExists(id.to_string()));
        }

        let cntr = Container::new(id);
        let mut state_of = Arc::clone(&cntr);

        if let Some(netns_path) = netns {
            let inode = self.io.ns_inode(netns_path)?;
            cntr.set_net_ns_inode(inode);
            if let Some(first) = tables.netns_table.get(&inode).and_then(|l| l.first()) {
                cntr.share_data_with(first);
                state_of = Arc::clone(first);
            }
        }

        self.pool.create_server(&cntr, &state_of)?;

        if cntr.net_ns_inode() != 0 {
            tables
                .netns_table
                .entry(cntr.net_ns_inode())
                .or_default()
                .push(Arc::clone(&cntr));
        }
        tables.id_table.insert(id.to_string(), Arc::clone(&cntr));
        tracing::info!(id, "container pre-registered");
        Ok(cntr)
    }

    /// Completes (or refreshes) a registration. The id must have been
    /// pre-registered. A re-registration with a new init pid replaces the
    /// pid guard; existing consumers are not signalled.
    pub fn register(&self, id: &str, record: &RegistrationRecord) -> Result<()> {
        let mut tables = self.tables.write().unwrap();
        let cntr = tables
            .id_table
            .get(id)
            .cloned()
            .ok_or_else(|| VkernError::NotFound(id.to_string()))?;

        let _api = cntr.lock_api();
        cntr.merge_record(record);
        cntr.acquire_pid_fd();

        let init = ProcessHandle::new(Pid::from_raw(record.init_pid), Arc::clone(&self.io));
        if let Ok(inode) = init.user_ns_inode() {
            cntr.set_user_ns_inode(inode);
        }
        if let Ok(root) = init.root() {
            if let Ok(status) = self.io.stat(&root) {
                cntr.set_root_ino(status.ino);
            }
        }
        if cntr.net_ns_inode() == 0 {
            let inode = init.net_ns_inode()?;
            cntr.set_net_ns_inode(inode);
            let members = tables.netns_table.entry(inode).or_default();
            if let Some(first) = members.first() {
                cntr.share_data_with(first);
            }
            members.push(Arc::clone(&cntr));
        }

        cntr.set_reg_completed();
        self.pool.registration_complete(id)?;
        tracing::info!(id, init_pid = record.init_pid, "container registered");
        Ok(())
    }

    /// Currently only the creation time may change after registration.
    pub fn update(&self, id: &str, record: &RegistrationRecord) -> Result<()> {
        let tables = self.tables.read().unwrap();
        let cntr = tables
            .id_table
            .get(id)
            .ok_or_else(|| VkernError::NotFound(id.to_string()))?;
        let _api = cntr.lock_api();
        cntr.lock_fields().ctime = Some(record.ctime);
        Ok(())
    }

    pub fn unregister(&self, id: &str) -> Result<()> {
        let mut tables = self.tables.write().unwrap();
        let cntr = tables
            .id_table
            .remove(id)
            .ok_or_else(|| VkernError::NotFound(id.to_string()))?;

        let _api = cntr.lock_api();
        cntr.release_pid_fd();

        let inode = cntr.net_ns_inode();
        if inode != 0 {
            if let Some(members) = tables.netns_table.get_mut(&inode) {
                members.retain(|c| c.id() != id);
                if members.is_empty() {
                    tables.netns_table.remove(&inode);
                }
            }
        }

        self.pool.destroy_server(id)?;
        tracing::info!(id, "container unregistered");
        Ok(())
    }

    pub fn lookup_by_id(&self, id: &str) -> Option<Arc<Container>> {
        self.tables.read().unwrap().id_table.get(id).cloned()
    }

    pub fn lookup_by_netns_inode(&self, inode: u64) -> Option<Arc<Container>> {
        self.tables
            .read()
            .unwrap()
            .netns_table
            .get(&inode)
            .and_then(|members| members.first().cloned())
    }

    pub fn containers_in_netns(&self, inode: u64) -> Vec<Arc<Container>> {
        self.tables
            .read()
            .unwrap()
            .netns_table
            .get(&inode)
            .cloned()
            .unwrap_or_default()
    }

    pub fn len(&self) -> usize {
        self.tables.read().unwrap().id_table.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Checks the netns table against the per-container inodes. Used by the
    /// invariant tests; cheap enough to call from debug assertions.
    pub fn netns_table_consistent(&self) -> bool {
        let tables = self.tables.read().unwrap();
        for (inode, members) in tables.netns_table.iter() {
            for member in members {
                if member.net_ns_inode() != *inode {
                    return false;
                }
                let occurrences = members.iter().filter(|c| c.id() == member.id()).count();
                if occurrences != 1 {
                    return false;
                }
            }
        }
        for cntr in tables.id_table.values() {
            let inode = cntr.net_ns_inode();
            if inode != 0 {
                let present = tables
                    .netns_table
                    .get(&inode)
                    .map(|m| m.iter().any(|c| c.id() == cntr.id()))
                    .unwrap_or(false);
                if !present {
                    return false;
                }
            }
        }
        true
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::state::NullPool;
    use crate::sysio::MemIo;
    use chrono::Utc;
    use std::sync::Mutex;

    /// Pool stub that records lifecycle calls in order.
    #[derive(Default)]
    struct RecordingPool {
        calls: Mutex<Vec<String>>,
    }

    impl ServerPool for RecordingPool {
        fn create_server(&self, cntr: &Arc<Container>, state_of: &Arc<Container>) -> Result<()> {
            self.calls
                .lock()
                .unwrap()
                .push(format!("create:{}:{}", cntr.id(), state_of.id()));
            Ok(())
        }

        fn registration_complete(&self, id: &str) -> Result<()> {
            self.calls.lock().unwrap().push(format!("complete:{id}"));
            Ok(())
        }

        fn destroy_server(&self, id: &str) -> Result<()> {
            self.calls.lock().unwrap().push(format!("destroy:{id}"));
            Ok(())
        }
    }

    fn record(init_pid: i32) -> RegistrationRecord {
        RegistrationRecord {
            init_pid,
            ctime: Utc::now(),
            uid_first: 165536,
            uid_size: 65536,
            gid_first: 165536,
            gid_size: 65536,
            proc_ro_paths: vec![],
            proc_mask_paths: vec![],
            netns_path: None,
        }
    }

    fn store_with_pool() -> (ContainerStore, Arc<RecordingPool>) {
        let io = MemIo::seeded([
            ("/run/netns/pod1", "7001"),
            ("/run/netns/pod2", "7002"),
            ("/proc/1000/ns/net", "7001"),
            ("/proc/1000/ns/user", "5001"),
            ("/proc/2000/ns/net", "7002"),
            ("/proc/2000/ns/user", "5002"),
        ]);
        let pool = Arc::new(RecordingPool::default());
        (
            ContainerStore::new(Arc::new(io), pool.clone()),
            pool,
        )
    }

    #[test]
    fn test_id_uniqueness() -> anyhow::Result<()> {
        let (store, _) = store_with_pool();
        store.pre_register("c1", None)?;
        let err = store.pre_register("c1", None).err().unwrap();
        assert!(matches!(err, VkernError::AlreadyExists(_)));
        assert_eq!(store.len(), 1);
        Ok(())
    }

    #[test]
    fn test_register_requires_pre_register() {
        let (store, _) = store_with_pool();
        let err = store.register("ghost", &record(1000)).err().unwrap();
        assert!(matches!(err, VkernError::NotFound(_)));
    }

    #[test]
    fn test_unregister_unknown_id_not_found() {
        let (store, _) = store_with_pool();
        let err = store.unregister("ghost").err().unwrap();
        assert!(matches!(err, VkernError::NotFound(_)));
    }

    #[test]
    fn test_full_lifecycle_resolves_netns_from_init() -> anyhow::Result<()> {
        let (store, pool) = store_with_pool();
        store.pre_register("c1", None)?;
        store.register("c1", &record(1000))?;

        let cntr = store.lookup_by_id("c1").unwrap();
        assert!(cntr.reg_completed());
        assert_eq!(cntr.net_ns_inode(), 7001);
        assert_eq!(cntr.user_ns_inode(), 5001);
        assert!(store.netns_table_consistent());
        assert_eq!(store.lookup_by_netns_inode(7001).unwrap().id(), "c1");

        store.unregister("c1")?;
        assert!(store.is_empty());
        assert!(store.lookup_by_netns_inode(7001).is_none());
        assert_eq!(
            pool.calls.lock().unwrap().as_slice(),
            ["create:c1:c1", "complete:c1", "destroy:c1"]
        );
        Ok(())
    }

    #[test]
    fn test_pod_sharing_on_pre_register() -> anyhow::Result<()> {
        let (store, pool) = store_with_pool();
        let c1 = store.pre_register("c1", Some(Path::new("/run/netns/pod1")))?;
        let c2 = store.pre_register("c2", Some(Path::new("/run/netns/pod1")))?;

        assert!(c2.shares_data_with(&c1));
        assert_eq!(store.containers_in_netns(7001).len(), 2);
        assert!(store.netns_table_consistent());
        // The second server is bound to the first container's state.
        assert!(pool
            .calls
            .lock()
            .unwrap()
            .contains(&"create:c2:c1".to_string()));
        Ok(())
    }

    #[test]
    fn test_distinct_netns_does_not_share() -> anyhow::Result<()> {
        let (store, _) = store_with_pool();
        let c1 = store.pre_register("c1", Some(Path::new("/run/netns/pod1")))?;
        let c2 = store.pre_register("c2", Some(Path::new("/run/netns/pod2")))?;
        assert!(!c2.shares_data_with(&c1));
        Ok(())
    }

    // Pre-register then abort: no trace may remain, and the server must have
    // been torn down.
    #[test]
    fn test_pre_register_then_abort() -> anyhow::Result<()> {
        let (store, pool) = store_with_pool();
        store.pre_register("c1", Some(Path::new("/run/netns/pod1")))?;
        store.unregister("c1")?;

        assert!(store.lookup_by_id("c1").is_none());
        assert!(store.containers_in_netns(7001).is_empty());
        assert!(store.lookup_by_netns_inode(7001).is_none());
        assert!(store.netns_table_consistent());
        assert!(pool
            .calls
            .lock()
            .unwrap()
            .contains(&"destroy:c1".to_string()));
        Ok(())
    }

    #[test]
    fn test_shared_state_survives_until_last_member_leaves() -> anyhow::Result<()> {
        let (store, _) = store_with_pool();
        let c1 = store.pre_register("c1", Some(Path::new("/run/netns/pod1")))?;
        let c2 = store.pre_register("c2", Some(Path::new("/run/netns/pod1")))?;

        c1.data_write("/proc/sys/net/ipv6/conf/all/disable_ipv6", b"1".to_vec());
        store.unregister("c1")?;

        // c2 still observes the shared value after the first member left.
        assert_eq!(
            c2.data_read(Path::new("/proc/sys/net/ipv6/conf/all/disable_ipv6"))
                .unwrap(),
            b"1"
        );
        assert_eq!(store.containers_in_netns(7001).len(), 1);
        store.unregister("c2")?;
        assert!(store.containers_in_netns(7001).is_empty());
        Ok(())
    }

    #[test]
    fn test_update_merges_only_ctime() -> anyhow::Result<()> {
        let (store, _) = store_with_pool();
        store.pre_register("c1", None)?;
        let mut reg = record(1000);
        store.register("c1", &reg)?;

        let new_time = reg.ctime + chrono::Duration::seconds(60);
        reg.ctime = new_time;
        reg.init_pid = 4321;
        store.update("c1", &reg)?;

        let cntr = store.lookup_by_id("c1").unwrap();
        assert_eq!(cntr.ctime(), Some(new_time));
        // init pid is not touched by update.
        assert_eq!(cntr.init_pid(), Some(Pid::from_raw(1000)));
        Ok(())
    }

    #[test]
    fn test_register_with_missing_netns_info_fails() {
        let (store, _) = store_with_pool();
        store.pre_register("c1", None).unwrap();
        // Init pid 3000 has no seeded ns files; netns resolution must fail
        // and surface as an error instead of registering half a container.
        let err = store.register("c1", &record(3000)).err().unwrap();
        assert!(matches!(err, VkernError::NotFound(_)));
    }

    #[test]
    fn test_null_pool_paths() -> anyhow::Result<()> {
        let io = MemIo::seeded([("/proc/1000/ns/net", "7001"), ("/proc/1000/ns/user", "5001")]);
        let store = ContainerStore::new(Arc::new(io), Arc::new(NullPool));
        store.pre_register("c1", None)?;
        store.register("c1", &record(1000))?;
        store.unregister("c1")?;
        Ok(())
    }

    #[test]
    fn test_pre_register_with_unresolvable_netns_path() {
        let (store, _) = store_with_pool();
        let err = store
            .pre_register("c1", Some(Path::new("/run/netns/ghost")))
            .err()
            .unwrap();
        assert!(matches!(err, VkernError::NotFound(_)));
        assert!(store.is_empty());
    }
}
