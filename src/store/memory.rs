//! In-memory deterministic implementation of the tree store.
//!
//! Mirrors the behavior of a production git-backed store without network
//! or disk I/O: branches advance by compare-and-swap over immutable
//! commits, and head changes are delivered through `tokio::sync::watch`.
//! Used by unit and integration tests, and as the reference for the
//! transaction semantics external backends must provide.

use std::collections::BTreeMap;
use std::collections::BTreeSet;
use std::collections::HashMap;
use std::sync::Arc;
use std::sync::Mutex;

use async_trait::async_trait;
use tokio::sync::watch;
use tokio_util::sync::CancellationToken;

use crate::path::Step;
use crate::path::TreePath;
use crate::store::Branch;
use crate::store::CommitId;
use crate::store::HeadWait;
use crate::store::StoreCommit;
use crate::store::StoreError;
use crate::store::StoreResult;
use crate::store::Transaction;
use crate::store::Tree;
use crate::store::TreeStore;

/// In-memory tree store.
#[derive(Default)]
pub struct MemoryStore {
    branches: Mutex<HashMap<String, Arc<MemoryBranch>>>,
}

impl MemoryStore {
    /// Create an empty store.
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }
}

impl TreeStore for MemoryStore {
    fn branch(&self, name: &str) -> Arc<dyn Branch> {
        let mut branches = self.branches.lock().expect("branch registry poisoned");
        branches
            .entry(name.to_string())
            .or_insert_with(|| Arc::new(MemoryBranch::new(name)))
            .clone()
    }
}

struct MemoryBranch {
    name: String,
    head: watch::Sender<Option<Arc<MemoryCommit>>>,
}

impl MemoryBranch {
    fn new(name: &str) -> Self {
        let (head, _) = watch::channel(None);
        Self {
            name: name.to_string(),
            head,
        }
    }
}

#[async_trait]
impl Branch for MemoryBranch {
    fn name(&self) -> &str {
        &self.name
    }

    async fn head(&self) -> StoreResult<Option<Arc<dyn StoreCommit>>> {
        Ok(self.head.borrow().clone().map(|c| c as Arc<dyn StoreCommit>))
    }

    async fn transaction(&self) -> StoreResult<Box<dyn Transaction>> {
        let base = self.head.borrow().clone();
        let (files, dirs) = match &base {
            Some(commit) => (commit.tree.files.clone(), commit.tree.dirs.clone()),
            None => (BTreeMap::new(), BTreeSet::new()),
        };
        Ok(Box::new(MemoryTransaction {
            head: self.head.clone(),
            branch: self.name.clone(),
            base_id: base.map(|c| c.id.clone()),
            files,
            dirs,
        }))
    }

    async fn wait_for_head(
        &self,
        last_seen: Option<&CommitId>,
        cancel: &CancellationToken,
    ) -> StoreResult<HeadWait> {
        let mut rx = self.head.subscribe();
        loop {
            let current = rx.borrow_and_update().clone();
            if current.as_ref().map(|c| &c.id) != last_seen {
                return Ok(HeadWait::NewHead(
                    current.map(|c| c as Arc<dyn StoreCommit>),
                ));
            }
            tokio::select! {
                _ = cancel.cancelled() => return Ok(HeadWait::Aborted),
                changed = rx.changed() => {
                    if changed.is_err() {
                        return Err(StoreError::Backend {
                            message: format!("branch {} dropped", self.name),
                        });
                    }
                }
            }
        }
    }
}

struct MemoryCommit {
    id: CommitId,
    message: String,
    tree: Arc<MemoryTree>,
}

impl StoreCommit for MemoryCommit {
    fn id(&self) -> &CommitId {
        &self.id
    }

    fn message(&self) -> &str {
        &self.message
    }

    fn tree(&self) -> Arc<dyn Tree> {
        self.tree.clone()
    }
}

struct MemoryTree {
    files: BTreeMap<TreePath, Vec<u8>>,
    dirs: BTreeSet<TreePath>,
}

impl MemoryTree {
    fn children(&self, path: &TreePath) -> BTreeSet<Step> {
        let depth = path.len();
        let mut children = BTreeSet::new();
        for key in self.files.keys().chain(self.dirs.iter()) {
            if key.len() > depth && key.starts_with(path) {
                children.insert(key.segments()[depth].clone());
            }
        }
        children
    }
}

#[async_trait]
impl Tree for MemoryTree {
    async fn read_file(&self, path: &TreePath) -> StoreResult<Vec<u8>> {
        self.files
            .get(path)
            .cloned()
            .ok_or_else(|| StoreError::NoEntry { path: path.clone() })
    }

    async fn read_dir(&self, path: &TreePath) -> StoreResult<Vec<Step>> {
        if self.files.contains_key(path) {
            return Err(StoreError::NotDirectory { path: path.clone() });
        }
        let children = self.children(path);
        if children.is_empty() && !path.is_empty() && !self.dirs.contains(path) {
            return Err(StoreError::NoEntry { path: path.clone() });
        }
        Ok(children.into_iter().collect())
    }

    async fn exists_file(&self, path: &TreePath) -> StoreResult<bool> {
        Ok(self.files.contains_key(path))
    }
}

struct MemoryTransaction {
    head: watch::Sender<Option<Arc<MemoryCommit>>>,
    branch: String,
    base_id: Option<CommitId>,
    files: BTreeMap<TreePath, Vec<u8>>,
    dirs: BTreeSet<TreePath>,
}

impl MemoryTransaction {
    fn insert_ancestors(&mut self, path: &TreePath) {
        let mut current = path.parent();
        while let Some(dir) = current {
            if dir.is_empty() {
                break;
            }
            self.dirs.insert(dir.clone());
            current = dir.parent();
        }
    }
}

#[async_trait]
impl Transaction for MemoryTransaction {
    async fn read_file(&self, path: &TreePath) -> StoreResult<Vec<u8>> {
        self.files
            .get(path)
            .cloned()
            .ok_or_else(|| StoreError::NoEntry { path: path.clone() })
    }

    async fn exists_file(&self, path: &TreePath) -> StoreResult<bool> {
        Ok(self.files.contains_key(path))
    }

    async fn make_dirs(&mut self, path: &TreePath) -> StoreResult<()> {
        if self.files.contains_key(path) {
            return Err(StoreError::NotDirectory { path: path.clone() });
        }
        if !path.is_empty() {
            self.dirs.insert(path.clone());
            self.insert_ancestors(path);
        }
        Ok(())
    }

    async fn create_file(&mut self, path: &TreePath, data: &[u8]) -> StoreResult<()> {
        if self.files.contains_key(path) {
            return Err(StoreError::AlreadyExists { path: path.clone() });
        }
        self.insert_ancestors(path);
        self.files.insert(path.clone(), data.to_vec());
        Ok(())
    }

    async fn create_or_replace_file(&mut self, path: &TreePath, data: &[u8]) -> StoreResult<()> {
        self.insert_ancestors(path);
        self.files.insert(path.clone(), data.to_vec());
        Ok(())
    }

    async fn remove(&mut self, path: &TreePath) -> StoreResult<()> {
        if self.files.remove(path).is_some() {
            return Ok(());
        }
        let under: Vec<TreePath> = self
            .files
            .keys()
            .filter(|k| k.starts_with(path))
            .cloned()
            .collect();
        let dirs_under: Vec<TreePath> = self
            .dirs
            .iter()
            .filter(|d| d.starts_with(path))
            .cloned()
            .collect();
        if under.is_empty() && dirs_under.is_empty() {
            return Err(StoreError::NoEntry { path: path.clone() });
        }
        for key in under {
            self.files.remove(&key);
        }
        for dir in dirs_under {
            self.dirs.remove(&dir);
        }
        Ok(())
    }

    async fn commit(self: Box<Self>, message: &str) -> StoreResult<()> {
        let tree = Arc::new(MemoryTree {
            files: self.files,
            dirs: self.dirs,
        });

        // Content-derived commit id: parent, message and full tree.
        let mut hasher = blake3::Hasher::new();
        if let Some(parent) = &self.base_id {
            hasher.update(parent.0.as_bytes());
        }
        hasher.update(message.as_bytes());
        for (path, data) in &tree.files {
            hasher.update(path.to_string().as_bytes());
            hasher.update(&[0]);
            hasher.update(data);
        }
        for dir in &tree.dirs {
            hasher.update(dir.to_string().as_bytes());
            hasher.update(&[1]);
        }
        let commit = Arc::new(MemoryCommit {
            id: CommitId(hasher.finalize().to_hex().to_string()),
            message: message.to_string(),
            tree,
        });

        let mut swapped = false;
        self.head.send_if_modified(|current| {
            if current.as_ref().map(|c| &c.id) == self.base_id.as_ref() {
                *current = Some(commit.clone());
                swapped = true;
                true
            } else {
                false
            }
        });
        if swapped {
            Ok(())
        } else {
            Err(StoreError::Conflict {
                branch: self.branch,
            })
        }
    }

    async fn abort(self: Box<Self>) {}
}

#[cfg(test)]
mod tests {
    use super::*;

    async fn write_file(store: &MemoryStore, branch: &str, path: &str, data: &str) {
        let branch = store.branch(branch);
        let mut txn = branch.transaction().await.unwrap();
        txn.create_or_replace_file(&TreePath::parse(path).unwrap(), data.as_bytes())
            .await
            .unwrap();
        txn.commit("write").await.unwrap();
    }

    #[tokio::test]
    async fn test_empty_branch_has_no_head() {
        let store = MemoryStore::new();
        let branch = store.branch("github-metadata");
        assert!(branch.head().await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_commit_advances_head_and_reads_back() {
        let store = MemoryStore::new();
        write_file(&store, "b", "a/b/c", "hello\n").await;

        let head = store.branch("b").head().await.unwrap().unwrap();
        let tree = head.tree();
        let data = tree.read_file(&TreePath::parse("a/b/c").unwrap()).await.unwrap();
        assert_eq!(data, b"hello\n");
        assert!(tree.exists_file(&TreePath::parse("a/b/c").unwrap()).await.unwrap());

        let listing = tree.read_dir(&TreePath::parse("a/b").unwrap()).await.unwrap();
        assert_eq!(listing.len(), 1);
        assert_eq!(listing[0].as_str(), "c");
    }

    #[tokio::test]
    async fn test_no_entry_is_distinguished() {
        let store = MemoryStore::new();
        write_file(&store, "b", "present", "x").await;
        let tree = store.branch("b").head().await.unwrap().unwrap().tree();
        let err = tree
            .read_file(&TreePath::parse("absent").unwrap())
            .await
            .unwrap_err();
        assert!(err.is_no_entry());
        let err = tree
            .read_dir(&TreePath::parse("absent").unwrap())
            .await
            .unwrap_err();
        assert!(err.is_no_entry());
    }

    #[tokio::test]
    async fn test_concurrent_commit_conflicts() {
        let store = MemoryStore::new();
        let branch = store.branch("b");

        let mut first = branch.transaction().await.unwrap();
        let mut second = branch.transaction().await.unwrap();
        first
            .create_file(&TreePath::parse("f").unwrap(), b"1")
            .await
            .unwrap();
        second
            .create_file(&TreePath::parse("g").unwrap(), b"2")
            .await
            .unwrap();

        first.commit("first").await.unwrap();
        let err = second.commit("second").await.unwrap_err();
        assert!(matches!(err, StoreError::Conflict { .. }));
    }

    #[tokio::test]
    async fn test_create_file_rejects_existing() {
        let store = MemoryStore::new();
        write_file(&store, "b", "f", "1").await;
        let branch = store.branch("b");
        let mut txn = branch.transaction().await.unwrap();
        let err = txn
            .create_file(&TreePath::parse("f").unwrap(), b"2")
            .await
            .unwrap_err();
        assert!(matches!(err, StoreError::AlreadyExists { .. }));
        txn.abort().await;
    }

    #[tokio::test]
    async fn test_remove_subtree() {
        let store = MemoryStore::new();
        write_file(&store, "b", "dir/a", "1").await;
        write_file(&store, "b", "dir/b", "2").await;
        write_file(&store, "b", "other", "3").await;

        let branch = store.branch("b");
        let mut txn = branch.transaction().await.unwrap();
        txn.remove(&TreePath::parse("dir").unwrap()).await.unwrap();
        txn.commit("rm").await.unwrap();

        let tree = branch.head().await.unwrap().unwrap().tree();
        assert!(tree
            .read_dir(&TreePath::parse("dir").unwrap())
            .await
            .unwrap_err()
            .is_no_entry());
        assert!(tree.exists_file(&TreePath::parse("other").unwrap()).await.unwrap());
    }

    #[tokio::test]
    async fn test_wait_for_head_sees_new_commit() {
        let store = MemoryStore::new();
        let branch = store.branch("b");
        let cancel = CancellationToken::new();

        let waiter = {
            let branch = branch.clone();
            let cancel = cancel.clone();
            tokio::spawn(async move { branch.wait_for_head(None, &cancel).await })
        };

        write_file(&store, "b", "f", "1").await;

        match waiter.await.unwrap().unwrap() {
            HeadWait::NewHead(Some(commit)) => assert_eq!(commit.message(), "write"),
            _ => panic!("expected a new head"),
        }
    }

    #[tokio::test]
    async fn test_wait_for_head_aborts_on_cancel() {
        let store = MemoryStore::new();
        let branch = store.branch("b");
        let cancel = CancellationToken::new();
        cancel.cancel();
        // Head is None and last_seen is a stale id, so the head "differs"
        // only once a commit lands; cancellation must win here.
        write_file(&store, "b", "f", "1").await;
        let head = branch.head().await.unwrap().unwrap();
        match branch.wait_for_head(Some(head.id()), &cancel).await.unwrap() {
            HeadWait::Aborted => {}
            _ => panic!("expected abort"),
        }
    }
}
