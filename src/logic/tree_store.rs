use std::collections::HashSet;
use std::sync::Arc;

use serde::Serialize;

use crate::context::OpContext;
use crate::error::{Result, VcsError};
use crate::logic::ObjectStorage;
use crate::model::{Object, ObjectType, Tree, TreeDiff, TreeEntry};
use crate::store::ObjectRowStore;

/// Accumulates entries and the blobs they point at before a tree is stored.
#[derive(Debug, Default)]
pub struct TreeBuilder {
    tree: Tree,
    pending: Vec<Object>,
}

impl TreeBuilder {
    pub fn new() -> Self {
        Self::default()
    }

    /// Add a blob entry whose bytes are written along with the tree.
    pub fn add_blob(&mut self, name: impl Into<String>, contents: Vec<u8>) -> &mut Self {
        let object = Object::blob(contents);
        let replaced = self.tree.insert(name, object.hash.clone(), ObjectType::Blob);
        self.forget(replaced);
        self.pending.push(object);
        self
    }

    pub fn add_json<T: Serialize>(&mut self, name: impl Into<String>, value: &T) -> Result<&mut Self> {
        let contents = serde_json::to_vec(value)?;
        Ok(self.add_blob(name, contents))
    }

    /// Reference an object that is already stored.
    pub fn add_entry(&mut self, name: impl Into<String>, hash: impl Into<String>, entry_type: ObjectType) -> &mut Self {
        let replaced = self.tree.insert(name, hash, entry_type);
        self.forget(replaced);
        self
    }

    fn forget(&mut self, replaced: Option<TreeEntry>) {
        if let Some(entry) = replaced {
            if let Some(pos) = self.pending.iter().position(|o| o.hash == entry.hash) {
                self.pending.remove(pos);
            }
        }
    }

    pub fn tree(&self) -> &Tree {
        &self.tree
    }

    pub fn len(&self) -> usize {
        self.tree.len()
    }

    pub fn is_empty(&self) -> bool {
        self.tree.is_empty()
    }
}

/// Trees on top of the object store.
///
/// A newly stored tree holds one reference on each entry; storing an
/// existing tree only adds a reference to the tree itself.
pub struct TreeStorage<S> {
    objects: Arc<ObjectStorage<S>>,
}

impl<S: ObjectRowStore> TreeStorage<S> {
    pub fn new(objects: Arc<ObjectStorage<S>>) -> Self {
        Self { objects }
    }

    pub fn objects(&self) -> &Arc<ObjectStorage<S>> {
        &self.objects
    }

    pub async fn store(&self, ctx: &OpContext, tree: &Tree) -> Result<String> {
        self.store_entries(ctx, tree, Vec::new()).await
    }

    pub async fn store_built(&self, ctx: &OpContext, builder: TreeBuilder) -> Result<String> {
        self.store_entries(ctx, &builder.tree, builder.pending).await
    }

    async fn store_entries(&self, ctx: &OpContext, tree: &Tree, pending: Vec<Object>) -> Result<String> {
        let object = tree.to_object()?;
        let hash = object.hash.clone();

        if let Some(info) = self.objects.info(ctx, &hash).await? {
            if info.object_type != ObjectType::Tree {
                return Err(VcsError::TypeMismatch {
                    hash,
                    expected: ObjectType::Tree,
                    found: info.object_type,
                });
            }
            match self.objects.increment_ref(ctx, &hash).await {
                Ok(_) => return Ok(hash),
                Err(e) if e.is_not_found() => {}
                Err(e) => return Err(e),
            }
        }

        let fresh: HashSet<&str> = pending.iter().map(|o| o.hash.as_str()).collect();
        for entry in tree.entries().filter(|e| !fresh.contains(e.hash.as_str())) {
            if !self.objects.exists(ctx, &entry.hash).await? {
                return Err(VcsError::dangling(format!("tree {}", hash), "object", entry.hash.clone()));
            }
        }

        let mut taken = Vec::with_capacity(tree.len());
        match self.take_entry_refs(ctx, &hash, tree, pending, &mut taken).await {
            Ok(()) => {}
            Err(e) => {
                self.give_back(&taken).await;
                return Err(e);
            }
        }
        match self.objects.store(ctx, object).await {
            Ok(hash) => Ok(hash),
            Err(e) => {
                self.give_back(&taken).await;
                Err(e)
            }
        }
    }

    /// Store pending blobs and reference the remaining entries, recording
    /// each hash in `taken` as soon as it holds a reference for the tree.
    async fn take_entry_refs(
        &self,
        ctx: &OpContext,
        hash: &str,
        tree: &Tree,
        pending: Vec<Object>,
        taken: &mut Vec<String>,
    ) -> Result<()> {
        let mut written = HashSet::new();
        for blob in pending {
            let blob_hash = self.objects.store(ctx, blob).await?;
            taken.push(blob_hash.clone());
            written.insert(blob_hash);
        }
        for entry in tree.entries().filter(|e| !written.contains(&e.hash)) {
            match self.objects.increment_ref(ctx, &entry.hash).await {
                Ok(_) => taken.push(entry.hash.clone()),
                Err(e) if e.is_not_found() => {
                    return Err(VcsError::dangling(format!("tree {}", hash), "object", entry.hash.clone()))
                }
                Err(e) => return Err(e),
            }
        }
        Ok(())
    }

    /// Undo references taken by a tree store that did not complete.
    async fn give_back(&self, taken: &[String]) {
        // the caller's ctx may be the reason we are unwinding
        let ctx = OpContext::background();
        for hash in taken {
            if let Err(e) = self.objects.decrement_ref(&ctx, hash).await {
                log::warn!("Failed to release {} after aborted tree store: {}", hash, e);
            }
        }
    }

    pub async fn load(&self, ctx: &OpContext, hash: &str) -> Result<Tree> {
        let object = self.objects.load(ctx, hash).await?;
        if object.object_type != ObjectType::Tree {
            return Err(VcsError::TypeMismatch {
                hash: hash.to_string(),
                expected: ObjectType::Tree,
                found: object.object_type,
            });
        }
        Tree::from_bytes(&object.contents)
    }

    /// True only if `hash` exists and is a tree.
    pub async fn exists(&self, ctx: &OpContext, hash: &str) -> Result<bool> {
        Ok(matches!(
            self.objects.info(ctx, hash).await?,
            Some(info) if info.object_type == ObjectType::Tree
        ))
    }

    /// Give back one reference taken by `store`.
    pub async fn release(&self, ctx: &OpContext, hash: &str) -> Result<i32> {
        self.objects.decrement_ref(ctx, hash).await
    }

    pub async fn diff(&self, ctx: &OpContext, from: &str, to: &str) -> Result<TreeDiff> {
        if from == to {
            return Ok(TreeDiff::default());
        }
        let old = self.load(ctx, from).await?;
        let new = self.load(ctx, to).await?;
        Ok(old.diff(&new))
    }
}
