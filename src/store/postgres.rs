use chrono::{DateTime, Utc};
use sqlx::postgres::{PgPoolOptions, PgRow};
use sqlx::{PgPool, Row};

use crate::error::{Result, VcsError};
use crate::model::{
    Branch, Change, ChangesSummary, Commit, Conflict, ConflictResolution, ConflictStatus,
    EntityKind, Id, ObjectInfo, ObjectRow, ObjectStats, ObjectType, Snapshot,
};
use crate::store::traits::{
    BranchStore, ChangeStore, CommitStore, ConflictStore, ObjectRowStore, SnapshotStore, Store,
};

const OBJECT_COLUMNS: &str = "hash, object_type, size, ref_count, storage_tier, created_at";
const SNAPSHOT_COLUMNS: &str = "hash, repository_id, building_tree, equipment_tree, spatial_tree, \
     files_tree, operations_tree, metadata, created_at";
const BRANCH_COLUMNS: &str = "id, repository_id, name, display_name, description, base_commit, \
     head_commit, branch_type, protected, requires_review, auto_delete_on_merge, status, \
     is_default, created_by, owned_by, created_at, updated_at, merged_at, merged_by";
const COMMIT_COLUMNS: &str = "id, repository_id, branch_id, version_id, commit_hash, short_hash, \
     message, author_name, author_email, author_id, parent_commits, merge_commit, \
     changes_summary, files_changed, lines_added, lines_deleted, tags, metadata, committed_at";
const CHANGE_COLUMNS: &str = "id, change_type, entity, entity_id, timestamp, data, version";
const CONFLICT_COLUMNS: &str = "id, entity, entity_id, conflict_type, local_data, remote_data, \
     local_change, remote_change, status, detected_at";

/// PostgreSQL-backed row store
#[derive(Debug, Clone)]
pub struct PostgresStore {
    pool: PgPool,
}

impl PostgresStore {
    /// Create a new PostgreSQL store with the given database URL
    pub async fn new(database_url: &str, max_connections: u32) -> Result<Self> {
        let pool = PgPoolOptions::new()
            .max_connections(max_connections)
            .connect(database_url)
            .await?;

        Ok(Self { pool })
    }

    /// Run database migrations
    pub async fn migrate(&self) -> Result<()> {
        sqlx::migrate!("./migrations").run(&self.pool).await?;
        log::info!("Database migrations applied");
        Ok(())
    }

    /// Get a reference to the connection pool
    pub fn pool(&self) -> &PgPool {
        &self.pool
    }
}

fn is_unique_violation(err: &sqlx::Error) -> bool {
    matches!(err, sqlx::Error::Database(db) if db.code().as_deref() == Some("23505"))
}

fn object_info_from_row(row: &PgRow) -> Result<ObjectInfo> {
    let object_type: String = row.try_get("object_type")?;
    let tier: String = row.try_get("storage_tier")?;
    Ok(ObjectInfo {
        hash: row.try_get("hash")?,
        object_type: object_type.parse()?,
        size: row.try_get("size")?,
        ref_count: row.try_get("ref_count")?,
        tier: tier.parse()?,
        created_at: row.try_get("created_at")?,
    })
}

fn snapshot_from_row(row: &PgRow) -> Result<Snapshot> {
    Ok(Snapshot {
        hash: row.try_get("hash")?,
        repository_id: row.try_get("repository_id")?,
        building_tree: row.try_get("building_tree")?,
        equipment_tree: row.try_get("equipment_tree")?,
        spatial_tree: row.try_get("spatial_tree")?,
        files_tree: row.try_get("files_tree")?,
        operations_tree: row.try_get("operations_tree")?,
        metadata: row.try_get("metadata")?,
        created_at: row.try_get("created_at")?,
    })
}

fn branch_from_row(row: &PgRow) -> Result<Branch> {
    let branch_type: String = row.try_get("branch_type")?;
    let status: String = row.try_get("status")?;
    Ok(Branch {
        id: row.try_get("id")?,
        repository_id: row.try_get("repository_id")?,
        name: row.try_get("name")?,
        display_name: row.try_get("display_name")?,
        description: row.try_get("description")?,
        base_commit: row.try_get("base_commit")?,
        head_commit: row.try_get("head_commit")?,
        branch_type: branch_type.parse()?,
        protected: row.try_get("protected")?,
        requires_review: row.try_get("requires_review")?,
        auto_delete_on_merge: row.try_get("auto_delete_on_merge")?,
        status: status.parse()?,
        is_default: row.try_get("is_default")?,
        created_by: row.try_get("created_by")?,
        owned_by: row.try_get("owned_by")?,
        created_at: row.try_get("created_at")?,
        updated_at: row.try_get("updated_at")?,
        merged_at: row.try_get("merged_at")?,
        merged_by: row.try_get("merged_by")?,
    })
}

fn commit_from_row(row: &PgRow) -> Result<Commit> {
    let summary: serde_json::Value = row.try_get("changes_summary")?;
    let changes_summary: ChangesSummary = serde_json::from_value(summary)?;
    Ok(Commit {
        id: row.try_get("id")?,
        repository_id: row.try_get("repository_id")?,
        branch_id: row.try_get("branch_id")?,
        version_id: row.try_get("version_id")?,
        commit_hash: row.try_get("commit_hash")?,
        short_hash: row.try_get("short_hash")?,
        message: row.try_get("message")?,
        author_name: row.try_get("author_name")?,
        author_email: row.try_get("author_email")?,
        author_id: row.try_get("author_id")?,
        parent_commits: row.try_get("parent_commits")?,
        merge_commit: row.try_get("merge_commit")?,
        changes_summary,
        files_changed: row.try_get("files_changed")?,
        lines_added: row.try_get("lines_added")?,
        lines_deleted: row.try_get("lines_deleted")?,
        tags: row.try_get("tags")?,
        metadata: row.try_get("metadata")?,
        committed_at: row.try_get("committed_at")?,
    })
}

fn change_from_row(row: &PgRow) -> Result<Change> {
    let change_type: String = row.try_get("change_type")?;
    let entity: String = row.try_get("entity")?;
    let data: serde_json::Value = row.try_get("data")?;
    Ok(Change {
        id: row.try_get("id")?,
        change_type: change_type.parse()?,
        entity: entity.parse()?,
        entity_id: row.try_get("entity_id")?,
        timestamp: row.try_get("timestamp")?,
        data: serde_json::from_value(data)?,
        version: row.try_get("version")?,
    })
}

fn conflict_from_row(row: &PgRow) -> Result<Conflict> {
    let entity: String = row.try_get("entity")?;
    let conflict_type: String = row.try_get("conflict_type")?;
    let status: String = row.try_get("status")?;
    let local_data: serde_json::Value = row.try_get("local_data")?;
    let remote_data: serde_json::Value = row.try_get("remote_data")?;
    let local_change: serde_json::Value = row.try_get("local_change")?;
    let remote_change: serde_json::Value = row.try_get("remote_change")?;
    Ok(Conflict {
        id: row.try_get("id")?,
        entity: entity.parse()?,
        entity_id: row.try_get("entity_id")?,
        conflict_type: conflict_type.parse()?,
        local_data: serde_json::from_value(local_data)?,
        remote_data: serde_json::from_value(remote_data)?,
        local_change: serde_json::from_value(local_change)?,
        remote_change: serde_json::from_value(remote_change)?,
        status: status.parse()?,
        detected_at: row.try_get("detected_at")?,
    })
}

fn resolution_from_row(row: &PgRow) -> Result<ConflictResolution> {
    let resolution: String = row.try_get("resolution")?;
    Ok(ConflictResolution {
        id: row.try_get("id")?,
        conflict_id: row.try_get("conflict_id")?,
        resolution: resolution.parse()?,
        resolved_by: row.try_get("resolved_by")?,
        resolved_at: row.try_get("resolved_at")?,
        notes: row.try_get("notes")?,
    })
}

#[async_trait::async_trait]
impl ObjectRowStore for PostgresStore {
    async fn get_object_row(&self, hash: &str) -> Result<Option<ObjectRow>> {
        let query = format!("SELECT {}, inline_contents FROM vcs_objects WHERE hash = $1", OBJECT_COLUMNS);
        let row = sqlx::query(&query)
            .bind(hash)
            .fetch_optional(&self.pool)
            .await?;

        let Some(row) = row else {
            return Ok(None);
        };

        Ok(Some(ObjectRow {
            info: object_info_from_row(&row)?,
            inline_contents: row.try_get("inline_contents")?,
        }))
    }

    async fn get_object_info(&self, hash: &str) -> Result<Option<ObjectInfo>> {
        let query = format!("SELECT {} FROM vcs_objects WHERE hash = $1", OBJECT_COLUMNS);
        let row = sqlx::query(&query)
            .bind(hash)
            .fetch_optional(&self.pool)
            .await?;

        row.as_ref().map(object_info_from_row).transpose()
    }

    async fn object_exists(&self, hash: &str) -> Result<bool> {
        let exists: bool = sqlx::query_scalar("SELECT EXISTS(SELECT 1 FROM vcs_objects WHERE hash = $1)")
            .bind(hash)
            .fetch_one(&self.pool)
            .await?;
        Ok(exists)
    }

    async fn upsert_object_row(&self, row: ObjectRow) -> Result<i32> {
        let ref_count: i32 = sqlx::query_scalar(
            r#"
            INSERT INTO vcs_objects (hash, object_type, size, ref_count, storage_tier, compressed, inline_contents, created_at)
            VALUES ($1, $2, $3, $4, $5, $6, $7, $8)
            ON CONFLICT (hash) DO UPDATE SET ref_count = vcs_objects.ref_count + 1
            RETURNING ref_count
            "#,
        )
        .bind(&row.info.hash)
        .bind(row.info.object_type.as_str())
        .bind(row.info.size)
        .bind(row.info.ref_count)
        .bind(row.info.tier.as_str())
        .bind(row.info.compressed())
        .bind(&row.inline_contents)
        .bind(row.info.created_at)
        .fetch_one(&self.pool)
        .await?;

        Ok(ref_count)
    }

    async fn increment_object_ref(&self, hash: &str) -> Result<i32> {
        let ref_count: Option<i32> = sqlx::query_scalar(
            "UPDATE vcs_objects SET ref_count = ref_count + 1 WHERE hash = $1 RETURNING ref_count",
        )
        .bind(hash)
        .fetch_optional(&self.pool)
        .await?;

        ref_count.ok_or_else(|| VcsError::not_found("object", hash))
    }

    async fn decrement_object_ref(&self, hash: &str) -> Result<i32> {
        let ref_count: Option<i32> = sqlx::query_scalar(
            "UPDATE vcs_objects SET ref_count = GREATEST(ref_count - 1, 0) WHERE hash = $1 RETURNING ref_count",
        )
        .bind(hash)
        .fetch_optional(&self.pool)
        .await?;

        ref_count.ok_or_else(|| VcsError::not_found("object", hash))
    }

    async fn list_objects_by_type(
        &self,
        object_type: ObjectType,
        limit: i64,
        offset: i64,
    ) -> Result<Vec<ObjectInfo>> {
        let query = format!(
            "SELECT {} FROM vcs_objects WHERE object_type = $1 ORDER BY created_at DESC, hash LIMIT $2 OFFSET $3",
            OBJECT_COLUMNS
        );
        let rows = sqlx::query(&query)
            .bind(object_type.as_str())
            .bind(limit)
            .bind(offset)
            .fetch_all(&self.pool)
            .await?;

        rows.iter().map(object_info_from_row).collect()
    }

    async fn delete_unreferenced_objects(&self, older_than: DateTime<Utc>) -> Result<Vec<ObjectInfo>> {
        let query = format!(
            "DELETE FROM vcs_objects WHERE ref_count = 0 AND created_at < $1 RETURNING {}",
            OBJECT_COLUMNS
        );
        let rows = sqlx::query(&query)
            .bind(older_than)
            .fetch_all(&self.pool)
            .await?;

        rows.iter().map(object_info_from_row).collect()
    }

    async fn object_stats(&self) -> Result<Vec<ObjectStats>> {
        let rows = sqlx::query(
            r#"
            SELECT object_type,
                   COUNT(*) AS count,
                   COALESCE(SUM(size), 0)::BIGINT AS total_size,
                   COUNT(*) FILTER (WHERE ref_count = 0) AS unreferenced
            FROM vcs_objects
            GROUP BY object_type
            ORDER BY object_type
            "#,
        )
        .fetch_all(&self.pool)
        .await?;

        rows.iter()
            .map(|row| -> Result<ObjectStats> {
                let object_type: String = row.try_get("object_type")?;
                Ok(ObjectStats {
                    object_type: Some(object_type.parse()?),
                    count: row.try_get("count")?,
                    total_size: row.try_get("total_size")?,
                    unreferenced: row.try_get("unreferenced")?,
                })
            })
            .collect()
    }
}

#[async_trait::async_trait]
impl SnapshotStore for PostgresStore {
    async fn insert_snapshot(&self, snapshot: &Snapshot) -> Result<bool> {
        let result = sqlx::query(
            r#"
            INSERT INTO vcs_snapshots (hash, repository_id, building_tree, equipment_tree, spatial_tree,
                                       files_tree, operations_tree, metadata, created_at)
            VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9)
            ON CONFLICT (hash) DO NOTHING
            "#,
        )
        .bind(&snapshot.hash)
        .bind(&snapshot.repository_id)
        .bind(&snapshot.building_tree)
        .bind(&snapshot.equipment_tree)
        .bind(&snapshot.spatial_tree)
        .bind(&snapshot.files_tree)
        .bind(&snapshot.operations_tree)
        .bind(&snapshot.metadata)
        .bind(snapshot.created_at)
        .execute(&self.pool)
        .await?;

        Ok(result.rows_affected() > 0)
    }

    async fn get_snapshot(&self, hash: &str) -> Result<Option<Snapshot>> {
        let query = format!("SELECT {} FROM vcs_snapshots WHERE hash = $1", SNAPSHOT_COLUMNS);
        let row = sqlx::query(&query)
            .bind(hash)
            .fetch_optional(&self.pool)
            .await?;

        row.as_ref().map(snapshot_from_row).transpose()
    }

    async fn get_latest_snapshot(&self, repository_id: &Id) -> Result<Option<Snapshot>> {
        let query = format!(
            "SELECT {} FROM vcs_snapshots WHERE repository_id = $1 ORDER BY created_at DESC LIMIT 1",
            SNAPSHOT_COLUMNS
        );
        let row = sqlx::query(&query)
            .bind(repository_id)
            .fetch_optional(&self.pool)
            .await?;

        row.as_ref().map(snapshot_from_row).transpose()
    }

    async fn list_snapshots(&self, repository_id: &Id) -> Result<Vec<Snapshot>> {
        let query = format!(
            "SELECT {} FROM vcs_snapshots WHERE repository_id = $1 ORDER BY created_at DESC",
            SNAPSHOT_COLUMNS
        );
        let rows = sqlx::query(&query)
            .bind(repository_id)
            .fetch_all(&self.pool)
            .await?;

        rows.iter().map(snapshot_from_row).collect()
    }

    async fn delete_snapshot(&self, hash: &str) -> Result<bool> {
        let result = sqlx::query("DELETE FROM vcs_snapshots WHERE hash = $1")
            .bind(hash)
            .execute(&self.pool)
            .await?;

        Ok(result.rows_affected() > 0)
    }
}

#[async_trait::async_trait]
impl BranchStore for PostgresStore {
    async fn insert_branch(&self, branch: &Branch) -> Result<()> {
        let mut tx = self.pool.begin().await?;

        if branch.is_default {
            sqlx::query(
                "UPDATE vcs_branches SET is_default = FALSE, updated_at = NOW() WHERE repository_id = $1 AND is_default",
            )
            .bind(&branch.repository_id)
            .execute(&mut *tx)
            .await?;
        }

        let inserted = sqlx::query(
            r#"
            INSERT INTO vcs_branches (id, repository_id, name, display_name, description, base_commit,
                                      head_commit, branch_type, protected, requires_review,
                                      auto_delete_on_merge, status, is_default, created_by, owned_by,
                                      created_at, updated_at, merged_at, merged_by)
            VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11, $12, $13, $14, $15, $16, $17, $18, $19)
            "#,
        )
        .bind(&branch.id)
        .bind(&branch.repository_id)
        .bind(&branch.name)
        .bind(&branch.display_name)
        .bind(&branch.description)
        .bind(&branch.base_commit)
        .bind(&branch.head_commit)
        .bind(branch.branch_type.as_str())
        .bind(branch.protected)
        .bind(branch.requires_review)
        .bind(branch.auto_delete_on_merge)
        .bind(branch.status.as_str())
        .bind(branch.is_default)
        .bind(&branch.created_by)
        .bind(&branch.owned_by)
        .bind(branch.created_at)
        .bind(branch.updated_at)
        .bind(branch.merged_at)
        .bind(&branch.merged_by)
        .execute(&mut *tx)
        .await;

        match inserted {
            Ok(_) => {}
            Err(e) if is_unique_violation(&e) => {
                return Err(VcsError::AlreadyExists {
                    kind: "branch",
                    key: branch.name.clone(),
                })
            }
            Err(e) => return Err(e.into()),
        }

        tx.commit().await?;
        Ok(())
    }

    async fn get_branch(&self, id: &Id) -> Result<Option<Branch>> {
        let query = format!("SELECT {} FROM vcs_branches WHERE id = $1", BRANCH_COLUMNS);
        let row = sqlx::query(&query)
            .bind(id)
            .fetch_optional(&self.pool)
            .await?;

        row.as_ref().map(branch_from_row).transpose()
    }

    async fn get_branch_by_name(&self, repository_id: &Id, name: &str) -> Result<Option<Branch>> {
        let query = format!(
            "SELECT {} FROM vcs_branches WHERE repository_id = $1 AND name = $2 AND status <> 'deleted'",
            BRANCH_COLUMNS
        );
        let row = sqlx::query(&query)
            .bind(repository_id)
            .bind(name)
            .fetch_optional(&self.pool)
            .await?;

        row.as_ref().map(branch_from_row).transpose()
    }

    async fn list_branches(&self, repository_id: &Id) -> Result<Vec<Branch>> {
        let query = format!(
            "SELECT {} FROM vcs_branches WHERE repository_id = $1 ORDER BY name, created_at",
            BRANCH_COLUMNS
        );
        let rows = sqlx::query(&query)
            .bind(repository_id)
            .fetch_all(&self.pool)
            .await?;

        rows.iter().map(branch_from_row).collect()
    }

    async fn get_default_branch(&self, repository_id: &Id) -> Result<Option<Branch>> {
        let query = format!(
            "SELECT {} FROM vcs_branches WHERE repository_id = $1 AND is_default",
            BRANCH_COLUMNS
        );
        let row = sqlx::query(&query)
            .bind(repository_id)
            .fetch_optional(&self.pool)
            .await?;

        row.as_ref().map(branch_from_row).transpose()
    }

    async fn set_default_branch(&self, repository_id: &Id, branch_id: &Id) -> Result<bool> {
        let mut tx = self.pool.begin().await?;

        let eligible: bool = sqlx::query_scalar(
            "SELECT EXISTS(SELECT 1 FROM vcs_branches WHERE id = $1 AND repository_id = $2 AND status = 'active')",
        )
        .bind(branch_id)
        .bind(repository_id)
        .fetch_one(&mut *tx)
        .await?;
        if !eligible {
            return Ok(false);
        }

        sqlx::query(
            "UPDATE vcs_branches SET is_default = FALSE, updated_at = NOW() WHERE repository_id = $1 AND is_default AND id <> $2",
        )
        .bind(repository_id)
        .bind(branch_id)
        .execute(&mut *tx)
        .await?;
        sqlx::query("UPDATE vcs_branches SET is_default = TRUE, updated_at = NOW() WHERE id = $1 AND NOT is_default")
            .bind(branch_id)
            .execute(&mut *tx)
            .await?;

        tx.commit().await?;
        Ok(true)
    }

    async fn set_branch_head(&self, branch_id: &Id, head: &Id) -> Result<bool> {
        let result = sqlx::query(
            "UPDATE vcs_branches SET head_commit = $2, updated_at = NOW() WHERE id = $1 AND status = 'active'",
        )
        .bind(branch_id)
        .bind(head)
        .execute(&self.pool)
        .await?;

        Ok(result.rows_affected() > 0)
    }

    async fn compare_and_set_branch_head(
        &self,
        branch_id: &Id,
        expected: Option<&Id>,
        head: &Id,
    ) -> Result<bool> {
        let result = sqlx::query(
            r#"
            UPDATE vcs_branches SET head_commit = $2, updated_at = NOW()
            WHERE id = $1 AND status = 'active' AND head_commit IS NOT DISTINCT FROM $3
            "#,
        )
        .bind(branch_id)
        .bind(head)
        .bind(expected)
        .execute(&self.pool)
        .await?;

        Ok(result.rows_affected() > 0)
    }

    async fn update_branch_state(&self, branch: &Branch) -> Result<()> {
        let result = sqlx::query(
            r#"
            UPDATE vcs_branches
            SET status = $2, is_default = $3, merged_at = $4, merged_by = $5, updated_at = $6
            WHERE id = $1
            "#,
        )
        .bind(&branch.id)
        .bind(branch.status.as_str())
        .bind(branch.is_default)
        .bind(branch.merged_at)
        .bind(&branch.merged_by)
        .bind(branch.updated_at)
        .execute(&self.pool)
        .await?;

        if result.rows_affected() == 0 {
            return Err(VcsError::not_found("branch", branch.id.clone()));
        }
        Ok(())
    }
}

#[async_trait::async_trait]
impl CommitStore for PostgresStore {
    async fn insert_commit(&self, commit: &Commit) -> Result<()> {
        let inserted = sqlx::query(
            r#"
            INSERT INTO vcs_commits (id, repository_id, branch_id, version_id, commit_hash, short_hash,
                                     message, author_name, author_email, author_id, parent_commits,
                                     merge_commit, changes_summary, files_changed, lines_added,
                                     lines_deleted, tags, metadata, committed_at)
            VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11, $12, $13, $14, $15, $16, $17, $18, $19)
            "#,
        )
        .bind(&commit.id)
        .bind(&commit.repository_id)
        .bind(&commit.branch_id)
        .bind(&commit.version_id)
        .bind(&commit.commit_hash)
        .bind(&commit.short_hash)
        .bind(&commit.message)
        .bind(&commit.author_name)
        .bind(&commit.author_email)
        .bind(&commit.author_id)
        .bind(&commit.parent_commits)
        .bind(commit.merge_commit)
        .bind(serde_json::to_value(&commit.changes_summary)?)
        .bind(commit.files_changed)
        .bind(commit.lines_added)
        .bind(commit.lines_deleted)
        .bind(&commit.tags)
        .bind(&commit.metadata)
        .bind(commit.committed_at)
        .execute(&self.pool)
        .await;

        match inserted {
            Ok(_) => Ok(()),
            Err(e) if is_unique_violation(&e) => Err(VcsError::AlreadyExists {
                kind: "commit",
                key: commit.id.clone(),
            }),
            Err(e) => Err(e.into()),
        }
    }

    async fn get_commit(&self, id: &Id) -> Result<Option<Commit>> {
        let query = format!("SELECT {} FROM vcs_commits WHERE id = $1", COMMIT_COLUMNS);
        let row = sqlx::query(&query)
            .bind(id)
            .fetch_optional(&self.pool)
            .await?;

        row.as_ref().map(commit_from_row).transpose()
    }

    async fn get_commits(&self, ids: &[Id]) -> Result<Vec<Commit>> {
        if ids.is_empty() {
            return Ok(Vec::new());
        }
        let query = format!("SELECT {} FROM vcs_commits WHERE id = ANY($1)", COMMIT_COLUMNS);
        let rows = sqlx::query(&query)
            .bind(ids)
            .fetch_all(&self.pool)
            .await?;

        rows.iter().map(commit_from_row).collect()
    }

    async fn find_commits_by_hash_prefix(&self, repository_id: &Id, prefix: &str) -> Result<Vec<Commit>> {
        let query = format!(
            "SELECT {} FROM vcs_commits WHERE repository_id = $1 AND commit_hash LIKE $2 || '%' LIMIT 2",
            COMMIT_COLUMNS
        );
        let rows = sqlx::query(&query)
            .bind(repository_id)
            .bind(prefix)
            .fetch_all(&self.pool)
            .await?;

        rows.iter().map(commit_from_row).collect()
    }

    async fn get_child_commits(&self, id: &Id) -> Result<Vec<Commit>> {
        let query = format!(
            "SELECT {} FROM vcs_commits WHERE $1 = ANY(parent_commits) ORDER BY seq",
            COMMIT_COLUMNS
        );
        let rows = sqlx::query(&query)
            .bind(id)
            .fetch_all(&self.pool)
            .await?;

        rows.iter().map(commit_from_row).collect()
    }

    async fn list_commits(&self, repository_id: &Id, limit: i64, offset: i64) -> Result<Vec<Commit>> {
        let query = format!(
            "SELECT {} FROM vcs_commits WHERE repository_id = $1 ORDER BY seq DESC LIMIT $2 OFFSET $3",
            COMMIT_COLUMNS
        );
        let rows = sqlx::query(&query)
            .bind(repository_id)
            .bind(limit)
            .bind(offset)
            .fetch_all(&self.pool)
            .await?;

        rows.iter().map(commit_from_row).collect()
    }

    async fn list_branch_commits(&self, branch_id: &Id, limit: i64) -> Result<Vec<Commit>> {
        let query = format!(
            "SELECT {} FROM vcs_commits WHERE branch_id = $1 ORDER BY seq DESC LIMIT $2",
            COMMIT_COLUMNS
        );
        let rows = sqlx::query(&query)
            .bind(branch_id)
            .bind(limit)
            .fetch_all(&self.pool)
            .await?;

        rows.iter().map(commit_from_row).collect()
    }

    async fn count_commits(&self, repository_id: &Id) -> Result<i64> {
        let count: i64 = sqlx::query_scalar("SELECT COUNT(*) FROM vcs_commits WHERE repository_id = $1")
            .bind(repository_id)
            .fetch_one(&self.pool)
            .await?;
        Ok(count)
    }
}

#[async_trait::async_trait]
impl ChangeStore for PostgresStore {
    async fn append_change(&self, change: &Change) -> Result<()> {
        // The guard and the insert are one statement so concurrent writers
        // cannot both pass the version check.
        let result = sqlx::query(
            r#"
            INSERT INTO vcs_changes (id, change_type, entity, entity_id, timestamp, data, version)
            SELECT $1, $2, $3, $4, $5, $6, $7
            WHERE NOT EXISTS (
                SELECT 1 FROM vcs_changes WHERE entity = $3 AND entity_id = $4 AND version >= $7
            )
            "#,
        )
        .bind(&change.id)
        .bind(change.change_type.as_str())
        .bind(change.entity.as_str())
        .bind(&change.entity_id)
        .bind(change.timestamp)
        .bind(serde_json::Value::Object(change.data.clone()))
        .bind(change.version)
        .execute(&self.pool)
        .await;

        let rejected = match result {
            Ok(done) => done.rows_affected() == 0,
            Err(e) if is_unique_violation(&e) => true,
            Err(e) => return Err(e.into()),
        };
        if rejected {
            let latest = self
                .latest_version(Some(change.entity), &change.entity_id)
                .await?
                .unwrap_or(0);
            return Err(VcsError::StaleVersion {
                entity_id: change.entity_id.clone(),
                latest,
                attempted: change.version,
            });
        }
        Ok(())
    }

    async fn changes_since(&self, since: DateTime<Utc>, entity: Option<EntityKind>) -> Result<Vec<Change>> {
        let query = format!(
            "SELECT {} FROM vcs_changes WHERE timestamp > $1 AND ($2::TEXT IS NULL OR entity = $2) ORDER BY seq",
            CHANGE_COLUMNS
        );
        let rows = sqlx::query(&query)
            .bind(since)
            .bind(entity.map(|kind| kind.as_str()))
            .fetch_all(&self.pool)
            .await?;

        rows.iter().map(change_from_row).collect()
    }

    async fn entity_changes(&self, entity_id: &Id) -> Result<Vec<Change>> {
        let query = format!(
            "SELECT {} FROM vcs_changes WHERE entity_id = $1 ORDER BY seq",
            CHANGE_COLUMNS
        );
        let rows = sqlx::query(&query)
            .bind(entity_id)
            .fetch_all(&self.pool)
            .await?;

        rows.iter().map(change_from_row).collect()
    }

    async fn latest_version(&self, entity: Option<EntityKind>, entity_id: &Id) -> Result<Option<i64>> {
        let version: Option<i64> = sqlx::query_scalar(
            "SELECT MAX(version) FROM vcs_changes WHERE entity_id = $1 AND ($2::TEXT IS NULL OR entity = $2)",
        )
        .bind(entity_id)
        .bind(entity.map(|kind| kind.as_str()))
        .fetch_one(&self.pool)
        .await?;
        Ok(version)
    }

    async fn prune_changes(&self, before: DateTime<Utc>) -> Result<u64> {
        let result = sqlx::query("DELETE FROM vcs_changes WHERE timestamp < $1")
            .bind(before)
            .execute(&self.pool)
            .await?;
        Ok(result.rows_affected())
    }
}

#[async_trait::async_trait]
impl ConflictStore for PostgresStore {
    async fn insert_conflict(&self, conflict: &Conflict) -> Result<()> {
        sqlx::query(
            r#"
            INSERT INTO vcs_conflicts (id, entity, entity_id, conflict_type, local_data, remote_data,
                                       local_change, remote_change, status, detected_at)
            VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10)
            "#,
        )
        .bind(&conflict.id)
        .bind(conflict.entity.as_str())
        .bind(&conflict.entity_id)
        .bind(conflict.conflict_type.as_str())
        .bind(serde_json::Value::Object(conflict.local_data.clone()))
        .bind(serde_json::Value::Object(conflict.remote_data.clone()))
        .bind(serde_json::to_value(&conflict.local_change)?)
        .bind(serde_json::to_value(&conflict.remote_change)?)
        .bind(conflict.status.as_str())
        .bind(conflict.detected_at)
        .execute(&self.pool)
        .await?;

        Ok(())
    }

    async fn get_conflict(&self, id: &Id) -> Result<Option<Conflict>> {
        let query = format!("SELECT {} FROM vcs_conflicts WHERE id = $1", CONFLICT_COLUMNS);
        let row = sqlx::query(&query)
            .bind(id)
            .fetch_optional(&self.pool)
            .await?;

        row.as_ref().map(conflict_from_row).transpose()
    }

    async fn list_conflicts(&self, status: Option<ConflictStatus>) -> Result<Vec<Conflict>> {
        let query = format!(
            "SELECT {} FROM vcs_conflicts WHERE ($1::TEXT IS NULL OR status = $1) ORDER BY detected_at, id",
            CONFLICT_COLUMNS
        );
        let rows = sqlx::query(&query)
            .bind(status.map(|s| s.as_str()))
            .fetch_all(&self.pool)
            .await?;

        rows.iter().map(conflict_from_row).collect()
    }

    async fn record_resolution(&self, resolution: &ConflictResolution, status: ConflictStatus) -> Result<()> {
        let mut tx = self.pool.begin().await?;

        let updated = sqlx::query("UPDATE vcs_conflicts SET status = $2 WHERE id = $1")
            .bind(&resolution.conflict_id)
            .bind(status.as_str())
            .execute(&mut *tx)
            .await?;
        if updated.rows_affected() == 0 {
            return Err(VcsError::not_found("conflict", resolution.conflict_id.clone()));
        }

        sqlx::query(
            r#"
            INSERT INTO vcs_conflict_resolutions (id, conflict_id, resolution, resolved_by, resolved_at, notes)
            VALUES ($1, $2, $3, $4, $5, $6)
            "#,
        )
        .bind(&resolution.id)
        .bind(&resolution.conflict_id)
        .bind(resolution.resolution.as_str())
        .bind(&resolution.resolved_by)
        .bind(resolution.resolved_at)
        .bind(&resolution.notes)
        .execute(&mut *tx)
        .await?;

        tx.commit().await?;
        Ok(())
    }

    async fn list_resolutions(&self, conflict_id: &Id) -> Result<Vec<ConflictResolution>> {
        let rows = sqlx::query(
            "SELECT id, conflict_id, resolution, resolved_by, resolved_at, notes \
             FROM vcs_conflict_resolutions WHERE conflict_id = $1 ORDER BY resolved_at",
        )
        .bind(conflict_id)
        .fetch_all(&self.pool)
        .await?;

        rows.iter().map(resolution_from_row).collect()
    }
}

impl Store for PostgresStore {}
