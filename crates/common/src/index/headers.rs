use std::path::PathBuf;

use chrono::{DateTime, Utc};
use sqlx::{sqlite::SqliteRow, QueryBuilder, Row, Sqlite};

use crate::crypto::PublicKey;
use crate::safe::Header;

use super::{Index, Result};

const HEADER_COLUMNS: &str = "header, deleted, cached_path, cached_expires, downloads";

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum OrderBy {
    #[default]
    Name,
    ModTime,
}

/// Filters for [`Index::list_headers`].
#[derive(Debug, Clone, Default)]
pub struct ListOptions {
    /// Exact file name
    pub name: Option<String>,
    /// Folder to list, `""` for the root
    pub dir: Option<String>,
    /// Levels below `dir` to include, direct children only when unset
    pub depth: Option<u32>,
    /// Prefix of the last path segment
    pub prefix: Option<String>,
    /// Suffix of the last path segment
    pub suffix: Option<String>,
    pub content_type: Option<String>,
    pub file_id: Option<u64>,
    /// Every tag must be present
    pub tags: Vec<String>,
    pub creator: Option<PublicKey>,
    pub before: Option<DateTime<Utc>>,
    pub after: Option<DateTime<Utc>>,
    pub offset: u32,
    /// Zero means no limit
    pub limit: u32,
    pub order_by: OrderBy,
    pub reverse: bool,
    pub include_deleted: bool,
    /// Skip the store sync before querying
    pub no_sync: bool,
}

/// A header located anywhere in a quota group.
#[derive(Debug, Clone)]
pub struct GroupEntry {
    pub safe: String,
    pub zone: String,
    pub header: Header,
}

/// A cache file recorded in the index.
#[derive(Debug, Clone)]
pub struct CachedEntry {
    pub zone: String,
    pub file_id: u64,
    pub path: PathBuf,
    pub size: u64,
}

fn nanos(time: &DateTime<Utc>) -> i64 {
    time.timestamp_nanos_opt().unwrap_or(i64::MAX)
}

fn split_name(name: &str) -> (String, String, i64) {
    match name.rsplit_once('/') {
        Some((dir, base)) => (
            dir.to_string(),
            base.to_string(),
            name.matches('/').count() as i64,
        ),
        None => (String::new(), name.to_string(), 0),
    }
}

fn tags_column(tags: &[String]) -> String {
    if tags.is_empty() {
        return String::new();
    }
    format!(" {} ", tags.join(" "))
}

fn header_from_row(row: &SqliteRow) -> Result<Header> {
    let json: String = row.try_get("header")?;
    let mut header: Header = serde_json::from_str(&json)?;
    header.deleted = row.try_get("deleted")?;
    header.cached = row
        .try_get::<Option<String>, _>("cached_path")?
        .map(PathBuf::from);
    header.cached_expires = row
        .try_get::<Option<i64>, _>("cached_expires")?
        .map(DateTime::from_timestamp_nanos);
    let downloads: String = row.try_get("downloads")?;
    header.downloads = serde_json::from_str(&downloads)?;
    Ok(header)
}

impl Index {
    /// Insert or refresh a header.
    ///
    /// A tombstone is never replaced by a live copy of the same file, and the
    /// local cache columns of an existing row are kept.
    pub async fn upsert_header(
        &self,
        safe: &str,
        zone: &str,
        header: &Header,
        quota_group: &str,
    ) -> Result<()> {
        let (dir, base, depth) = split_name(&header.name);
        sqlx::query(
            r#"
            INSERT INTO headers (
                safe, zone, file_id, name, dir, base, depth, bucket, mod_time, size,
                creator, content_type, tags, deleted, quota_group, header
            )
            VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?)
            ON CONFLICT(safe, zone, file_id) DO UPDATE SET
                name = excluded.name,
                dir = excluded.dir,
                base = excluded.base,
                depth = excluded.depth,
                bucket = excluded.bucket,
                mod_time = excluded.mod_time,
                size = excluded.size,
                creator = excluded.creator,
                content_type = excluded.content_type,
                tags = excluded.tags,
                deleted = excluded.deleted,
                quota_group = excluded.quota_group,
                header = excluded.header
            WHERE headers.deleted = 0 OR excluded.deleted = 1
            "#,
        )
        .bind(safe)
        .bind(zone)
        .bind(header.file_id as i64)
        .bind(&header.name)
        .bind(dir)
        .bind(base)
        .bind(depth)
        .bind(&header.bucket)
        .bind(nanos(&header.mod_time))
        .bind(header.size as i64)
        .bind(header.creator.to_hex())
        .bind(&header.attributes.content_type)
        .bind(tags_column(&header.attributes.tags))
        .bind(header.deleted)
        .bind(quota_group)
        .bind(serde_json::to_string(header)?)
        .execute(self.pool())
        .await?;
        Ok(())
    }

    /// Latest live version of `name`.
    pub async fn header_by_name(&self, safe: &str, zone: &str, name: &str) -> Result<Option<Header>> {
        let row = sqlx::query(&format!(
            r#"
            SELECT {HEADER_COLUMNS} FROM headers
            WHERE safe = ? AND zone = ? AND name = ? AND deleted = 0
            ORDER BY mod_time DESC, file_id DESC
            LIMIT 1
            "#
        ))
        .bind(safe)
        .bind(zone)
        .bind(name)
        .fetch_optional(self.pool())
        .await?;
        row.as_ref().map(header_from_row).transpose()
    }

    /// The header of `file_id`, deleted or not.
    pub async fn header_by_id(&self, safe: &str, zone: &str, file_id: u64) -> Result<Option<Header>> {
        let row = sqlx::query(&format!(
            "SELECT {HEADER_COLUMNS} FROM headers WHERE safe = ? AND zone = ? AND file_id = ?"
        ))
        .bind(safe)
        .bind(zone)
        .bind(file_id as i64)
        .fetch_optional(self.pool())
        .await?;
        row.as_ref().map(header_from_row).transpose()
    }

    pub async fn list_headers(
        &self,
        safe: &str,
        zone: &str,
        options: &ListOptions,
    ) -> Result<Vec<Header>> {
        let mut query: QueryBuilder<Sqlite> =
            QueryBuilder::new(format!("SELECT {HEADER_COLUMNS} FROM headers WHERE safe = "));
        query.push_bind(safe);
        query.push(" AND zone = ").push_bind(zone);

        if !options.include_deleted {
            query.push(" AND deleted = 0");
        }
        if let Some(name) = &options.name {
            query.push(" AND name = ").push_bind(name.clone());
        }
        if let Some(dir) = &options.dir {
            let dir = dir.trim_matches('/').to_string();
            match options.depth {
                None => {
                    query.push(" AND dir = ").push_bind(dir);
                }
                Some(depth) if dir.is_empty() => {
                    query.push(" AND depth <= ").push_bind(depth as i64);
                }
                Some(depth) => {
                    let base_depth = dir.matches('/').count() as i64 + 1;
                    let sub = format!("{dir}/");
                    query.push(" AND (dir = ").push_bind(dir);
                    query.push(" OR substr(dir, 1, length(").push_bind(sub.clone());
                    query.push(")) = ").push_bind(sub);
                    query
                        .push(") AND depth <= ")
                        .push_bind(base_depth + depth as i64);
                }
            }
        }
        // lengths are measured by SQLite, which counts characters
        if let Some(prefix) = &options.prefix {
            query.push(" AND substr(base, 1, length(").push_bind(prefix.clone());
            query.push(")) = ").push_bind(prefix.clone());
        }
        if let Some(suffix) = &options.suffix {
            query.push(" AND substr(base, -length(").push_bind(suffix.clone());
            query.push(")) = ").push_bind(suffix.clone());
        }
        if let Some(content_type) = &options.content_type {
            query.push(" AND content_type = ").push_bind(content_type.clone());
        }
        if let Some(file_id) = options.file_id {
            query.push(" AND file_id = ").push_bind(file_id as i64);
        }
        for tag in &options.tags {
            query
                .push(" AND instr(tags, ")
                .push_bind(format!(" {tag} "))
                .push(") > 0");
        }
        if let Some(creator) = &options.creator {
            query.push(" AND creator = ").push_bind(creator.to_hex());
        }
        if let Some(before) = &options.before {
            query.push(" AND mod_time < ").push_bind(nanos(before));
        }
        if let Some(after) = &options.after {
            query.push(" AND mod_time > ").push_bind(nanos(after));
        }

        let direction = if options.reverse { "DESC" } else { "ASC" };
        match options.order_by {
            OrderBy::Name => query.push(format!(
                " ORDER BY name {direction}, mod_time {direction}, file_id {direction}"
            )),
            OrderBy::ModTime => query.push(format!(
                " ORDER BY mod_time {direction}, file_id {direction}"
            )),
        };

        if options.limit > 0 {
            query.push(" LIMIT ").push_bind(options.limit as i64);
        } else if options.offset > 0 {
            query.push(" LIMIT -1");
        }
        if options.offset > 0 {
            query.push(" OFFSET ").push_bind(options.offset as i64);
        }

        let rows = query.build().fetch_all(self.pool()).await?;
        rows.iter().map(header_from_row).collect()
    }

    /// Immediate sub folders of `dir` holding live files.
    pub async fn list_dirs(&self, safe: &str, zone: &str, dir: &str) -> Result<Vec<String>> {
        let dir = dir.trim_matches('/');
        let rows = sqlx::query(
            "SELECT DISTINCT dir FROM headers WHERE safe = ? AND zone = ? AND deleted = 0 AND dir != ''",
        )
        .bind(safe)
        .bind(zone)
        .fetch_all(self.pool())
        .await?;

        let mut dirs: Vec<String> = rows
            .iter()
            .filter_map(|row| {
                let path: String = row.get("dir");
                let rest = if dir.is_empty() {
                    Some(path.as_str())
                } else {
                    path.strip_prefix(dir).and_then(|r| r.strip_prefix('/'))
                };
                rest.and_then(|r| r.split('/').next())
                    .filter(|s| !s.is_empty())
                    .map(str::to_string)
            })
            .collect();
        dirs.sort();
        dirs.dedup();
        Ok(dirs)
    }

    /// Apply `update` to the stored header of `file_id` inside a transaction.
    ///
    /// Only the local bookkeeping (`cached`, `cached_expires`, `downloads`) and
    /// the `deleted` flag are written back. Returns the updated header, or
    /// `None` when the file is unknown.
    pub async fn update_header<F>(
        &self,
        safe: &str,
        zone: &str,
        file_id: u64,
        update: F,
    ) -> Result<Option<Header>>
    where
        F: FnOnce(&mut Header),
    {
        let mut tx = self.pool().begin().await?;
        let row = sqlx::query(&format!(
            "SELECT {HEADER_COLUMNS} FROM headers WHERE safe = ? AND zone = ? AND file_id = ?"
        ))
        .bind(safe)
        .bind(zone)
        .bind(file_id as i64)
        .fetch_optional(&mut *tx)
        .await?;

        let Some(row) = row else {
            return Ok(None);
        };
        let mut header = header_from_row(&row)?;
        update(&mut header);

        sqlx::query(
            r#"
            UPDATE headers SET
                deleted = ?,
                cached_path = ?,
                cached_expires = ?,
                downloads = ?
            WHERE safe = ? AND zone = ? AND file_id = ?
            "#,
        )
        .bind(header.deleted)
        .bind(
            header
                .cached
                .as_ref()
                .map(|p| p.to_string_lossy().to_string()),
        )
        .bind(header.cached_expires.as_ref().map(nanos))
        .bind(serde_json::to_string(&header.downloads)?)
        .bind(safe)
        .bind(zone)
        .bind(file_id as i64)
        .execute(&mut *tx)
        .await?;
        tx.commit().await?;

        Ok(Some(header))
    }

    /// Total size of live files in a quota group.
    pub async fn quota_group_size(&self, quota_group: &str) -> Result<u64> {
        let row = sqlx::query(
            "SELECT COALESCE(SUM(size), 0) AS total FROM headers WHERE quota_group = ? AND deleted = 0",
        )
        .bind(quota_group)
        .fetch_one(self.pool())
        .await?;
        let total: i64 = row.get("total");
        Ok(total.max(0) as u64)
    }

    /// Oldest live file of a quota group by modification time.
    pub async fn oldest_in_group(&self, quota_group: &str) -> Result<Option<GroupEntry>> {
        let row = sqlx::query(&format!(
            r#"
            SELECT safe, zone, {HEADER_COLUMNS} FROM headers
            WHERE quota_group = ? AND deleted = 0
            ORDER BY mod_time ASC, file_id ASC
            LIMIT 1
            "#
        ))
        .bind(quota_group)
        .fetch_optional(self.pool())
        .await?;

        row.map(|r| {
            Ok(GroupEntry {
                safe: r.try_get("safe")?,
                zone: r.try_get("zone")?,
                header: header_from_row(&r)?,
            })
        })
        .transpose()
    }

    /// Cache entry of `safe` with the earliest expiry.
    pub async fn oldest_cached(&self, safe: &str) -> Result<Option<CachedEntry>> {
        let row = sqlx::query(
            r#"
            SELECT zone, file_id, cached_path, size FROM headers
            WHERE safe = ? AND cached_path IS NOT NULL
            ORDER BY cached_expires ASC, file_id ASC
            LIMIT 1
            "#,
        )
        .bind(safe)
        .fetch_optional(self.pool())
        .await?;

        row.map(|r| {
            Ok(CachedEntry {
                zone: r.try_get("zone")?,
                file_id: r.try_get::<i64, _>("file_id")? as u64,
                path: PathBuf::from(r.try_get::<String, _>("cached_path")?),
                size: r.try_get::<i64, _>("size")?.max(0) as u64,
            })
        })
        .transpose()
    }

    /// Bytes held by cache files of `safe`.
    pub async fn cached_size(&self, safe: &str) -> Result<u64> {
        let row = sqlx::query(
            "SELECT COALESCE(SUM(size), 0) AS total FROM headers WHERE safe = ? AND cached_path IS NOT NULL",
        )
        .bind(safe)
        .fetch_one(self.pool())
        .await?;
        let total: i64 = row.get("total");
        Ok(total.max(0) as u64)
    }
}
