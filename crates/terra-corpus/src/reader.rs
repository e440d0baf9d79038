use std::path::{Path, PathBuf};
use std::sync::Arc;

use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use rusqlite::Connection;
use tracing::instrument;

use terra_core::corpus::{StoryPost, Thread};

#[derive(Debug, thiserror::Error)]
pub enum CorpusError {
    #[error("corpus database error: {0}")]
    Database(#[from] rusqlite::Error),

    #[error("corpus not found at {0}")]
    Missing(PathBuf),
}

const POST_COLUMNS: &str = "p.id, p.thread_id, p.body, p.name, p.time";

/// Read-only access to the corpus database. Concurrency-safe for readers;
/// traversal order is (thread_id ASC, post_id ASC).
#[derive(Debug)]
pub struct CorpusReader {
    conn: Arc<Mutex<Connection>>,
}

impl CorpusReader {
    pub fn open(path: &Path) -> Result<Self, CorpusError> {
        if !path.exists() {
            return Err(CorpusError::Missing(path.to_owned()));
        }
        let conn = Connection::open_with_flags(
            path,
            rusqlite::OpenFlags::SQLITE_OPEN_READ_ONLY | rusqlite::OpenFlags::SQLITE_OPEN_NO_MUTEX,
        )?;
        Ok(Self {
            conn: Arc::new(Mutex::new(conn)),
        })
    }

    /// Fetch a single post with its tags.
    pub fn get_post(&self, post_id: i64) -> Result<Option<StoryPost>, CorpusError> {
        let conn = self.conn.lock();
        let mut stmt = conn.prepare(&format!("SELECT {POST_COLUMNS} FROM post p WHERE p.id = ?1"))?;
        let mut rows = stmt.query([post_id])?;
        match rows.next()? {
            Some(row) => {
                let mut post = row_to_post(row)?;
                post.tags = get_tags(&conn, post.post_id)?;
                Ok(Some(post))
            }
            None => Ok(None),
        }
    }

    pub fn get_thread(&self, thread_id: i64) -> Result<Option<Thread>, CorpusError> {
        let conn = self.conn.lock();
        let mut stmt = conn.prepare("SELECT id, title FROM thread WHERE id = ?1")?;
        let mut rows = stmt.query([thread_id])?;
        match rows.next()? {
            Some(row) => Ok(Some(Thread {
                id: row.get(0)?,
                title: row.get(1)?,
            })),
            None => Ok(None),
        }
    }

    /// Posts in a thread between optional bounds, optionally tag-filtered.
    #[instrument(skip(self), fields(thread_id))]
    pub fn get_posts_range(
        &self,
        thread_id: i64,
        start_post_id: Option<i64>,
        end_post_id: Option<i64>,
        tag_filter: Option<&str>,
    ) -> Result<Vec<StoryPost>, CorpusError> {
        let conn = self.conn.lock();
        let mut conditions = vec!["p.thread_id = ?1".to_string()];
        let mut params: Vec<Box<dyn rusqlite::types::ToSql>> = vec![Box::new(thread_id)];

        if let Some(start) = start_post_id {
            conditions.push(format!("p.id >= ?{}", params.len() + 1));
            params.push(Box::new(start));
        }
        if let Some(end) = end_post_id {
            conditions.push(format!("p.id <= ?{}", params.len() + 1));
            params.push(Box::new(end));
        }
        if let Some(tag) = tag_filter {
            conditions.push(format!(
                "p.id IN (SELECT post_id FROM tag WHERE name = ?{})",
                params.len() + 1
            ));
            params.push(Box::new(tag.to_string()));
        }

        let sql = format!(
            "SELECT {POST_COLUMNS} FROM post p WHERE {} ORDER BY p.id",
            conditions.join(" AND ")
        );
        let param_refs: Vec<&dyn rusqlite::types::ToSql> = params.iter().map(|p| p.as_ref()).collect();
        let mut stmt = conn.prepare(&sql)?;
        let mut rows = stmt.query(param_refs.as_slice())?;
        collect_posts(&conn, &mut rows)
    }

    /// The post plus up to `before`/`after` neighbors from the same thread,
    /// in post-id order.
    pub fn get_adjacent_posts(
        &self,
        post_id: i64,
        before: usize,
        after: usize,
    ) -> Result<Vec<StoryPost>, CorpusError> {
        let target = match self.get_post(post_id)? {
            Some(p) => p,
            None => return Ok(Vec::new()),
        };

        let conn = self.conn.lock();
        let mut posts = Vec::new();

        let mut stmt = conn.prepare(&format!(
            "SELECT {POST_COLUMNS} FROM post p
             WHERE p.thread_id = ?1 AND p.id < ?2
             ORDER BY p.id DESC LIMIT ?3"
        ))?;
        let mut rows = stmt.query(rusqlite::params![target.thread_id, post_id, before as i64])?;
        let mut preceding = collect_posts(&conn, &mut rows)?;
        preceding.reverse();
        posts.extend(preceding);

        posts.push(target.clone());

        let mut stmt = conn.prepare(&format!(
            "SELECT {POST_COLUMNS} FROM post p
             WHERE p.thread_id = ?1 AND p.id > ?2
             ORDER BY p.id LIMIT ?3"
        ))?;
        let mut rows = stmt.query(rusqlite::params![target.thread_id, post_id, after as i64])?;
        posts.extend(collect_posts(&conn, &mut rows)?);

        Ok(posts)
    }

    /// Fetch the next page of posts after the given (thread, post) cursor.
    /// The batcher drives this to stream the whole corpus without holding a
    /// statement open.
    pub fn next_page(
        &self,
        cursor: Option<(i64, i64)>,
        page_size: usize,
    ) -> Result<Vec<StoryPost>, CorpusError> {
        let conn = self.conn.lock();
        let (sql, params): (String, Vec<Box<dyn rusqlite::types::ToSql>>) = match cursor {
            Some((thread_id, post_id)) => (
                format!(
                    "SELECT {POST_COLUMNS} FROM post p
                     WHERE (p.thread_id, p.id) > (?1, ?2)
                     ORDER BY p.thread_id, p.id LIMIT ?3"
                ),
                vec![Box::new(thread_id), Box::new(post_id), Box::new(page_size as i64)],
            ),
            None => (
                format!(
                    "SELECT {POST_COLUMNS} FROM post p
                     ORDER BY p.thread_id, p.id LIMIT ?1"
                ),
                vec![Box::new(page_size as i64)],
            ),
        };
        let param_refs: Vec<&dyn rusqlite::types::ToSql> = params.iter().map(|p| p.as_ref()).collect();
        let mut stmt = conn.prepare(&sql)?;
        let mut rows = stmt.query(param_refs.as_slice())?;
        collect_posts(&conn, &mut rows)
    }

    /// Locate the traversal cursor for a post id, for resumption. Falls
    /// back to treating the id as already consumed in an unknown thread.
    pub fn cursor_for_post(&self, post_id: i64) -> Result<Option<(i64, i64)>, CorpusError> {
        Ok(self
            .get_post(post_id)?
            .map(|p| (p.thread_id, p.post_id)))
    }
}

fn collect_posts(
    conn: &Connection,
    rows: &mut rusqlite::Rows<'_>,
) -> Result<Vec<StoryPost>, CorpusError> {
    let mut bare = Vec::new();
    while let Some(row) = rows.next()? {
        bare.push(row_to_post(row)?);
    }
    let mut posts = Vec::with_capacity(bare.len());
    for mut post in bare {
        post.tags = get_tags(conn, post.post_id)?;
        posts.push(post);
    }
    Ok(posts)
}

fn row_to_post(row: &rusqlite::Row<'_>) -> Result<StoryPost, CorpusError> {
    let time: Option<i64> = row.get(4)?;
    Ok(StoryPost {
        post_id: row.get(0)?,
        thread_id: row.get(1)?,
        body: row.get::<_, Option<String>>(2)?.unwrap_or_default(),
        author: row.get(3)?,
        created_at: time.and_then(format_unix_timestamp),
        tags: Vec::new(),
    })
}

fn format_unix_timestamp(value: i64) -> Option<String> {
    DateTime::<Utc>::from_timestamp(value, 0)
        .map(|dt| dt.to_rfc3339_opts(chrono::SecondsFormat::Secs, true))
}

fn get_tags(conn: &Connection, post_id: i64) -> Result<Vec<String>, CorpusError> {
    let mut stmt = conn.prepare("SELECT name FROM tag WHERE post_id = ?1 ORDER BY name")?;
    let rows = stmt.query_map([post_id], |row| row.get(0))?;
    Ok(rows.collect::<Result<_, _>>()?)
}

#[cfg(test)]
pub(crate) mod fixtures {
    use std::path::Path;

    use rusqlite::Connection;

    /// Minimal corpus schema matching the production database.
    pub fn create_corpus(path: &Path) -> Connection {
        let conn = Connection::open(path).unwrap();
        conn.execute_batch(
            "CREATE TABLE thread (id INTEGER PRIMARY KEY, title TEXT);
             CREATE TABLE post (
                 thread_id INTEGER NOT NULL,
                 id INTEGER PRIMARY KEY,
                 name TEXT, trip_code TEXT, subject TEXT,
                 time INTEGER, file_url TEXT, file_name TEXT,
                 body TEXT
             );
             CREATE TABLE tag (post_id INTEGER NOT NULL, name TEXT NOT NULL);
             CREATE TABLE link (link_from INTEGER, link_to INTEGER);",
        )
        .unwrap();
        conn
    }

    pub fn insert_post(
        conn: &Connection,
        thread_id: i64,
        post_id: i64,
        body: &str,
        tags: &[&str],
    ) {
        conn.execute(
            "INSERT OR IGNORE INTO thread (id, title) VALUES (?1, ?2)",
            rusqlite::params![thread_id, format!("Thread {thread_id}")],
        )
        .unwrap();
        conn.execute(
            "INSERT INTO post (thread_id, id, name, time, body) VALUES (?1, ?2, 'QM', ?3, ?4)",
            rusqlite::params![thread_id, post_id, 1_500_000_000 + post_id, body],
        )
        .unwrap();
        for tag in tags {
            conn.execute(
                "INSERT INTO tag (post_id, name) VALUES (?1, ?2)",
                rusqlite::params![post_id, tag],
            )
            .unwrap();
        }
    }
}
