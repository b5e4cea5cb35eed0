// SQLite implementation of the EmbeddingStore trait.
//
// Vectors are stored as JSON text. Similarity search happens in the core over
// the full list, so the database never needs to understand them.

use crate::core::assistant::{Embedding, EmbeddingStore, StoreError};
use async_trait::async_trait;
use sqlx::sqlite::{SqlitePool, SqlitePoolOptions, SqliteRow};
use sqlx::Row;

pub struct SqliteEmbeddingStore {
    pool: SqlitePool,
}

fn db_error(err: sqlx::Error) -> StoreError {
    StoreError::Database(err.to_string())
}

impl SqliteEmbeddingStore {
    /// Opens (creating if needed) the database at `database_url`.
    pub async fn new(database_url: &str) -> anyhow::Result<Self> {
        let pool = SqlitePoolOptions::new()
            .max_connections(5)
            .connect(database_url)
            .await?;

        let store = Self { pool };
        store.migrate().await?;
        Ok(store)
    }

    async fn migrate(&self) -> anyhow::Result<()> {
        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS embeddings (
                guild_id INTEGER NOT NULL,
                name TEXT NOT NULL,
                text TEXT NOT NULL,
                vector TEXT NOT NULL,
                ai_created BOOLEAN NOT NULL DEFAULT 0,
                created_at INTEGER NOT NULL,
                modified_at INTEGER NOT NULL,
                PRIMARY KEY (guild_id, name)
            )
            "#,
        )
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    fn row_to_embedding(row: &SqliteRow) -> Result<Embedding, StoreError> {
        let vector: String = row.get("vector");
        Ok(Embedding {
            name: row.get("name"),
            text: row.get("text"),
            vector: serde_json::from_str(&vector)?,
            ai_created: row.get("ai_created"),
            created_at: row.get("created_at"),
            modified_at: row.get("modified_at"),
        })
    }
}

#[async_trait]
impl EmbeddingStore for SqliteEmbeddingStore {
    async fn get(&self, guild_id: u64, name: &str) -> Result<Option<Embedding>, StoreError> {
        let row = sqlx::query("SELECT * FROM embeddings WHERE guild_id = ? AND name = ?")
            .bind(guild_id as i64)
            .bind(name)
            .fetch_optional(&self.pool)
            .await
            .map_err(db_error)?;

        row.as_ref().map(Self::row_to_embedding).transpose()
    }

    async fn list(&self, guild_id: u64) -> Result<Vec<Embedding>, StoreError> {
        let rows = sqlx::query("SELECT * FROM embeddings WHERE guild_id = ? ORDER BY name")
            .bind(guild_id as i64)
            .fetch_all(&self.pool)
            .await
            .map_err(db_error)?;

        rows.iter().map(Self::row_to_embedding).collect()
    }

    async fn upsert(&self, guild_id: u64, embedding: Embedding) -> Result<(), StoreError> {
        let vector = serde_json::to_string(&embedding.vector)?;
        sqlx::query(
            r#"
            INSERT INTO embeddings (guild_id, name, text, vector, ai_created, created_at, modified_at)
            VALUES (?, ?, ?, ?, ?, ?, ?)
            ON CONFLICT(guild_id, name) DO UPDATE SET
                text = excluded.text,
                vector = excluded.vector,
                ai_created = excluded.ai_created,
                modified_at = excluded.modified_at
            "#,
        )
        .bind(guild_id as i64)
        .bind(&embedding.name)
        .bind(&embedding.text)
        .bind(vector)
        .bind(embedding.ai_created)
        .bind(embedding.created_at)
        .bind(embedding.modified_at)
        .execute(&self.pool)
        .await
        .map_err(db_error)?;
        Ok(())
    }

    async fn delete(&self, guild_id: u64, name: &str) -> Result<bool, StoreError> {
        let result = sqlx::query("DELETE FROM embeddings WHERE guild_id = ? AND name = ?")
            .bind(guild_id as i64)
            .bind(name)
            .execute(&self.pool)
            .await
            .map_err(db_error)?;
        Ok(result.rows_affected() > 0)
    }

    async fn clear(&self, guild_id: u64) -> Result<u64, StoreError> {
        let result = sqlx::query("DELETE FROM embeddings WHERE guild_id = ?")
            .bind(guild_id as i64)
            .execute(&self.pool)
            .await
            .map_err(db_error)?;
        Ok(result.rows_affected())
    }

    async fn count(&self, guild_id: u64) -> Result<u64, StoreError> {
        let row = sqlx::query("SELECT COUNT(*) AS total FROM embeddings WHERE guild_id = ?")
            .bind(guild_id as i64)
            .fetch_one(&self.pool)
            .await
            .map_err(db_error)?;
        Ok(row.get::<i64, _>("total") as u64)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    async fn store() -> SqliteEmbeddingStore {
        // One connection, or each would get its own in-memory database
        let pool = SqlitePoolOptions::new()
            .max_connections(1)
            .connect("sqlite::memory:")
            .await
            .unwrap();
        let store = SqliteEmbeddingStore { pool };
        store.migrate().await.unwrap();
        store
    }

    #[tokio::test]
    async fn upsert_get_and_list() {
        let store = store().await;
        store
            .upsert(1, Embedding::new("zebra", "stripes", vec![0.5, -0.25]))
            .await
            .unwrap();
        store
            .upsert(1, Embedding::new("apple", "fruit", vec![1.0]))
            .await
            .unwrap();
        store
            .upsert(2, Embedding::new("other", "guild", vec![1.0]))
            .await
            .unwrap();

        let zebra = store.get(1, "zebra").await.unwrap().unwrap();
        assert_eq!(zebra.vector, vec![0.5, -0.25]);
        assert!(store.get(1, "Zebra").await.unwrap().is_none());

        let names: Vec<String> = store.list(1).await.unwrap().into_iter().map(|e| e.name).collect();
        assert_eq!(names, vec!["apple", "zebra"]);
        assert_eq!(store.count(1).await.unwrap(), 2);
    }

    #[tokio::test]
    async fn upsert_replaces_but_keeps_created_at() {
        let store = store().await;
        let mut first = Embedding::new("note", "v1", vec![1.0]);
        first.created_at = 100;
        store.upsert(1, first).await.unwrap();

        let mut second = Embedding::new("note", "v2", vec![2.0]);
        second.ai_created = true;
        store.upsert(1, second).await.unwrap();

        let saved = store.get(1, "note").await.unwrap().unwrap();
        assert_eq!(saved.text, "v2");
        assert_eq!(saved.created_at, 100);
        assert!(saved.ai_created);
        assert_eq!(store.count(1).await.unwrap(), 1);
    }

    #[tokio::test]
    async fn delete_and_clear() {
        let store = store().await;
        store.upsert(1, Embedding::new("a", "a", vec![1.0])).await.unwrap();
        store.upsert(1, Embedding::new("b", "b", vec![1.0])).await.unwrap();

        assert!(!store.delete(1, "missing").await.unwrap());
        assert!(store.delete(1, "a").await.unwrap());
        assert_eq!(store.clear(1).await.unwrap(), 1);
        assert_eq!(store.count(1).await.unwrap(), 0);
    }
}
