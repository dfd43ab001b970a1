use deadpool_redis::{Config, Pool, Runtime};
use futures::future::BoxFuture;
use redis::AsyncCommands;

use super::{decode_entry, encode_entry, DirectoryStore, StoreAck, StoreError, StoreKey, StoreResult};
use crate::types::Entry;

/// Redis-backed directory store; the pool gives us the parallel read
/// channels the chain-store client builds by hand.
pub struct RedisStore {
    pool: Pool,
}

impl RedisStore {
    pub fn new(redis_url: &str) -> Result<Self, StoreError> {
        let cfg = Config::from_url(redis_url);
        let pool = cfg
            .create_pool(Some(Runtime::Tokio1))
            .map_err(|err| StoreError::Io(err.to_string()))?;
        Ok(Self { pool })
    }

    async fn connection(&self) -> Result<deadpool_redis::Connection, StoreError> {
        self.pool
            .get()
            .await
            .map_err(|err| StoreError::Io(err.to_string()))
    }
}

impl DirectoryStore for RedisStore {
    fn get(&self, key: StoreKey) -> BoxFuture<'_, Result<StoreResult, StoreError>> {
        Box::pin(async move {
            let mut conn = self.connection().await?;
            let raw: Option<String> = conn
                .get(key.as_str())
                .await
                .map_err(|err| StoreError::Io(err.to_string()))?;
            match raw {
                Some(raw) => Ok(StoreResult::Found(decode_entry(&raw)?)),
                None => Ok(StoreResult::NotFound),
            }
        })
    }

    fn set(
        &self,
        key: StoreKey,
        entry: Entry,
        if_absent: bool,
    ) -> BoxFuture<'_, Result<StoreAck, StoreError>> {
        Box::pin(async move {
            let mut conn = self.connection().await?;
            let value = encode_entry(entry);
            if if_absent {
                // SET NX replies nil when the key already exists.
                let reply: Option<String> = redis::cmd("SET")
                    .arg(key.as_str())
                    .arg(&value)
                    .arg("NX")
                    .query_async(&mut conn)
                    .await
                    .map_err(|err| StoreError::Io(err.to_string()))?;
                match reply {
                    Some(_) => Ok(StoreAck::Stored),
                    None => Ok(StoreAck::AlreadyExists),
                }
            } else {
                let _: () = conn
                    .set(key.as_str(), &value)
                    .await
                    .map_err(|err| StoreError::Io(err.to_string()))?;
                Ok(StoreAck::Stored)
            }
        })
    }
}
