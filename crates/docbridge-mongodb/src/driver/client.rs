//! Driver backed by the official `mongodb` client.

use async_trait::async_trait;
use bson::raw::RawDocumentBuf;
use bson::{doc, Document as BsonDocument};
use docbridge_common::{BridgeError, Result};
use mongodb::options::{
    ClientOptions, CursorType, FindOptions, InsertManyOptions, ReplaceOptions, UpdateOptions,
};
use mongodb::{Client, Collection, Cursor};
use std::time::Duration;
use tracing::{debug, info};

use super::{database_of, is_operator_update, split_namespace, Driver, DriverCursor, FindSpec, IndexSpec};
use crate::options::{
    MONGO_AWAIT_DATA, MONGO_CONTINUE_ON_ERROR, MONGO_INDEX_BACKGROUND, MONGO_INDEX_DROP_DUPS,
    MONGO_INDEX_SPARSE, MONGO_INDEX_UNIQUE, MONGO_NO_CURSOR_TIMEOUT, MONGO_PARTIAL, MONGO_TAILABLE,
    MONGO_UPDATE_MULTI, MONGO_UPDATE_UPSERT,
};

/// `mongodb`-backed driver; one client per connection
pub struct MongoDriver {
    client: Option<Client>,
    app_name: Option<String>,
    connect_timeout: Duration,
}

impl MongoDriver {
    pub fn new(app_name: Option<String>) -> Self {
        Self {
            client: None,
            app_name,
            connect_timeout: Duration::from_secs(10),
        }
    }

    pub fn with_connect_timeout(mut self, timeout: Duration) -> Self {
        self.connect_timeout = timeout;
        self
    }

    fn client(&self) -> Result<&Client> {
        self.client.as_ref().ok_or(BridgeError::NotConnected)
    }

    fn collection(&self, namespace: &str) -> Result<Collection<BsonDocument>> {
        let (db, coll) = split_namespace(namespace)?;
        Ok(self.client()?.database(db).collection(coll))
    }
}

impl Default for MongoDriver {
    fn default() -> Self {
        Self::new(Some("docbridge".to_string()))
    }
}

struct MongoCursor {
    inner: Cursor<BsonDocument>,
}

#[async_trait]
impl DriverCursor for MongoCursor {
    async fn next(&mut self) -> Result<Option<RawDocumentBuf>> {
        if self.inner.advance().await? {
            Ok(Some(self.inner.current().to_owned()))
        } else {
            Ok(None)
        }
    }
}

#[async_trait]
impl Driver for MongoDriver {
    async fn connect(&mut self, address: &str, port: u16) -> Result<()> {
        let uri = format!("mongodb://{}:{}", address, port);
        let mut client_options = ClientOptions::parse(uri.as_str()).await?;
        client_options.app_name = self.app_name.clone();
        client_options.connect_timeout = Some(self.connect_timeout);
        client_options.server_selection_timeout = Some(self.connect_timeout);

        let client = Client::with_options(client_options)?;

        // The client connects lazily; ping so failures surface on open
        client.database("admin").run_command(doc! { "ping": 1 }).await?;

        info!(address, port, "Connected to MongoDB");
        self.client = Some(client);
        Ok(())
    }

    async fn find(
        &mut self,
        namespace: &str,
        filter: BsonDocument,
        spec: FindSpec,
    ) -> Result<Box<dyn DriverCursor>> {
        let collection = self.collection(namespace)?;

        let mut options = FindOptions::default();
        options.projection = spec.projection;
        if spec.limit != 0 {
            options.limit = Some(i64::from(spec.limit));
        }
        if spec.skip > 0 {
            options.skip = Some(spec.skip as u64);
        }
        if spec.flags & MONGO_TAILABLE != 0 {
            options.cursor_type = Some(if spec.flags & MONGO_AWAIT_DATA != 0 {
                CursorType::TailableAwait
            } else {
                CursorType::Tailable
            });
        }
        if spec.flags & MONGO_NO_CURSOR_TIMEOUT != 0 {
            options.no_cursor_timeout = Some(true);
        }
        if spec.flags & MONGO_PARTIAL != 0 {
            options.allow_partial_results = Some(true);
        }

        debug!(namespace, flags = spec.flags, "find");
        let cursor = collection.find(filter).with_options(options).await?;
        Ok(Box::new(MongoCursor { inner: cursor }))
    }

    async fn insert(&mut self, namespace: &str, doc: BsonDocument) -> Result<()> {
        self.collection(namespace)?.insert_one(doc).await?;
        Ok(())
    }

    async fn insert_batch(&mut self, namespace: &str, docs: Vec<BsonDocument>, flags: u32) -> Result<()> {
        let mut options = InsertManyOptions::default();
        options.ordered = Some(flags & MONGO_CONTINUE_ON_ERROR == 0);
        self.collection(namespace)?
            .insert_many(docs)
            .with_options(options)
            .await?;
        Ok(())
    }

    async fn update(
        &mut self,
        namespace: &str,
        filter: BsonDocument,
        update: BsonDocument,
        flags: u32,
    ) -> Result<()> {
        let collection = self.collection(namespace)?;
        let upsert = flags & MONGO_UPDATE_UPSERT != 0;

        if is_operator_update(&update) {
            let mut options = UpdateOptions::default();
            options.upsert = Some(upsert);
            if flags & MONGO_UPDATE_MULTI != 0 {
                collection.update_many(filter, update).with_options(options).await?;
            } else {
                collection.update_one(filter, update).with_options(options).await?;
            }
        } else {
            let mut options = ReplaceOptions::default();
            options.upsert = Some(upsert);
            collection.replace_one(filter, update).with_options(options).await?;
        }
        Ok(())
    }

    async fn remove(&mut self, namespace: &str, filter: BsonDocument) -> Result<()> {
        self.collection(namespace)?.delete_many(filter).await?;
        Ok(())
    }

    async fn command(&mut self, database: &str, command: BsonDocument) -> Result<BsonDocument> {
        let db = self.client()?.database(database_of(database));
        Ok(db.run_command(command).await?)
    }

    async fn create_index(&mut self, namespace: &str, index: IndexSpec) -> Result<BsonDocument> {
        let (db, coll) = split_namespace(namespace)?;

        let mut definition = doc! {
            "key": index.keys.clone(),
            "name": index.resolved_name(),
        };
        if index.flags & MONGO_INDEX_UNIQUE != 0 {
            definition.insert("unique", true);
        }
        if index.flags & MONGO_INDEX_DROP_DUPS != 0 {
            definition.insert("dropDups", true);
        }
        if index.flags & MONGO_INDEX_BACKGROUND != 0 {
            definition.insert("background", true);
        }
        if index.flags & MONGO_INDEX_SPARSE != 0 {
            definition.insert("sparse", true);
        }

        let command = doc! {
            "createIndexes": coll,
            "indexes": [definition],
        };
        Ok(self.client()?.database(db).run_command(command).await?)
    }

    async fn destroy(&mut self) {
        if let Some(client) = self.client.take() {
            client.shutdown().await;
            info!("MongoDB client shut down");
        }
    }
}
