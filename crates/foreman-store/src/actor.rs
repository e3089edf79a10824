//! Single-writer table actors.
//!
//! Each table is owned by exactly one long-lived task that drains a command
//! channel; every read and write goes through that task. This serializes all
//! writers, so two components can never race a read-modify-write cycle and
//! silently lose an update. [`TableHandle::update`] exposes the atomic
//! read-modify-write directly.

use tokio::sync::{mpsc, oneshot};
use tracing::{debug, error};

use foreman_core::{ForemanError, Result};

use crate::table::{Record, Table};

type Mutator<T> = Box<dyn FnOnce(&mut T) -> Result<()> + Send>;
type Predicate<T> = Box<dyn Fn(&T) -> bool + Send>;

enum Command<T: Record> {
    Get {
        key: String,
        reply: oneshot::Sender<Option<T>>,
    },
    Put {
        record: T,
        reply: oneshot::Sender<Result<()>>,
    },
    Create {
        record: T,
        reply: oneshot::Sender<Result<()>>,
    },
    Update {
        key: String,
        mutate: Mutator<T>,
        reply: oneshot::Sender<Result<T>>,
    },
    Upsert {
        default: T,
        mutate: Mutator<T>,
        reply: oneshot::Sender<Result<T>>,
    },
    Remove {
        key: String,
        reply: oneshot::Sender<Result<Option<T>>>,
    },
    All {
        reply: oneshot::Sender<Vec<T>>,
    },
    Retain {
        keep: Predicate<T>,
        reply: oneshot::Sender<Result<usize>>,
    },
}

/// Cloneable async handle to a table actor.
pub struct TableHandle<T: Record> {
    tx: mpsc::Sender<Command<T>>,
}

impl<T: Record> Clone for TableHandle<T> {
    fn clone(&self) -> Self {
        Self {
            tx: self.tx.clone(),
        }
    }
}

/// Spawn the owner task for a loaded table and return its handle.
pub fn spawn_table<T: Record>(mut table: Table<T>) -> TableHandle<T> {
    let (tx, mut rx) = mpsc::channel::<Command<T>>(64);

    tokio::spawn(async move {
        while let Some(command) = rx.recv().await {
            handle_command(&mut table, command).await;
        }
        debug!("Table {} actor stopped", table.name());
    });

    TableHandle { tx }
}

async fn handle_command<T: Record>(table: &mut Table<T>, command: Command<T>) {
    match command {
        Command::Get { key, reply } => {
            let _ = reply.send(table.get(&key).cloned());
        }
        Command::Put { record, reply } => {
            let result = match table.insert(record) {
                Ok(()) => persist(table).await,
                Err(e) => Err(e),
            };
            let _ = reply.send(result);
        }
        Command::Create { record, reply } => {
            let result = match table.insert_new(record) {
                Ok(()) => persist(table).await,
                Err(e) => Err(e),
            };
            let _ = reply.send(result);
        }
        Command::Update { key, mutate, reply } => {
            let result = apply_update(table, &key, mutate).await;
            let _ = reply.send(result);
        }
        Command::Upsert {
            default,
            mutate,
            reply,
        } => {
            let key = default.key().to_string();
            let mut record = table.get(&key).cloned().unwrap_or(default);
            let result = match mutate(&mut record) {
                Ok(()) => match table.insert(record.clone()) {
                    Ok(()) => persist(table).await.map(|_| record),
                    Err(e) => Err(e),
                },
                Err(e) => Err(e),
            };
            let _ = reply.send(result);
        }
        Command::Remove { key, reply } => {
            let removed = table.remove(&key);
            let result = if removed.is_some() {
                persist(table).await.map(|_| removed)
            } else {
                Ok(None)
            };
            let _ = reply.send(result);
        }
        Command::All { reply } => {
            let _ = reply.send(table.values().cloned().collect());
        }
        Command::Retain { keep, reply } => {
            let dropped = table.retain(|record| keep(record));
            let result = if dropped > 0 {
                persist(table).await.map(|_| dropped)
            } else {
                Ok(0)
            };
            let _ = reply.send(result);
        }
    }
}

/// Apply a mutation to a copy; the table only sees validated results.
async fn apply_update<T: Record>(table: &mut Table<T>, key: &str, mutate: Mutator<T>) -> Result<T> {
    let mut record = table
        .get(key)
        .cloned()
        .ok_or_else(|| ForemanError::Store(format!("no record {} in table {}", key, table.name())))?;

    mutate(&mut record)?;
    table.insert(record.clone())?;
    persist(table).await?;
    Ok(record)
}

async fn persist<T: Record>(table: &Table<T>) -> Result<()> {
    if let Err(e) = table.save().await {
        error!("Failed to persist table {}: {}", table.name(), e);
        return Err(e);
    }
    Ok(())
}

impl<T: Record> TableHandle<T> {
    /// Fetch one record by key.
    pub async fn get(&self, key: &str) -> Result<Option<T>> {
        let (reply, rx) = oneshot::channel();
        self.send(Command::Get {
            key: key.to_string(),
            reply,
        })
        .await?;
        rx.await.map_err(|_| actor_gone())
    }

    /// Insert or replace a record (whole-record semantics, validated).
    pub async fn put(&self, record: T) -> Result<()> {
        let (reply, rx) = oneshot::channel();
        self.send(Command::Put { record, reply }).await?;
        rx.await.map_err(|_| actor_gone())?
    }

    /// Insert a record, failing if the key already exists.
    pub async fn create(&self, record: T) -> Result<()> {
        let (reply, rx) = oneshot::channel();
        self.send(Command::Create { record, reply }).await?;
        rx.await.map_err(|_| actor_gone())?
    }

    /// Atomically read-modify-write an existing record.
    pub async fn update<F>(&self, key: &str, mutate: F) -> Result<T>
    where
        F: FnOnce(&mut T) -> Result<()> + Send + 'static,
    {
        let (reply, rx) = oneshot::channel();
        self.send(Command::Update {
            key: key.to_string(),
            mutate: Box::new(mutate),
            reply,
        })
        .await?;
        rx.await.map_err(|_| actor_gone())?
    }

    /// Atomically modify a record, creating it from `default` if absent.
    pub async fn upsert<F>(&self, default: T, mutate: F) -> Result<T>
    where
        F: FnOnce(&mut T) -> Result<()> + Send + 'static,
    {
        let (reply, rx) = oneshot::channel();
        self.send(Command::Upsert {
            default,
            mutate: Box::new(mutate),
            reply,
        })
        .await?;
        rx.await.map_err(|_| actor_gone())?
    }

    /// Remove a record; Ok(None) if it did not exist.
    pub async fn remove(&self, key: &str) -> Result<Option<T>> {
        let (reply, rx) = oneshot::channel();
        self.send(Command::Remove {
            key: key.to_string(),
            reply,
        })
        .await?;
        rx.await.map_err(|_| actor_gone())?
    }

    /// Snapshot of every record in the table.
    pub async fn all(&self) -> Result<Vec<T>> {
        let (reply, rx) = oneshot::channel();
        self.send(Command::All { reply }).await?;
        rx.await.map_err(|_| actor_gone())
    }

    /// Snapshot of records matching a predicate.
    pub async fn scan<F>(&self, predicate: F) -> Result<Vec<T>>
    where
        F: Fn(&T) -> bool,
    {
        Ok(self.all().await?.into_iter().filter(|r| predicate(r)).collect())
    }

    /// Drop records not matching the predicate; returns how many were dropped.
    pub async fn retain<F>(&self, keep: F) -> Result<usize>
    where
        F: Fn(&T) -> bool + Send + 'static,
    {
        let (reply, rx) = oneshot::channel();
        self.send(Command::Retain {
            keep: Box::new(keep),
            reply,
        })
        .await?;
        rx.await.map_err(|_| actor_gone())?
    }

    async fn send(&self, command: Command<T>) -> Result<()> {
        self.tx
            .send(command)
            .await
            .map_err(|_| actor_gone())
    }
}

fn actor_gone() -> ForemanError {
    ForemanError::Store("table actor stopped".to_string())
}
