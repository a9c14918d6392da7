use std::future::Future;

use tokio::{
    select,
    sync::{mpsc, oneshot},
};
use tokio_util::sync::CancellationToken;
use tracing::{debug, trace};

use crate::error::RelayError;

/// Something that can be held by a [`Registry`].
pub trait Member: Clone + Send + Sync + 'static {
    /// Identity used to find the entry a removal request refers to.
    fn same_as(&self, other: &Self) -> bool;

    /// Runs once when the entry leaves the registry, either through a
    /// removal request or because the registry is shutting down.
    fn release(&self) -> impl Future<Output = ()> + Send {
        async {}
    }
}

/// Serialized owner of a set of members.
///
/// Only [`Registry::run`] ever touches the backing `Vec`. Every other task
/// goes through a [`RegistryHandle`], so additions, removals and snapshots
/// are applied one at a time in the order the loop picks them up.
pub struct Registry<T> {
    name: &'static str,
    members: Vec<T>,
    adds: mpsc::Receiver<T>,
    removals: mpsc::Receiver<T>,
    snapshots: mpsc::Receiver<oneshot::Sender<Vec<T>>>,
}

/// Cloneable request side of a [`Registry`].
#[derive(Debug)]
pub struct RegistryHandle<T> {
    name: &'static str,
    adds: mpsc::Sender<T>,
    removals: mpsc::Sender<T>,
    snapshots: mpsc::Sender<oneshot::Sender<Vec<T>>>,
}

impl<T> Clone for RegistryHandle<T> {
    fn clone(&self) -> Self {
        Self {
            name: self.name,
            adds: self.adds.clone(),
            removals: self.removals.clone(),
            snapshots: self.snapshots.clone(),
        }
    }
}

/// Creates an empty registry and the handle used to drive it.
///
/// `name` only shows up in logs and in [`RelayError::Closed`].
pub fn registry<T: Member>(name: &'static str) -> (RegistryHandle<T>, Registry<T>) {
    let (add_tx, adds) = mpsc::channel(1);
    let (remove_tx, removals) = mpsc::channel(1);
    let (snapshot_tx, snapshots) = mpsc::channel(1);

    let handle = RegistryHandle {
        name,
        adds: add_tx,
        removals: remove_tx,
        snapshots: snapshot_tx,
    };
    let registry = Registry {
        name,
        members: Vec::new(),
        adds,
        removals,
        snapshots,
    };
    (handle, registry)
}

impl<T: Member> Registry<T> {
    /// Applies requests until `shutdown` fires or every handle is dropped,
    /// then releases whatever is still registered.
    ///
    /// Pending additions are applied before pending removals, and both
    /// before snapshots, so a task that adds, removes and then asks for a
    /// snapshot always sees its own changes.
    pub async fn run(mut self, shutdown: CancellationToken) {
        loop {
            select! {
                biased;
                _ = shutdown.cancelled() => break,
                Some(member) = self.adds.recv() => self.add(member),
                Some(member) = self.removals.recv() => self.remove(&member).await,
                Some(reply) = self.snapshots.recv() => {
                    let _ = reply.send(self.members.clone());
                }
                else => break,
            }
        }

        self.release_all().await;
    }

    fn add(&mut self, member: T) {
        self.members.push(member);
        trace!(registry = self.name, count = self.members.len(), "member added");
    }

    async fn remove(&mut self, member: &T) {
        let Some(index) = self.members.iter().position(|entry| entry.same_as(member)) else {
            trace!(registry = self.name, "ignoring removal of unknown member");
            return;
        };

        let removed = self.members.remove(index);
        removed.release().await;
        debug!(registry = self.name, count = self.members.len(), "member removed");
    }

    async fn release_all(&mut self) {
        let remaining = std::mem::take(&mut self.members);
        debug!(registry = self.name, count = remaining.len(), "registry stopping");
        for member in remaining {
            member.release().await;
        }
    }
}

impl<T: Member> RegistryHandle<T> {
    /// Appends `member`, even if an equal entry is already present.
    pub async fn add(&self, member: T) -> Result<(), RelayError> {
        self.adds
            .send(member)
            .await
            .map_err(|_| RelayError::Closed(self.name))
    }

    /// Removes and releases the first entry equal to `member`.
    /// Removing something that is not registered does nothing.
    pub async fn remove(&self, member: T) -> Result<(), RelayError> {
        self.removals
            .send(member)
            .await
            .map_err(|_| RelayError::Closed(self.name))
    }

    /// Current members in registration order.
    pub async fn snapshot(&self) -> Result<Vec<T>, RelayError> {
        let (reply, response) = oneshot::channel();
        self.snapshots
            .send(reply)
            .await
            .map_err(|_| RelayError::Closed(self.name))?;
        response.await.map_err(|_| RelayError::Closed(self.name))
    }
}
