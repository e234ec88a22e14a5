use std::collections::BTreeSet;
use std::collections::HashMap;
use std::time::Duration;

use tracing::debug;
use tracing::instrument;
use tracing::warn;

use crate::error::Result;
use crate::lock::DistributedLock;
use crate::traits::KeyValueBackend;
use crate::types::CacheValue;

/// A deferred backend call.
#[derive(Clone, Debug, PartialEq)]
pub(crate) enum Command {
    Set {
        key:   String,
        value: CacheValue,
        ttl:   Option<Duration>,
    },
    Add {
        key:   String,
        value: CacheValue,
        ttl:   Option<Duration>,
    },
    Delete {
        key: String,
    },
    Incr {
        key:   String,
        delta: u64,
    },
    Decr {
        key:   String,
        delta: u64,
    },
}

impl Command {
    pub(crate) fn key(&self) -> &str {
        match self {
            Self::Set { key, .. }
            | Self::Add { key, .. }
            | Self::Delete { key }
            | Self::Incr { key, .. }
            | Self::Decr { key, .. } => key,
        }
    }

    #[inline]
    pub(crate) fn requires_lock(&self) -> bool {
        matches!(self, Self::Set { .. })
    }

    // Fold `other` into self when both move the same counter in the same direction.
    fn absorb(&mut self, other: &Command) -> bool {
        match (self, other) {
            (Self::Incr { key, delta }, Self::Incr { key: k, delta: d })
            | (Self::Decr { key, delta }, Self::Decr { key: k, delta: d })
                if key == k =>
            {
                *delta = delta.saturating_add(*d);
                true
            }
            _ => false,
        }
    }

    async fn replay(&self, backend: &dyn KeyValueBackend) -> Result<()> {
        match self {
            Self::Set { key, value, ttl } => backend.set(key, value.clone(), *ttl).await,
            Self::Add { key, value, ttl } => backend.add(key, value.clone(), *ttl).await.map(|_| ()),
            Self::Delete { key } => backend.delete(key).await,
            Self::Incr { key, delta } => backend.incr(key, *delta).await.map(|_| ()),
            Self::Decr { key, delta } => backend.decr(key, *delta).await.map(|_| ()),
        }
    }
}

/// One level of a transaction: the read-your-writes shadow and the log of pending commands.
///
/// A shadow entry of `None` is a known miss, either read from the backend or produced by a buffered delete.
#[derive(Debug, Default)]
pub(crate) struct BufferLayer {
    shadow:   HashMap<String, Option<CacheValue>>,
    commands: Vec<Command>,
}

impl BufferLayer {
    #[inline]
    pub(crate) fn lookup(&self, key: &str) -> Option<&Option<CacheValue>> {
        self.shadow.get(key)
    }

    /// Remember a backend read. Never overrides a buffered write.
    pub(crate) fn memoize(&mut self, key: &str, value: Option<CacheValue>) {
        self.shadow.entry(key.to_string()).or_insert(value);
    }

    pub(crate) fn record(&mut self, key: &str, shadow: Option<CacheValue>, command: Command) {
        self.shadow.insert(key.to_string(), shadow);
        self.push(command);
    }

    fn push(&mut self, command: Command) {
        if let Some(last) = self.commands.iter_mut().rev().find(|c| c.key() == command.key()) {
            if last.absorb(&command) {
                return;
            }
        }
        self.commands.push(command);
    }

    /// Hand the layer over to its parent: the parent now owns the writes and will replay them.
    pub(crate) fn merge_into(self, parent: &mut BufferLayer) {
        parent.shadow.extend(self.shadow);
        for command in self.commands {
            parent.push(command);
        }
    }

    /// Keys to lock before replay, in global lexicographic order.
    pub(crate) fn lock_keys(&self) -> Vec<String> {
        self.commands
            .iter()
            .filter(|c| c.requires_lock())
            .map(|c| c.key().to_string())
            .collect::<BTreeSet<_>>()
            .into_iter()
            .collect()
    }

    /// Every key the log touches.
    pub(crate) fn written_keys(&self) -> BTreeSet<String> {
        self.commands.iter().map(|c| c.key().to_string()).collect()
    }

    #[cfg(test)]
    pub(crate) fn commands(&self) -> &[Command] {
        &self.commands
    }

    /// Lock every written key in sorted order, replay the log in call order, then release the locks in the same
    /// sorted order. Locks are released on every path; the first error is returned after that.
    #[instrument(level = "trace", skip_all, fields(commands = self.commands.len()))]
    pub(crate) async fn flush(self, backend: &dyn KeyValueBackend, lock: &DistributedLock) -> Result<()> {
        let keys = self.lock_keys();
        let mut guards = Vec::with_capacity(keys.len());
        let mut outcome = Ok(());

        for key in &keys {
            match lock.lock(key).await {
                Ok(guard) => guards.push(guard),
                Err(err) => {
                    outcome = Err(err);
                    break;
                }
            }
        }

        if outcome.is_ok() {
            for command in &self.commands {
                if let Err(err) = command.replay(backend).await {
                    outcome = Err(err);
                    break;
                }
            }
        }

        for guard in guards {
            let key = guard.key().to_string();
            match guard.release().await {
                Ok(()) => (),
                Err(err) if outcome.is_ok() => outcome = Err(err),
                Err(err) => warn!("failed to release lock '{key}' after an error: {err}"),
            }
        }

        if outcome.is_ok() {
            debug!("flushed {} command(s) over {} locked key(s)", self.commands.len(), keys.len());
        }
        outcome
    }
}
