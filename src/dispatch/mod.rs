//! Triangle Write Dispatcher.
//!
//! A write travels originator -> primary -> backups:
//!
//! ```text
//!   originator ──Forward──▶ primary ──Backup──▶ backup 1
//!        ▲                    │    └──Backup──▶ backup 2
//!        └──ForwardResponse───┘ (after the ack set, in sync mode)
//! ```
//!
//! The primary sequences the write inside the key's critical section: it
//! evaluates the command against its copy, assigns the next version, applies
//! locally and only then fans the result out to the backups. Backups accept
//! commands of their own topology only; the primary retries transient
//! rejections with a refreshed view.

mod keylock;
mod seen;

pub use keylock::{KeyGuard, KeyLocks};
pub use seen::{AppliedCommand, SeenCommands};

use crate::cache::context::NodeContext;
use crate::cache::versions::VersionMerge;
use crate::config::ReplicationMode;
use crate::error::{DistributionError, Error, NetworkError, Result};
use crate::events::{EntryEvent, EventOrigin};
use crate::functions::EntryWrite;
use crate::network::rpc::{
    BackupAck, BackupPayload, BackupRequest, ForwardRequest, Message, ReadRequest,
};
use crate::partition::PartitionState;
use crate::types::{
    CacheEntry, EntryKey, NodeId, TopologyId, Version, WriteCommand, WriteKind, WriteResult,
};
use bytes::Bytes;
use rand::Rng;
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, trace, warn};

/// Executes writes and reads against the key's owners.
pub struct TriangleDispatcher {
    ctx: Arc<NodeContext>,
    seen: SeenCommands,
}

impl TriangleDispatcher {
    /// Create a dispatcher over the node's components.
    pub fn new(ctx: Arc<NodeContext>) -> Self {
        let seen = SeenCommands::new(ctx.config.seen_commands_capacity);
        Self { ctx, seen }
    }

    /// Commands applied on this node.
    pub fn seen(&self) -> &SeenCommands {
        &self.seen
    }

    /// Submit a write for `key`, retrying transient failures.
    pub async fn submit(&self, command: WriteCommand, key: EntryKey) -> Result<WriteResult> {
        let result = self
            .with_retry(command.op_name(), &key, || self.attempt_write(&command, &key))
            .await;
        if let Err(e) = &result {
            self.ctx.metrics.write_failures.inc();
            debug!(
                node_id = self.ctx.node_id,
                command_id = %command.id,
                key = %key,
                op = command.op_name(),
                error = %e,
                "Write failed"
            );
        }
        result
    }

    /// Read `key` at its primary.
    pub async fn read(&self, key: &EntryKey) -> Result<Option<CacheEntry>> {
        self.with_retry("get", key, || self.attempt_read(key)).await
    }

    async fn with_retry<T, F, Fut>(&self, op: &'static str, key: &EntryKey, mut f: F) -> Result<T>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = Result<T>>,
    {
        let retry = &self.ctx.config.replication.retry;
        let mut attempt = 1u32;
        loop {
            match f().await {
                Ok(value) => return Ok(value),
                Err(e) if e.is_transient() => {
                    if attempt >= retry.max_attempts {
                        warn!(
                            node_id = self.ctx.node_id,
                            key = %key,
                            op,
                            attempts = attempt,
                            error = %e,
                            "Retries exhausted"
                        );
                        return Err(DistributionError::RetriesExhausted {
                            attempts: attempt,
                            last: e.to_string(),
                        }
                        .into());
                    }

                    self.ctx.metrics.retries.inc();
                    let backoff = retry.backoff(attempt);
                    let jitter_ms =
                        rand::thread_rng().gen_range(0..=backoff.as_millis() as u64 / 4);
                    debug!(
                        node_id = self.ctx.node_id,
                        key = %key,
                        op,
                        attempt,
                        error = %e,
                        "Transient failure, retrying"
                    );
                    tokio::time::sleep(backoff + Duration::from_millis(jitter_ms)).await;
                    attempt += 1;
                }
                Err(e) => return Err(e),
            }
        }
    }

    async fn attempt_write(&self, command: &WriteCommand, key: &EntryKey) -> Result<WriteResult> {
        self.ctx.monitor.admit_write(command.flags).await?;

        let (view, owners) = self.ctx.owners(key);
        let primary = *owners.first().ok_or(DistributionError::NoOwners)?;
        if primary == self.ctx.node_id {
            self.execute_as_primary(command, key).await
        } else {
            self.forward(primary, command, key, view.topology_id).await
        }
    }

    async fn forward(
        &self,
        primary: NodeId,
        command: &WriteCommand,
        key: &EntryKey,
        topology_id: TopologyId,
    ) -> Result<WriteResult> {
        self.ctx.metrics.forwards.inc();
        trace!(
            node_id = self.ctx.node_id,
            primary,
            command_id = %command.id,
            key = %key,
            "Forwarding write to primary"
        );

        let request = Message::Forward(ForwardRequest {
            command: command.clone(),
            key: key.clone(),
            topology_id,
        });
        let deadline = self.ctx.config.replication.backup_timeout
            + self.ctx.config.partition.merge_wait_timeout;

        match self.request_primary(primary, request, deadline).await? {
            Message::ForwardResponse(result) => result.map_err(Error::from),
            other => Err(NetworkError::UnexpectedReply(other.name().to_string()).into()),
        }
    }

    async fn request_primary(
        &self,
        primary: NodeId,
        request: Message,
        deadline: Duration,
    ) -> Result<Message> {
        match tokio::time::timeout(deadline, self.ctx.transport.request(primary, request)).await {
            Ok(Ok(reply)) => Ok(reply),
            Ok(Err(e)) => Err(DistributionError::PrimaryUnreachable {
                node: primary,
                reason: e.to_string(),
            }
            .into()),
            Err(_) => Err(DistributionError::PrimaryUnreachable {
                node: primary,
                reason: "timed out".to_string(),
            }
            .into()),
        }
    }

    /// Execute a write forwarded by another node.
    pub async fn handle_forward(&self, request: ForwardRequest) -> Result<WriteResult> {
        let local = self.ctx.monitor.topology_id();
        if request.topology_id > local {
            return Err(DistributionError::TopologyAhead {
                command: request.topology_id,
                current: local,
            }
            .into());
        }
        self.ctx.monitor.admit_write(request.command.flags).await?;
        self.execute_as_primary(&request.command, &request.key).await
    }

    async fn execute_as_primary(&self, command: &WriteCommand, key: &EntryKey) -> Result<WriteResult> {
        let _guard = self.ctx.key_locks.lock(key).await;
        if !command.flags.merge_resolution {
            self.ctx.monitor.check_write()?;
        }

        // Ownership may have moved while waiting for the key.
        let (view, owners) = self.ctx.owners(key);
        match owners.first() {
            Some(&primary) if primary == self.ctx.node_id => {}
            other => {
                return Err(DistributionError::NotPrimary {
                    primary: other.copied(),
                }
                .into())
            }
        }

        if let Some(applied) = self.seen.get(&command.id) {
            self.ctx.metrics.duplicates_suppressed.inc();
            debug!(
                node_id = self.ctx.node_id,
                command_id = %command.id,
                key = %key,
                "Command already applied, replaying result"
            );
            if let (Some(_), Some(version)) = (&applied.payload, applied.version) {
                // Backups are brought to the current copy: re-sending a function
                // could apply it twice, an old post-image could be stale.
                let payload = self.current_image(key).await?;
                let current = self.ctx.versions.get(key).unwrap_or(version).max(version);
                let request = BackupRequest {
                    command_id: command.id,
                    key: key.clone(),
                    topology_id: view.topology_id,
                    version: current,
                    owners: owners.clone(),
                    payload,
                    result: applied.result.clone(),
                    flags: command.flags,
                };
                self.replicate(request, &owners).await?;
            }
            return Ok(applied.result);
        }

        let applied = self.apply_locally(command, key, view.topology_id, &owners).await?;

        if let (Some(payload), Some(version)) = (applied.payload.clone(), applied.version) {
            let request = BackupRequest {
                command_id: command.id,
                key: key.clone(),
                topology_id: view.topology_id,
                version,
                owners: owners.clone(),
                payload,
                result: applied.result.clone(),
                flags: command.flags,
            };
            self.replicate(request, &owners).await?;
        }

        Ok(applied.result)
    }

    async fn current_image(&self, key: &EntryKey) -> Result<BackupPayload> {
        Ok(match self.ctx.storage.get(key).await? {
            Some(entry) => BackupPayload::Value {
                value: entry.value,
                metadata: entry.metadata,
            },
            None => BackupPayload::Tombstone,
        })
    }

    async fn apply_locally(
        &self,
        command: &WriteCommand,
        key: &EntryKey,
        topology_id: TopologyId,
        owners: &[NodeId],
    ) -> Result<AppliedCommand> {
        let ctx = &self.ctx;
        let current = ctx.storage.get(key).await?;
        let previous = current.as_ref().map(|e| e.value.clone());

        let (write, function) = match &command.kind {
            WriteKind::Put { value, metadata } => (
                EntryWrite::Set {
                    value: value.clone(),
                    metadata: *metadata,
                },
                None,
            ),
            WriteKind::Remove if current.is_some() || command.flags.merge_resolution => {
                (EntryWrite::Remove, None)
            }
            WriteKind::Remove => (EntryWrite::Keep, None),
            WriteKind::Functional(f) => {
                let outcome = f.apply(current.as_ref())?;
                (outcome.write, Some(outcome.result))
            }
        };

        let (version, payload, value): (Version, BackupPayload, Option<Bytes>) = match write {
            EntryWrite::Keep => {
                let applied = AppliedCommand {
                    result: WriteResult {
                        previous,
                        version: ctx.versions.get(key),
                        modified: false,
                        function,
                    },
                    version: None,
                    payload: None,
                };
                self.seen.remember(command.id, applied.clone());
                return Ok(applied);
            }
            EntryWrite::Set { value, metadata } => {
                let version = ctx.versions.next(key, topology_id);
                ctx.storage
                    .put(CacheEntry {
                        key: key.clone(),
                        value: value.clone(),
                        version,
                        metadata,
                        owners: owners.to_vec(),
                    })
                    .await?;
                let payload = match &command.kind {
                    WriteKind::Functional(f) if f.is_commutative() => {
                        BackupPayload::Function(f.clone())
                    }
                    _ => BackupPayload::Value {
                        value: value.clone(),
                        metadata,
                    },
                };
                (version, payload, Some(value))
            }
            EntryWrite::Remove => {
                let version = ctx.versions.next(key, topology_id);
                ctx.storage.remove(key).await?;
                (version, BackupPayload::Tombstone, None)
            }
        };

        // Local storage succeeded: the write now exists.
        ctx.versions.record(key, version);
        let applied = AppliedCommand {
            result: WriteResult {
                previous: previous.clone(),
                version: Some(version),
                modified: true,
                function,
            },
            version: Some(version),
            payload: Some(payload),
        };
        self.seen.remember(command.id, applied.clone());
        ctx.metrics.writes.inc();

        trace!(
            node_id = ctx.node_id,
            command_id = %command.id,
            key = %key,
            version = %version,
            op = command.op_name(),
            "Applied at primary"
        );
        ctx.events.fire(&EntryEvent::new(
            key.clone(),
            previous,
            value,
            version,
            EventOrigin::Primary,
        ));

        Ok(applied)
    }

    async fn replicate(&self, request: BackupRequest, owners: &[NodeId]) -> Result<()> {
        let node_id = self.ctx.node_id;
        let backups: Vec<NodeId> = owners.iter().copied().filter(|&n| n != node_id).collect();
        if backups.is_empty() {
            return Ok(());
        }

        let replication = &self.ctx.config.replication;
        let required = replication.ack_policy.required_acks(owners.len());

        match replication.mode {
            ReplicationMode::Sync => {
                let acked = send_backups(&self.ctx, &request, &backups, required).await?;
                if acked < required {
                    warn!(
                        node_id,
                        command_id = %request.command_id,
                        key = %request.key,
                        acked,
                        required,
                        "Backups did not acknowledge"
                    );
                    return Err(DistributionError::PartialReplication {
                        command_id: request.command_id,
                        acked,
                        required,
                    }
                    .into());
                }
                Ok(())
            }
            ReplicationMode::Async => {
                let ctx = self.ctx.clone();
                tokio::spawn(async move {
                    match send_backups(&ctx, &request, &backups, required).await {
                        Ok(acked) if acked < required => warn!(
                            node_id = ctx.node_id,
                            command_id = %request.command_id,
                            acked,
                            required,
                            "Async replication incomplete"
                        ),
                        Err(e) => warn!(
                            node_id = ctx.node_id,
                            command_id = %request.command_id,
                            error = %e,
                            "Async replication failed"
                        ),
                        Ok(_) => {}
                    }
                });
                Ok(())
            }
        }
    }

    /// Apply a backup command from the primary.
    pub async fn handle_backup(&self, request: BackupRequest) -> Result<BackupAck> {
        let ctx = &self.ctx;
        let local = ctx.monitor.topology_id();
        if request.topology_id < local {
            ctx.metrics.topology_rejections.inc();
            return Err(DistributionError::TopologyStale {
                command: request.topology_id,
                current: local,
            }
            .into());
        }
        if request.topology_id > local {
            ctx.metrics.topology_rejections.inc();
            return Err(DistributionError::TopologyAhead {
                command: request.topology_id,
                current: local,
            }
            .into());
        }
        if ctx.monitor.state() == PartitionState::Merging && !request.flags.merge_resolution {
            return Err(DistributionError::StateTransferInProgress.into());
        }

        let key = &request.key;
        let _guard = ctx.key_locks.lock(key).await;
        if self.seen.contains(&request.command_id) {
            ctx.metrics.duplicates_suppressed.inc();
            return Ok(BackupAck { applied: false });
        }

        let current = ctx.storage.get(key).await?;
        let previous = current.as_ref().map(|e| e.value.clone());
        let stored = ctx.versions.get(key);
        let newer = ctx.versions.admits(key, request.version) == VersionMerge::Accepted;

        // (value after the write, version recorded), if the copy changed
        let applied: Option<(Option<Bytes>, Version)> = match &request.payload {
            BackupPayload::Value { value, metadata } if newer => {
                ctx.storage
                    .put(CacheEntry {
                        key: key.clone(),
                        value: value.clone(),
                        version: request.version,
                        metadata: *metadata,
                        owners: request.owners.clone(),
                    })
                    .await?;
                Some((Some(value.clone()), request.version))
            }
            BackupPayload::Tombstone if newer => {
                ctx.storage.remove(key).await?;
                Some((None, request.version))
            }
            BackupPayload::Value { .. } | BackupPayload::Tombstone => None,
            BackupPayload::Function(f) => {
                let outcome = f.apply(current.as_ref())?;
                let version = stored.map_or(request.version, |v| v.max(request.version));
                match outcome.write {
                    EntryWrite::Set { value, metadata } => {
                        ctx.storage
                            .put(CacheEntry {
                                key: key.clone(),
                                value: value.clone(),
                                version,
                                metadata,
                                owners: request.owners.clone(),
                            })
                            .await?;
                        Some((Some(value), version))
                    }
                    EntryWrite::Remove => {
                        ctx.storage.remove(key).await?;
                        Some((None, version))
                    }
                    EntryWrite::Keep => None,
                }
            }
        };

        if let Some((_, version)) = &applied {
            ctx.versions.merge(key, *version);
        }
        self.seen.remember(
            request.command_id,
            AppliedCommand {
                result: request.result.clone(),
                version: Some(request.version),
                payload: Some(request.payload.clone()),
            },
        );

        match applied {
            Some((value, version)) => {
                ctx.metrics.backups_applied.inc();
                ctx.events.fire(&EntryEvent::new(
                    key.clone(),
                    previous,
                    value,
                    version,
                    EventOrigin::Backup,
                ));
                Ok(BackupAck { applied: true })
            }
            None => {
                trace!(
                    node_id = ctx.node_id,
                    command_id = %request.command_id,
                    key = %key,
                    "Backup payload older than local copy"
                );
                Ok(BackupAck { applied: false })
            }
        }
    }

    async fn attempt_read(&self, key: &EntryKey) -> Result<Option<CacheEntry>> {
        self.ctx.monitor.check_read()?;

        let (view, owners) = self.ctx.owners(key);
        let primary = *owners.first().ok_or(DistributionError::NoOwners)?;
        if primary == self.ctx.node_id {
            return Ok(self.ctx.storage.get(key).await?);
        }

        let request = Message::Read(ReadRequest {
            key: key.clone(),
            topology_id: view.topology_id,
        });
        let deadline = self.ctx.config.replication.backup_timeout;
        match self.request_primary(primary, request, deadline).await? {
            Message::ReadResponse(result) => result.map_err(Error::from),
            other => Err(NetworkError::UnexpectedReply(other.name().to_string()).into()),
        }
    }

    /// Serve a read from another node.
    pub async fn handle_read(&self, request: ReadRequest) -> Result<Option<CacheEntry>> {
        self.ctx.monitor.check_read()?;

        let local = self.ctx.monitor.topology_id();
        if request.topology_id > local {
            return Err(DistributionError::TopologyAhead {
                command: request.topology_id,
                current: local,
            }
            .into());
        }
        let (_, owners) = self.ctx.owners(&request.key);
        match owners.first() {
            Some(&primary) if primary == self.ctx.node_id => {
                Ok(self.ctx.storage.get(&request.key).await?)
            }
            other => Err(DistributionError::NotPrimary {
                primary: other.copied(),
            }
            .into()),
        }
    }
}

/// Send a backup command to every backup and count acknowledgments.
///
/// A transient rejection is returned as an error only when it leaves the ack
/// count short, so the caller retries under a refreshed view.
async fn send_backups(
    ctx: &NodeContext,
    request: &BackupRequest,
    backups: &[NodeId],
    required: usize,
) -> Result<usize> {
    let timeout = ctx.config.replication.backup_timeout;
    let sends = backups.iter().map(|&backup| {
        let msg = Message::Backup(request.clone());
        async move {
            ctx.metrics.backups_sent.inc();
            let reply = tokio::time::timeout(timeout, ctx.transport.request(backup, msg)).await;
            (backup, reply)
        }
    });
    let replies = futures::future::join_all(sends).await;

    let mut acked = 0;
    let mut transient: Option<Error> = None;
    for (backup, reply) in replies {
        match reply {
            Ok(Ok(Message::BackupReply(Ok(_)))) => {
                acked += 1;
                ctx.metrics.backup_acks.inc();
            }
            Ok(Ok(Message::BackupReply(Err(failure)))) => {
                let err = Error::from(failure);
                debug!(
                    node_id = ctx.node_id,
                    backup,
                    command_id = %request.command_id,
                    error = %err,
                    "Backup rejected command"
                );
                if err.is_transient() {
                    transient = Some(err);
                }
            }
            Ok(Ok(other)) => {
                debug!(backup, reply = other.name(), "Unexpected backup reply");
            }
            Ok(Err(e)) => {
                debug!(
                    node_id = ctx.node_id,
                    backup,
                    error = %e,
                    "Backup unreachable"
                );
            }
            Err(_) => {
                debug!(node_id = ctx.node_id, backup, "Backup timed out");
            }
        }
    }

    if acked < required {
        if let Some(err) = transient {
            return Err(err);
        }
    }
    Ok(acked)
}

impl std::fmt::Debug for TriangleDispatcher {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TriangleDispatcher")
            .field("node_id", &self.ctx.node_id)
            .field("seen", &self.seen.len())
            .finish()
    }
}
