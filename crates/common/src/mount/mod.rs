//! Lifecycle of a mounted room
//!
//! [`Mount::start`] wires the table, debouncer, sync engine and reclaimer
//! together, runs the initial catch-up and spawns the background tasks.
//! [`Mount::unmount`] stops all of them; pending attribute saves are
//! dropped rather than run.

use std::sync::Arc;
use std::time::Duration;

use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

use crate::auth::{AuthDefaults, WriteGate};
use crate::debounce::{Debouncer, ExpiryReceiver, DEFAULT_DEBOUNCE};
use crate::fragments::MAX_FRAGMENT_SIZE;
use crate::fs::MatrixFs;
use crate::reclaim::{CacheReclaimer, DEFAULT_INTERVAL, DEFAULT_RETENTION};
use crate::remote::{RemoteError, RoomStateProvider};
use crate::sync::{CatchUpStats, EchoFilter, SyncEngine};
use crate::table::PathTable;

#[derive(Debug, Clone)]
pub struct MountOptions {
    /// Follow live room changes after the catch-up
    pub listen: bool,
    /// Reclaimer retention in seconds; negative disables reclaiming
    pub retention_secs: i64,
    pub reclaim_interval: Duration,
    pub debounce: Duration,
    pub auth_defaults: AuthDefaults,
    /// Largest encoded payload stored inline or per fragment
    pub fragment_size: usize,
}

impl Default for MountOptions {
    fn default() -> Self {
        Self {
            listen: true,
            retention_secs: DEFAULT_RETENTION.as_secs() as i64,
            reclaim_interval: DEFAULT_INTERVAL,
            debounce: DEFAULT_DEBOUNCE,
            auth_defaults: AuthDefaults::default(),
            fragment_size: MAX_FRAGMENT_SIZE,
        }
    }
}

#[derive(Debug, thiserror::Error)]
pub enum MountError {
    #[error("initial synchronization failed: {0}")]
    CatchUp(#[from] RemoteError),
    #[error("fragment size must be at least 4 bytes, got {0}")]
    FragmentSize(usize),
}

pub struct Mount<P> {
    fs: MatrixFs<P>,
    sync: Arc<SyncEngine<P>>,
    debouncer: Debouncer,
    cancel: CancellationToken,
    stats: CatchUpStats,
    tasks: Vec<JoinHandle<()>>,
}

impl<P: RoomStateProvider> Mount<P> {
    pub async fn start(provider: P, options: MountOptions) -> Result<Self, MountError> {
        if options.fragment_size < 4 {
            return Err(MountError::FragmentSize(options.fragment_size));
        }

        let provider = Arc::new(provider);
        let table = Arc::new(PathTable::new());
        let gate = Arc::new(WriteGate::new());
        let (debouncer, expiries, debounce_worker) = Debouncer::spawn(options.debounce);
        let echoes = Arc::new(EchoFilter::new());
        let cancel = CancellationToken::new();

        let fs = MatrixFs::new(
            provider.clone(),
            table.clone(),
            gate.clone(),
            debouncer.clone(),
            echoes.clone(),
            options.fragment_size,
        );
        let sync = Arc::new(SyncEngine::new(
            provider.clone(),
            table.clone(),
            gate,
            debouncer.clone(),
            echoes,
            options.auth_defaults,
        ));

        tracing::info!("mounting room state as {}", provider.actor());
        let stats = match sync.catch_up().await {
            Ok(stats) => stats,
            Err(err) => {
                debouncer.shutdown();
                return Err(err.into());
            }
        };

        let mut tasks = vec![
            debounce_worker,
            tokio::spawn(save_debounced(fs.clone(), expiries, cancel.clone())),
        ];

        if options.listen {
            let sync = sync.clone();
            let cancel = cancel.clone();
            tasks.push(tokio::spawn(async move { sync.run(cancel).await }));
        } else {
            tracing::info!("not listening for room changes");
        }

        match CacheReclaimer::new(table, options.retention_secs) {
            Some(reclaimer) => {
                tasks.push(tokio::spawn(
                    reclaimer.run(options.reclaim_interval, cancel.clone()),
                ));
            }
            None => tracing::info!("cache reclaimer disabled"),
        }

        Ok(Self {
            fs,
            sync,
            debouncer,
            cancel,
            stats,
            tasks,
        })
    }

    /* Getters */

    pub fn fs(&self) -> &MatrixFs<P> {
        &self.fs
    }

    pub fn sync(&self) -> &SyncEngine<P> {
        &self.sync
    }

    pub fn catch_up_stats(&self) -> CatchUpStats {
        self.stats
    }

    /// Stop the listener, the reclaimer and every pending debounced save
    pub async fn unmount(self) {
        self.cancel.cancel();
        self.debouncer.shutdown();
        for task in self.tasks {
            if let Err(err) = task.await {
                tracing::warn!("background task ended abnormally: {}", err);
            }
        }
        tracing::info!("unmounted");
    }
}

async fn save_debounced<P: RoomStateProvider>(
    fs: MatrixFs<P>,
    expiries: ExpiryReceiver,
    cancel: CancellationToken,
) {
    loop {
        let expired = tokio::select! {
            _ = cancel.cancelled() => break,
            expired = expiries.recv() => expired,
        };
        match expired {
            Some(expired) => fs.save_expired(expired).await,
            None => break,
        }
    }
}
