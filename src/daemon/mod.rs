//! Daemon orchestration
//!
//! The [`Daemon`] owns the top-level state machine: it brings up the DNS
//! proxy, the port-53 remap and every configured group, then multiplexes
//! shutdown, link events, background-task errors and netfilter-flush
//! notifications in one select loop. Teardown is unconditional and
//! error-accumulating: a failed step is reported, never a reason to leave
//! the rest of the kernel state behind.

pub mod notify;

use std::net::{Ipv4Addr, SocketAddr};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use parking_lot::{Mutex, RwLock};
use tokio::sync::{broadcast, mpsc};
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

use crate::config::{Config, GroupSpec};
use crate::error::{DaemonError, RoutemarkError};
use crate::group::{Group, GroupRegistry};
use crate::nf::{JournaledDriver, LinkChange, LinkEvent, NetfilterDriver, PortRemap};
use crate::proxy::{DnsProxy, MessageHandler};
use crate::reconciler::Reconciler;
use crate::store::RecordStore;

pub use notify::{parse_notice, FlushNotice, NotifyListener};

/// The routemark daemon
pub struct Daemon {
    config: Config,
    driver: Arc<JournaledDriver>,
    store: Arc<RecordStore>,
    groups: Arc<RwLock<GroupRegistry>>,
    reconciler: Arc<Reconciler>,
    port_remap: Mutex<Option<Arc<PortRemap>>>,
    proxy_addr: Mutex<Option<SocketAddr>>,
    running: AtomicBool,
    shutdown_tx: broadcast::Sender<()>,
}

impl Daemon {
    /// Build a daemon over a netfilter driver and register the configured
    /// groups
    ///
    /// # Errors
    ///
    /// Returns [`DaemonError::GroupIdConflict`] when the configuration
    /// carries duplicate group ids.
    pub fn new(
        config: Config,
        driver: Arc<dyn NetfilterDriver>,
    ) -> Result<Self, RoutemarkError> {
        let driver = Arc::new(JournaledDriver::new(driver));
        let store = Arc::new(RecordStore::new());
        let groups = Arc::new(RwLock::new(GroupRegistry::default()));
        let reconciler = Arc::new(Reconciler::new(
            Arc::clone(&store),
            Arc::clone(&groups),
            config.minimal_ttl(),
        ));
        let (shutdown_tx, _) = broadcast::channel(4);

        let daemon = Self {
            driver,
            store,
            groups,
            reconciler,
            port_remap: Mutex::new(None),
            proxy_addr: Mutex::new(None),
            running: AtomicBool::new(false),
            shutdown_tx,
            config,
        };

        for spec in daemon.config.groups.clone() {
            daemon.register_group(spec)?;
        }

        Ok(daemon)
    }

    /// The record store backing the reconciler
    #[must_use]
    pub fn store(&self) -> &Arc<RecordStore> {
        &self.store
    }

    /// The journaled driver every kernel operation goes through
    #[must_use]
    pub fn driver(&self) -> &Arc<JournaledDriver> {
        &self.driver
    }

    /// Address the proxy listener bound to, once running
    #[must_use]
    pub fn proxy_addr(&self) -> Option<SocketAddr> {
        *self.proxy_addr.lock()
    }

    /// Whether the daemon's run loop is active
    #[must_use]
    pub fn is_running(&self) -> bool {
        self.running.load(Ordering::SeqCst)
    }

    /// A handle that stops the daemon when fired
    #[must_use]
    pub fn shutdown_handle(&self) -> broadcast::Sender<()> {
        self.shutdown_tx.clone()
    }

    /// Request shutdown
    pub fn shutdown(&self) {
        let _ = self.shutdown_tx.send(());
    }

    fn register_group(&self, spec: GroupSpec) -> Result<Arc<Group>, RoutemarkError> {
        let group = Arc::new(Group::new(
            spec,
            Arc::clone(&self.driver) as Arc<dyn NetfilterDriver>,
            &self.config.chain_prefix,
            &self.config.ipset_prefix,
            self.config.use_software_routing,
        ));
        let id = group.id();
        if !self.groups.write().insert(Arc::clone(&group)) {
            return Err(DaemonError::GroupIdConflict(id).into());
        }
        Ok(group)
    }

    /// Register a group at runtime
    ///
    /// While the daemon runs, an enabled group is brought up immediately and
    /// its IP-set is synchronized from the record store.
    pub async fn add_group(&self, spec: GroupSpec) -> Result<(), RoutemarkError> {
        let enabled = spec.enabled;
        let group = self.register_group(spec)?;

        if self.is_running() && enabled {
            group.enable().await.map_err(RoutemarkError::from)?;
            self.reconciler.sync_group(&group).await;
        }
        Ok(())
    }

    /// Look up a registered group
    #[must_use]
    pub fn group(&self, id: u32) -> Option<Arc<Group>> {
        self.groups.read().get(id)
    }

    /// Run until shutdown or a fatal error, then tear everything down
    ///
    /// # Errors
    ///
    /// Returns [`DaemonError::AlreadyRunning`] on a second concurrent call;
    /// otherwise the first fatal error, or accumulated teardown errors.
    pub async fn run(&self) -> Result<(), RoutemarkError> {
        if self.running.swap(true, Ordering::SeqCst) {
            return Err(DaemonError::AlreadyRunning.into());
        }

        let result = self.serve().await;

        // Stop background tasks whether we got here via shutdown or error.
        let _ = self.shutdown_tx.send(());
        let teardown_errors = self.teardown().await;
        for err in &teardown_errors {
            error!(error = %err, "teardown error");
        }

        self.running.store(false, Ordering::SeqCst);

        match result {
            Err(e) => Err(e),
            Ok(()) if teardown_errors.is_empty() => Ok(()),
            Ok(()) => Err(DaemonError::Teardown {
                errors: teardown_errors,
            }
            .into()),
        }
    }

    async fn serve(&self) -> Result<(), RoutemarkError> {
        let (err_tx, mut err_rx) = mpsc::channel::<RoutemarkError>(4);
        let mut shutdown_rx = self.shutdown_tx.subscribe();

        // Subscribe before bring-up so no link flap between group enable and
        // the select loop is lost.
        let mut links = self.driver.subscribe_links();
        let mut links_closed = false;

        // DNS proxy
        let proxy = DnsProxy::bind(
            SocketAddr::from((Ipv4Addr::UNSPECIFIED, self.config.listen_port)),
            self.config.target_dns_server_address.clone(),
            Some(Arc::clone(&self.reconciler) as Arc<dyn MessageHandler>),
        )
        .await
        .map_err(RoutemarkError::from)?;
        let proxy_addr = proxy.local_addr();
        *self.proxy_addr.lock() = Some(proxy_addr);

        let proxy = Arc::new(proxy);
        let proxy_task = {
            let proxy = Arc::clone(&proxy);
            let shutdown = self.shutdown_tx.subscribe();
            tokio::spawn(async move { proxy.run(shutdown).await })
        };
        tokio::spawn(monitor_task("dns proxy", proxy_task, err_tx.clone()));

        // Port remap: clients' port-53 traffic lands on the proxy port
        let remap = Arc::new(PortRemap::new(
            Arc::clone(&self.driver) as Arc<dyn NetfilterDriver>,
            format!("{}DNSOR", self.config.chain_prefix),
            53,
            proxy_addr.port(),
        ));
        remap.enable().await.map_err(RoutemarkError::from)?;
        *self.port_remap.lock() = Some(remap);

        // Groups
        let groups = self.groups.read().all();
        for group in groups {
            if group.spec().enabled {
                group.enable().await.map_err(RoutemarkError::from)?;
            }
        }

        // Flush notifications
        let listener = NotifyListener::bind(&self.config.notify_socket_path)?;
        let (notice_tx, mut notice_rx) = mpsc::channel::<FlushNotice>(8);
        tokio::spawn(listener.run(notice_tx, self.shutdown_tx.subscribe()));

        info!(proxy = %proxy_addr, "routemark running");

        loop {
            tokio::select! {
                _ = shutdown_rx.recv() => {
                    info!("shutdown requested");
                    return Ok(());
                }
                err = err_rx.recv() => {
                    if let Some(err) = err {
                        error!(error = %err, "fatal background error");
                        return Err(err);
                    }
                }
                event = links.recv(), if !links_closed => {
                    match event {
                        Ok(event) => self.handle_link_event(&event).await,
                        Err(broadcast::error::RecvError::Lagged(missed)) => {
                            warn!(missed, "link event stream lagged");
                        }
                        Err(broadcast::error::RecvError::Closed) => {
                            warn!("link event stream closed");
                            links_closed = true;
                        }
                    }
                }
                notice = notice_rx.recv() => {
                    if let Some(notice) = notice {
                        self.handle_flush_notice(&notice).await;
                    }
                }
            }
        }
    }

    async fn handle_link_event(&self, event: &LinkEvent) {
        debug!(
            interface = %event.name,
            index = event.index,
            up = event.up,
            "link event"
        );
        if !event.up || event.change == LinkChange::Removed {
            return;
        }

        let groups = self.groups.read().all();
        for group in groups {
            if group.interface() != event.name || !group.is_enabled() {
                continue;
            }
            if let Err(e) = group.handle_interface_up().await {
                error!(group = group.id(), error = %e, "interface-up handling failed");
            }
        }
    }

    async fn handle_flush_notice(&self, notice: &FlushNotice) {
        info!(table = %notice.table, event = %notice.event, "netfilter flushed, reinstalling");

        let remap = self.port_remap.lock().clone();
        if let Some(remap) = remap {
            if remap.is_enabled() {
                if let Err(e) = remap.install_for_table(&notice.table).await {
                    error!(error = %e, "port remap reinstall failed");
                }
            }
        }

        let groups = self.groups.read().all();
        for group in groups {
            if !group.is_enabled() {
                continue;
            }
            if let Err(e) = group.reinstall_for_table(&notice.table).await {
                error!(group = group.id(), error = %e, "group reinstall failed");
            }
        }
    }

    async fn teardown(&self) -> Vec<String> {
        let mut errors = Vec::new();

        let groups = self.groups.read().all_reversed();
        for group in groups {
            if !group.is_enabled() {
                continue;
            }
            for err in group.disable().await {
                errors.push(format!("group {}: {err}", group.id()));
            }
        }

        let remap = self.port_remap.lock().take();
        if let Some(remap) = remap {
            for err in remap.disable().await {
                errors.push(format!("port remap: {err}"));
            }
        }

        // The notify listener unlinks its own socket; this covers the case
        // where it never got to run.
        if let Err(e) = std::fs::remove_file(&self.config.notify_socket_path) {
            if e.kind() != std::io::ErrorKind::NotFound {
                errors.push(format!("notification socket: {e}"));
            }
        }

        *self.proxy_addr.lock() = None;
        errors
    }
}

/// Forward a background task's outcome to the daemon error channel
///
/// Panics are caught here and surfaced as errors; they never take the
/// process down.
async fn monitor_task<E>(
    name: &'static str,
    handle: JoinHandle<Result<(), E>>,
    err_tx: mpsc::Sender<RoutemarkError>,
) where
    E: Into<RoutemarkError>,
{
    match handle.await {
        Ok(Ok(())) => {}
        Ok(Err(e)) => {
            let _ = err_tx.send(e.into()).await;
        }
        Err(join_err) if join_err.is_panic() => {
            let _ = err_tx.send(DaemonError::TaskPanicked(name).into()).await;
        }
        Err(_) => {} // cancelled during shutdown
    }
}
