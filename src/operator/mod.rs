//! Convergence controller
//!
//! The tick-driven state machine at the heart of the operator. Every
//! `check-interval` it evaluates the world (group membership, local store
//! health, peer states), then executes the first matching row of the
//! decision table, driving the local store through seed / join / snapshot /
//! stop transitions.

mod acl;
mod decision;
mod status;

pub use status::STATUS_PORT;

use anyhow::{Context, Result};
use std::sync::Arc;
use std::time::Duration;
use tokio::signal::unix::{signal, SignalKind};
use tokio::sync::RwLock;

use crate::config::Config;
use crate::etcd::{Client, Server, ServerConfig};
use crate::providers;
use crate::providers::asg::{self, instances_addresses, GroupStatus};
use crate::providers::snapshot::{Metadata, Provider as SnapshotProvider, SnapshotError};
use decision::{decide, Action, State, View};
use status::{SharedStatus, StatusPayload};

const IS_HEALTHY_RETRIES: usize = 3;
const IS_HEALTHY_TIMEOUT: Duration = Duration::from_secs(10);

pub struct Operator {
    cfg: Config,
    asg_provider: Box<dyn asg::Provider>,
    snapshot_provider: Option<Arc<dyn SnapshotProvider>>,
    server: Option<Arc<Server>>,
    status: SharedStatus,
    http: reqwest::Client,

    /// Best known snapshot, cached on first entry into START
    snapshot_info: Option<Metadata>,
    snapshot_info_cached: bool,
}

struct Evaluation {
    server: Arc<Server>,
    client: Option<Client>,
    view: View,
}

enum Flow {
    Continue,
    Exit,
}

impl Operator {
    pub async fn new(cfg: Config) -> Result<Self> {
        let asg_provider = providers::new_asg_provider(&cfg.asg)
            .await
            .context("failed to configure auto-scaling group provider")?;
        let snapshot_provider = providers::new_snapshot_provider(&cfg.snapshot)
            .await
            .context("failed to configure snapshot provider")?;

        // Peer polling shares the health probe's deadline.
        let http = reqwest::Client::builder()
            .timeout(IS_HEALTHY_TIMEOUT)
            .build()
            .context("failed to build http client")?;

        Ok(Self {
            cfg,
            asg_provider,
            snapshot_provider,
            server: None,
            status: Arc::new(RwLock::new(StatusPayload::default())),
            http,
            snapshot_info: None,
            snapshot_info_cached: false,
        })
    }

    /// Run the control loop until a SIGTERM lands or a fatal store failure
    /// surfaces.
    pub async fn run(&mut self) -> Result<()> {
        let status = Arc::clone(&self.status);
        tokio::spawn(async move {
            if let Err(e) = status::serve(status, STATUS_PORT).await {
                tracing::error!(error = %e, "status endpoint failed");
            }
        });

        let mut sigterm =
            signal(SignalKind::terminate()).context("failed to install SIGTERM handler")?;
        let mut shutdown = false;

        loop {
            match self.evaluate().await {
                Some(evaluation) => match self.execute(shutdown, &evaluation).await? {
                    Flow::Exit => return Ok(()),
                    Flow::Continue => {}
                },
                // A broken group provider must not hold up a shutdown: stop
                // whatever we own and leave.
                None if shutdown => {
                    if let Some(server) = &self.server {
                        server.stop(false, true).await;
                    }
                    return Ok(());
                }
                None => {}
            }

            tokio::select! {
                _ = tokio::time::sleep(self.cfg.check_interval) => {}
                _ = sigterm.recv() => {
                    tracing::info!("received SIGTERM, shutting down");
                    shutdown = true;
                }
            }
        }
    }

    /// Assemble this tick's view of the world. Returns `None` when the group
    /// provider cannot be polled; the tick is skipped.
    async fn evaluate(&mut self) -> Option<Evaluation> {
        let group = match self.asg_provider.group_status().await {
            Ok(group) => group,
            Err(e) => {
                tracing::error!(error = %e, "failed to sync auto-scaling group");
                return None;
            }
        };

        let addresses = instances_addresses(&group.instances);
        let client = match Client::new(
            &addresses,
            &self.cfg.etcd.client_transport_security,
            true,
        )
        .await
        {
            Ok(client) => Some(client),
            Err(e) => {
                tracing::warn!(error = %e, "failed to sync etcd cluster");
                None
            }
        };

        let server = match self.server.clone() {
            Some(server) => server,
            None => {
                let server = Arc::new(Server::new(
                    self.server_config(&group),
                    self.snapshot_provider.clone(),
                ));
                self.server = Some(Arc::clone(&server));
                server
            }
        };

        let healthy_probe = async {
            match &client {
                Some(client) => {
                    client
                        .is_healthy(IS_HEALTHY_RETRIES, IS_HEALTHY_TIMEOUT)
                        .await
                }
                None => false,
            }
        };
        let peers_probe = status::fetch_peer_states(&self.http, &group.instances);
        let (etcd_healthy, mut peer_states) = tokio::join!(healthy_probe, peers_probe);

        let is_seeder = decision::is_seeder(&mut peer_states, &group.self_instance.name);
        let states_ok = peer_states
            .iter()
            .filter(|peer| peer.state == State::Ok)
            .count();
        let states_start = peer_states
            .iter()
            .filter(|peer| peer.state == State::Start)
            .count();

        let view = View {
            cluster_size: group.size,
            etcd_running: server.is_running(),
            etcd_healthy,
            is_seeder,
            states_ok,
            states_start,
        };

        tracing::info!(
            instances = group.instances.len(),
            size = group.size,
            running = view.etcd_running,
            healthy = view.etcd_healthy,
            seeder = view.is_seeder,
            peers_ok = states_ok,
            peers_start = states_start,
            "evaluated cluster"
        );

        Some(Evaluation {
            server,
            client,
            view,
        })
    }

    /// Execute the first matching decision row; exactly one fires per tick.
    async fn execute(&mut self, shutdown: bool, evaluation: &Evaluation) -> Result<Flow> {
        let decision = decide(shutdown, &evaluation.view);
        let server = Arc::clone(&evaluation.server);

        let mut flow = Flow::Continue;
        match decision.action {
            Action::Shutdown { graceful } => {
                tracing::info!(graceful = graceful, "STATE: shutdown -> stop");
                server.stop(graceful, true).await;
                flow = Flow::Exit;
            }
            Action::Join => {
                tracing::info!("STATE: healthy + not running -> join");
                let client = evaluation
                    .client
                    .as_ref()
                    .context("no etcd client available to join with")?;
                server.join(client).await.context("failed to join cluster")?;
            }
            Action::Standby => {
                tracing::info!("STATE: healthy + running -> standby");
            }
            Action::WaitMajority => {
                tracing::info!("STATE: unhealthy locally, majority still OK -> standby");
            }
            Action::Leave => {
                tracing::info!("STATE: unhealthy + no majority -> snapshot + leave");
                server.stop(false, true).await;
            }
            Action::PrepareSeed => {
                tracing::info!("STATE: not running + no quorum -> awaiting seeder agreement");
                self.cache_snapshot_info(&server).await;
            }
            Action::Seed => {
                tracing::info!("STATE: all peers in START + elected seeder -> seed");
                self.cache_snapshot_info(&server).await;
                server
                    .seed(self.snapshot_info.clone())
                    .await
                    .context("failed to seed cluster")?;
            }
            Action::NoAdequateAction => {
                tracing::error!("no adequate action found");
            }
        }

        // Leaving START invalidates the cached snapshot info; the next
        // convergence starts from a fresh read.
        if decision.next_state != State::Start {
            self.snapshot_info = None;
            self.snapshot_info_cached = false;
        }

        let revision = match decision.next_state {
            State::Start => self
                .snapshot_info
                .as_ref()
                .map(|meta| meta.revision)
                .unwrap_or(0),
            _ => 0,
        };
        *self.status.write().await = StatusPayload {
            state: decision.next_state,
            revision,
        };

        if decision.next_state == State::Ok && evaluation.view.is_seeder {
            self.reconcile_acl(evaluation).await;
        }

        Ok(flow)
    }

    /// Read the best known snapshot once per START episode.
    async fn cache_snapshot_info(&mut self, server: &Arc<Server>) {
        if self.snapshot_info_cached {
            return;
        }

        match server.snapshot_info().await {
            Ok(meta) => {
                tracing::info!(
                    snapshot = %meta.filename(),
                    revision = meta.revision,
                    "found snapshot to seed from"
                );
                self.snapshot_info = Some(meta);
            }
            Err(SnapshotError::NoSnapshot) => {
                tracing::info!("no snapshot available, will seed from empty");
                self.snapshot_info = None;
            }
            Err(e) => {
                tracing::warn!(error = %e, "failed to read snapshot info");
                self.snapshot_info = None;
            }
        }
        self.snapshot_info_cached = true;
    }

    /// Post-action hook: the seeder reconciles the initial ACL while the
    /// cluster reports OK. Failures are logged, never fatal.
    async fn reconcile_acl(&self, evaluation: &Evaluation) {
        let acl = match &self.cfg.etcd.init_acl {
            Some(acl) => acl,
            None => return,
        };
        let client = match &evaluation.client {
            Some(client) => client,
            None => return,
        };
        let cert_file = match &self.cfg.etcd.client_transport_security.cert_file {
            Some(cert_file) => cert_file,
            None => {
                tracing::warn!("init-acl configured without a client certificate");
                return;
            }
        };

        if let Err(e) = acl::reconcile_init_acl(client, acl, cert_file).await {
            tracing::error!(error = %e, "failed to reconcile initial ACL");
        }
    }

    fn server_config(&self, group: &GroupStatus) -> ServerConfig {
        let self_instance = &group.self_instance;
        let public_address = self
            .cfg
            .etcd
            .advertise_address
            .clone()
            .unwrap_or_else(|| self_instance.address.clone());

        ServerConfig {
            name: self_instance.name.clone(),
            data_dir: self.cfg.etcd.data_dir.clone(),
            data_quota: self.cfg.etcd.backend_quota,
            public_address,
            private_address: self_instance.address.clone(),
            client_sc: self.cfg.etcd.client_transport_security.clone(),
            peer_sc: self.cfg.etcd.peer_transport_security.clone(),
            auto_compaction_mode: self.cfg.etcd.auto_compaction_mode.clone(),
            auto_compaction_retention: self.cfg.etcd.auto_compaction_retention.clone(),
            unhealthy_member_ttl: self.cfg.unhealthy_member_ttl,
            snapshot_interval: self.cfg.snapshot.interval,
            snapshot_ttl: self.cfg.snapshot.ttl,
        }
    }
}
