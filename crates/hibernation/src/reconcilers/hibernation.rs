use std::{sync::Arc, time::Duration};

use chrono::{DateTime, Utc};
use futures::Stream;
use garde::Validate;
use kube::{
    Api, Client, ResourceExt,
    runtime::{
        Controller,
        controller::{Action, Error as ControllerError},
        reflector::ObjectRef,
        watcher,
    },
};
use tracing::{Level, instrument};

use crate::{
    Error, Result,
    actuator::ActuatorRegistry,
    admission::{CsrHelper, NodeCsrHelper},
    api::{ClusterDeployment, ClusterSync},
    config::HibernationConfig,
    hibernation::{HibernationMachine, Outcome},
    remote::{KubeconfigSecretBuilder, RemoteClientBuilder},
    store::{ClusterStore, KubeStore},
};

/// Retry delay for transient failures
const ERROR_REQUEUE: Duration = Duration::from_secs(10);

/// Drives the power lifecycle of one cluster deployment per call.
pub struct HibernationReconciler {
    store: Arc<dyn ClusterStore>,
    actuators: ActuatorRegistry,
    remote: Arc<dyn RemoteClientBuilder>,
    csr: Arc<dyn CsrHelper>,
    config: HibernationConfig,
}

impl HibernationReconciler {
    pub fn new(
        store: Arc<dyn ClusterStore>,
        actuators: ActuatorRegistry,
        remote: Arc<dyn RemoteClientBuilder>,
        csr: Arc<dyn CsrHelper>,
        config: HibernationConfig,
    ) -> Self {
        Self {
            store,
            actuators,
            remote,
            csr,
            config,
        }
    }

    /// Reconcile the named cluster. `Ok(Some(d))` asks to be called again after `d`.
    #[instrument(level = Level::DEBUG, skip(self, now))]
    pub async fn reconcile(
        &self,
        namespace: &str,
        name: &str,
        now: DateTime<Utc>,
    ) -> Result<Option<Duration>> {
        let Some(mut cluster) = self.store.get_cluster(namespace, name).await? else {
            tracing::debug!("cluster deployment not found");
            return Ok(None);
        };
        if cluster.metadata.deletion_timestamp.is_some() {
            tracing::debug!("cluster is being deleted");
            return Ok(None);
        }
        if !cluster.spec.installed {
            tracing::debug!("cluster is not installed");
            return Ok(None);
        }
        cluster.spec.validate()?;

        let syncsets_applied = self
            .store
            .get_sync(namespace, name)
            .await?
            .is_some_and(|sync| sync.syncsets_applied());
        let actuator = self.actuators.select(&cluster)?;

        let machine = HibernationMachine {
            actuator: actuator.as_ref(),
            remote: self.remote.as_ref(),
            csr: self.csr.as_ref(),
            config: &self.config,
        };
        let outcome = machine.evaluate(&cluster, syncsets_applied, now).await?;
        self.persist(&mut cluster, &outcome, now).await?;

        match outcome.error {
            Some(error) => Err(error),
            None => Ok(outcome.requeue_after),
        }
    }

    /// Write what changed. Unchanged conditions are not written.
    async fn persist(
        &self,
        cluster: &mut ClusterDeployment,
        outcome: &Outcome,
        now: DateTime<Utc>,
    ) -> Result<()> {
        let power_state = outcome
            .power_state
            .filter(|state| cluster.spec.power_state != Some(*state));
        if let Some(power_state) = power_state {
            tracing::info!(?power_state, "setting desired power state");
            cluster.spec.power_state = Some(power_state);
            *cluster = self.store.update_cluster(cluster).await?;
        }

        if let Some((reason, message)) = &outcome.condition {
            if cluster.conditions_mut().set_hibernation(*reason, message, now) {
                tracing::info!(
                    %reason,
                    condition_message = %message,
                    "updating hibernating condition"
                );
                self.store.update_cluster_status(cluster).await?;
            }
        }
        Ok(())
    }
}

struct ReconcilerCtx {
    reconciler: HibernationReconciler,
}

pub fn control_loop(
    client: Client,
    config: HibernationConfig,
) -> impl Stream<
    Item = Result<(ObjectRef<ClusterDeployment>, Action), ControllerError<Error, watcher::Error>>,
> {
    let clusters = Api::<ClusterDeployment>::all(client.clone());
    let syncs = Api::<ClusterSync>::all(client.clone());

    let context = Arc::new(ReconcilerCtx {
        reconciler: HibernationReconciler::new(
            Arc::new(KubeStore::new(client.clone())),
            ActuatorRegistry::builtin(),
            Arc::new(KubeconfigSecretBuilder::new(client)),
            Arc::new(NodeCsrHelper::default()),
            config,
        ),
    });

    Controller::new(clusters, watcher::Config::default())
        // A ClusterSync shares its cluster deployment's name
        .watches(syncs, watcher::Config::default(), |sync| {
            let namespace = sync.namespace()?;
            Some(ObjectRef::new(&sync.name_any()).within(&namespace))
        })
        .shutdown_on_signal()
        .run(reconcile, error_policy, context)
}

#[instrument(level = Level::DEBUG, skip_all, fields(cluster = %cluster.name_any()))]
async fn reconcile(cluster: Arc<ClusterDeployment>, context: Arc<ReconcilerCtx>) -> Result<Action> {
    tracing::info!("Reconciling...");

    let namespace = cluster.metadata.namespace.as_deref().ok_or(Error::MissingField)?;
    let name = cluster.metadata.name.as_deref().ok_or(Error::MissingField)?;

    Ok(
        match context.reconciler.reconcile(namespace, name, Utc::now()).await? {
            Some(after) => Action::requeue(after),
            None => Action::await_change(),
        },
    )
}

fn error_policy(
    _object: Arc<ClusterDeployment>,
    error: &Error,
    _context: Arc<ReconcilerCtx>,
) -> Action {
    requeue_for(error)
}

fn requeue_for(error: &Error) -> Action {
    if error.is_fatal() {
        tracing::error!("not retrying until the cluster changes: {error}");
        return Action::await_change();
    }
    Action::requeue(error.requeue_after().unwrap_or(ERROR_REQUEUE))
}
