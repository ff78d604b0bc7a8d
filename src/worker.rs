//! The offline worker: one handler per host event.
//!
//! Every handler is an `async fn`; the returned future covers all work the
//! event started, so a host that awaits it keeps the worker alive until that
//! work settles.

use color_eyre::{eyre::eyre, Result};
use std::sync::Arc;
use tokio::task::JoinSet;
use tracing::{debug, error, info, warn};

use crate::cache::{ActivationReport, CacheLifecycleManager, CacheStorage, ProvisionReport};
use crate::clients::{ClientRegistry, WindowAction};
use crate::config::Config;
use crate::error::{ActivationError, DurableStoreError, ProvisionError, TransportError};
use crate::event::{Event, EventHandler};
use crate::http::{resolve, Request, Response};
use crate::network::Network;
use crate::outbox::OutboxStore;
use crate::push::{Notification, CLICK_TARGET};
use crate::routes::RouteClassifier;
use crate::strategy::StrategyExecutor;
use crate::sync::{SyncOrchestrator, SyncOutcome, SyncTrigger};

pub struct OfflineWorker<S: CacheStorage> {
  config: Config,
  cache: Arc<CacheLifecycleManager<S>>,
  classifier: RouteClassifier,
  executor: StrategyExecutor<S>,
  outbox: Arc<OutboxStore>,
  sync: SyncOrchestrator,
  clients: Arc<ClientRegistry>,
}

impl<S: CacheStorage + 'static> OfflineWorker<S> {
  pub fn new(
    config: Config,
    storage: S,
    outbox: OutboxStore,
    network: Arc<dyn Network>,
  ) -> Result<Self> {
    let origin = config.origin_url()?;
    let orders_url = resolve(&origin, &config.orders_path)
      .map_err(|e| eyre!("Invalid orders path '{}': {}", config.orders_path, e))?;

    let cache = Arc::new(
      CacheLifecycleManager::new(storage, network.clone(), origin.clone())
        .with_vary_headers(config.vary_headers.clone()),
    );
    let outbox = Arc::new(outbox);
    let clients = Arc::new(ClientRegistry::default());

    let executor = StrategyExecutor::new(
      cache.clone(),
      network.clone(),
      outbox.clone(),
      clients.clone(),
      &config.offline_page,
    );
    let sync = SyncOrchestrator::new(outbox.clone(), network, clients.clone(), orders_url)
      .with_order_tags(config.sync.order_tags.clone())
      .with_max_attempts(config.outbox.max_attempts);
    let classifier = RouteClassifier::new(config.route_rules(), origin);

    Ok(Self {
      config,
      cache,
      classifier,
      executor,
      outbox,
      sync,
      clients,
    })
  }

  pub fn config(&self) -> &Config {
    &self.config
  }

  pub fn cache(&self) -> &Arc<CacheLifecycleManager<S>> {
    &self.cache
  }

  pub fn outbox(&self) -> &Arc<OutboxStore> {
    &self.outbox
  }

  pub fn clients(&self) -> &Arc<ClientRegistry> {
    &self.clients
  }

  /// Provision the configured cache version from the precache manifest.
  pub async fn install(&self) -> Result<ProvisionReport, ProvisionError> {
    let report = self
      .cache
      .provision_version(
        &self.config.cache_version,
        &self.config.precache,
        self.config.provision_policy,
      )
      .await?;
    if !report.is_complete() {
      warn!(
        namespace = %report.namespace,
        failed = report.failed.len(),
        "Install finished with missing assets"
      );
    }
    Ok(report)
  }

  /// Activate the configured version right away and take over open clients.
  pub async fn activate(&self) -> Result<ActivationReport, ActivationError> {
    let report = self.cache.activate(&self.config.cache_version)?;
    let claimed = self.clients.claim(&report.active);
    info!(active = %report.active, claimed, "Worker activated");
    Ok(report)
  }

  pub async fn fetch(&self, request: &Request) -> Result<Response, TransportError> {
    let route = self.classifier.classify(request);
    self.executor.execute(request, route).await
  }

  pub async fn sync(&self, trigger: &SyncTrigger) -> Result<SyncOutcome, DurableStoreError> {
    self.sync.on_sync(trigger).await
  }

  /// Turn a push payload into the notification to display.
  pub async fn push(&self, payload: &[u8]) -> Notification {
    let notification = Notification::from_payload(payload);
    info!(title = %notification.title, body = %notification.body, "Showing notification");
    notification
  }

  /// Close the notification and bring the portal root page forward.
  pub async fn notification_click(&self, notification: &Notification) -> WindowAction {
    debug!(body = %notification.body, "Notification clicked");
    self.clients.focus_or_open(CLICK_TARGET)
  }

  /// Consume events until every sender is gone.
  ///
  /// Install and activate are handled in arrival order; fetch, sync and push
  /// events each run on their own task. Those tasks are awaited before this
  /// returns, so a pass started by the last event still settles.
  pub async fn run(self: Arc<Self>, mut events: EventHandler) {
    let mut tasks = JoinSet::new();
    while let Some(event) = events.next().await {
      while let Some(finished) = tasks.try_join_next() {
        log_task_exit(finished);
      }
      match event {
        Event::Install => {
          if let Err(e) = self.install().await {
            error!(error = %e, "Install failed");
          }
        }
        Event::Activate => {
          if let Err(e) = self.activate().await {
            error!(error = %e, "Activation failed");
          }
        }
        Event::Fetch {
          request,
          respond_to,
        } => {
          let worker = self.clone();
          tasks.spawn(async move {
            let response = worker.fetch(&request).await;
            if respond_to.send(response).is_err() {
              debug!(url = %request.url, "Requester went away");
            }
          });
        }
        Event::Sync(trigger) => {
          let worker = self.clone();
          tasks.spawn(async move {
            if let Err(e) = worker.sync(&trigger).await {
              error!(tag = %trigger.tag, error = %e, "Sync pass failed");
            }
          });
        }
        Event::Push(payload) => {
          let worker = self.clone();
          tasks.spawn(async move {
            worker.push(&payload).await;
          });
        }
        Event::NotificationClick(notification) => {
          let action = self.notification_click(&notification).await;
          debug!(?action, "Notification click handled");
        }
      }
    }
    debug!(running = tasks.len(), "Event queue closed");
    while let Some(finished) = tasks.join_next().await {
      log_task_exit(finished);
    }
  }
}

fn log_task_exit(result: Result<(), tokio::task::JoinError>) {
  if let Err(e) = result {
    error!(error = %e, "Event task panicked");
  }
}
