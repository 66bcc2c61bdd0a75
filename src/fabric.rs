//! Fabric — the context holding every bus, queue and handler registration
//!
//! Built once from a `FabricConfig`. Queues are created first (dead-letter
//! queues before the queues that redrive into them), then buses, then rules,
//! whose target capabilities are resolved as they are attached.

use crate::access::AccessPolicy;
use crate::bus::EventBus;
use crate::clock::{Clock, SystemClock};
use crate::config::{FabricConfig, PARTNER_BUS_ALIAS};
use crate::dispatcher::{Dispatcher, DispatcherHandle, DispatcherOptions, Handler};
use crate::dlq::{DlqHandler, MemoryDlqHandler, QueueDlqHandler};
use crate::error::{FabricError, Result};
use crate::partner::PartnerFeed;
use crate::queue::{DurableQueue, RedrivePolicy};
use crate::router::{PublishReceipt, Router};
use crate::rule::{Rule, RuleHandle};
use crate::state::{FileQueueStore, QueueStore};
use crate::types::{Event, IngestRecord};
use std::collections::{HashMap, HashSet};
use std::sync::{Arc, Mutex};

/// Builds a `Fabric`, optionally overriding the clock or queue store
pub struct FabricBuilder {
    config: FabricConfig,
    clock: Arc<dyn Clock>,
    store: Option<Arc<dyn QueueStore>>,
}

impl FabricBuilder {
    pub fn with_clock(mut self, clock: Arc<dyn Clock>) -> Self {
        self.clock = clock;
        self
    }

    /// Persist queues to `store` instead of the configured `stateDir`
    pub fn with_store(mut self, store: Arc<dyn QueueStore>) -> Self {
        self.store = Some(store);
        self
    }

    pub fn build(self) -> Result<Fabric> {
        let config = self.config;
        let clock = self.clock;
        config.validate()?;
        let partner = config.partner_feed()?;

        let store = self.store.or_else(|| {
            config
                .state_dir
                .as_ref()
                .map(|dir| Arc::new(FileQueueStore::new(dir)) as Arc<dyn QueueStore>)
        });

        let new_queue = |name: &str| -> Result<DurableQueue> {
            let options = config
                .queue_config(name)
                .map(|q| q.options())
                .unwrap_or_default();
            let queue = DurableQueue::new(name, options).with_clock(clock.clone());
            match &store {
                Some(store) => queue.with_store(store.clone()),
                None => Ok(queue),
            }
        };

        let mut queues: HashMap<String, Arc<DurableQueue>> = HashMap::new();
        for queue in config.queues.iter().filter(|q| q.redrive.is_none()) {
            queues.insert(queue.name.clone(), Arc::new(new_queue(&queue.name)?));
        }

        let mut dead_letters: HashMap<String, Arc<dyn DlqHandler>> = HashMap::new();
        for queue in &config.queues {
            let Some(redrive) = &queue.redrive else {
                continue;
            };
            let handler: Arc<dyn DlqHandler> = match &redrive.dead_letter_queue {
                Some(dlq) => {
                    let target = queues.get(dlq).cloned().ok_or_else(|| {
                        FabricError::Config(format!("Dead-letter queue not found: {}", dlq))
                    })?;
                    Arc::new(QueueDlqHandler::new(target))
                }
                None => Arc::new(MemoryDlqHandler::default()),
            };
            let durable = new_queue(&queue.name)?.with_redrive(RedrivePolicy {
                max_receive_count: redrive.max_receive_count,
                handler: handler.clone(),
            });
            dead_letters.insert(queue.name.clone(), handler);
            queues.insert(queue.name.clone(), Arc::new(durable));
        }

        let buses = std::iter::once(partner.bus_name())
            .chain(config.buses.iter().map(|b| b.name.as_str()))
            .map(|name| Arc::new(EventBus::new(name)))
            .collect::<Vec<_>>();

        let router = Router::new(
            buses,
            queues.into_values(),
            AccessPolicy::new(config.roles.clone()),
            config.max_hops,
        );

        for rule in &config.rules {
            router.attach_rule(
                rule.bus_name(partner.bus_name()),
                rule.to_rule(partner.bus_name())?,
            )?;
        }

        tracing::info!(
            partner_bus = %partner.bus_name(),
            buses = router.bus_names().len(),
            queues = router.queue_names().len(),
            rules = config.rules.len(),
            persistent = store.is_some(),
            "Fabric built"
        );

        Ok(Fabric {
            router,
            partner,
            config,
            dead_letters,
            handlers: Mutex::new(HashSet::new()),
        })
    }
}

/// The assembled event fabric
pub struct Fabric {
    router: Router,
    partner: PartnerFeed,
    config: FabricConfig,
    dead_letters: HashMap<String, Arc<dyn DlqHandler>>,
    /// Queues that already have a handler
    handlers: Mutex<HashSet<String>>,
}

impl Fabric {
    pub fn builder(config: FabricConfig) -> FabricBuilder {
        FabricBuilder {
            config,
            clock: Arc::new(SystemClock),
            store: None,
        }
    }

    pub fn from_config(config: FabricConfig) -> Result<Self> {
        Self::builder(config).build()
    }

    pub fn router(&self) -> &Router {
        &self.router
    }

    pub fn partner(&self) -> &PartnerFeed {
        &self.partner
    }

    pub fn config(&self) -> &FabricConfig {
        &self.config
    }

    /// Look up a bus; `$partner` names the partner bus
    pub fn bus(&self, name: &str) -> Option<Arc<EventBus>> {
        self.router.bus(self.bus_name(name))
    }

    pub fn queue(&self, name: &str) -> Option<Arc<DurableQueue>> {
        self.router.queue(name)
    }

    /// Dead-letter handler of a queue with a redrive policy
    pub fn dead_letters(&self, queue: &str) -> Option<Arc<dyn DlqHandler>> {
        self.dead_letters.get(queue).cloned()
    }

    /// Publish an event on a bus (`$partner` names the partner bus)
    pub async fn publish(&self, bus: &str, event: Event) -> Result<PublishReceipt> {
        let bus = self.bus_name(bus);
        tracing::debug!(
            bus = %bus,
            event_id = %event.id,
            source = %event.source,
            "Publishing event"
        );
        self.router.publish(bus, event).await
    }

    /// Accept an event from the partner feed
    pub async fn ingest_partner(&self, event: Event) -> Result<PublishReceipt> {
        self.router.publish(self.partner.bus_name(), event).await
    }

    /// Publish one newline-delimited JSON `IngestRecord`
    pub async fn ingest_line(&self, line: &str) -> Result<PublishReceipt> {
        let record: IngestRecord = serde_json::from_str(line)?;
        let bus = record.bus.clone();
        self.publish(&bus, record.into_event()).await
    }

    pub fn attach_rule(&self, bus: &str, rule: Rule) -> Result<RuleHandle> {
        self.router.attach_rule(self.bus_name(bus), rule)
    }

    pub fn detach_rule(&self, handle: &RuleHandle) -> bool {
        self.router.detach_rule(handle)
    }

    /// Bind `handler` to `queue`
    ///
    /// Each queue accepts exactly one handler for the fabric's lifetime.
    pub fn register_handler(
        &self,
        queue: &str,
        handler: Arc<dyn Handler>,
        options: DispatcherOptions,
    ) -> Result<Dispatcher> {
        let durable = self
            .queue(queue)
            .ok_or_else(|| FabricError::Config(format!("Queue not found: {}", queue)))?;

        let mut handlers = self.handlers.lock().unwrap_or_else(|e| e.into_inner());
        if !handlers.insert(queue.to_string()) {
            return Err(FabricError::Config(format!(
                "Queue '{}' already has a handler",
                queue
            )));
        }
        drop(handlers);

        tracing::info!(queue = %queue, workers = options.workers, "Handler registered");
        Ok(Dispatcher::new(durable, handler, options))
    }

    /// Register `handler` on the configured dispatcher queue and start it
    pub fn start_dispatcher(&self, handler: Arc<dyn Handler>) -> Result<DispatcherHandle> {
        let dispatcher = self
            .config
            .dispatcher
            .as_ref()
            .ok_or_else(|| FabricError::Config("No dispatcher configured".to_string()))?;
        Ok(self
            .register_handler(&dispatcher.queue, handler, dispatcher.options())?
            .spawn())
    }

    fn bus_name<'a>(&'a self, name: &'a str) -> &'a str {
        if name == PARTNER_BUS_ALIAS {
            self.partner.bus_name()
        } else {
            name
        }
    }
}

impl std::fmt::Debug for Fabric {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Fabric")
            .field("partner", &self.partner)
            .field("router", &self.router)
            .finish()
    }
}
