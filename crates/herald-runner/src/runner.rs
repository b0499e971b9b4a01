//! Agent lifecycle.
//!
//! [`Runner`] wires the configuration to the collaborators: loads adapters
//! (skipping any that fail), announces the available tools, starts one
//! consumer per subscribe entry (platform subscription or adapter source),
//! and tears everything down on shutdown without deadlocking on a source
//! loop that never yields.

use std::sync::Arc;

use chrono::Utc;
use tokio::sync::mpsc;

use herald_config::Config;
use herald_plugin::{LogSink, PluginManager};

use crate::broker::ToolBroker;
use crate::error::{Result, RunnerError};
use crate::events::{Event, EventBus};
use crate::handler::MessageHandler;
use crate::platform::{Platform, SubscribeMessage};

/// Runs one configured agent until shutdown.
pub struct Runner {
    cfg: Arc<Config>,
    platform: Arc<dyn Platform>,
    broker: Option<Arc<dyn ToolBroker>>,
    plugins: Arc<PluginManager>,
    handler: Arc<MessageHandler>,
    events: Option<EventBus>,
}

impl Runner {
    /// Builds the runner: loads every configured adapter (a failing adapter
    /// is logged and skipped, the rest keep working) and constructs the
    /// orchestrator. The platform is expected to be connected already.
    pub async fn new(
        cfg: Config,
        platform: Arc<dyn Platform>,
        broker: Option<Arc<dyn ToolBroker>>,
        events: Option<EventBus>,
    ) -> Result<Self> {
        let cfg = Arc::new(cfg);

        let plugins = Arc::new(match &events {
            Some(events) => {
                let events = events.clone();
                let sink: LogSink = Arc::new(move |level, message| {
                    events.send(Event::Log {
                        time: Utc::now(),
                        level: level.to_owned(),
                        message: message.to_owned(),
                    });
                });
                PluginManager::with_log_sink(sink)
            }
            None => PluginManager::new(),
        });

        for definition in &cfg.agent.plugins {
            if let Err(e) = plugins.load(definition).await {
                tracing::error!(plugin = %definition.name, error = %e, "skipping plugin");
            }
        }

        let handler = Arc::new(MessageHandler::new(
            Arc::clone(&cfg),
            Arc::clone(&platform),
            broker.clone(),
            Some(Arc::clone(&plugins)),
            events.clone(),
        )?);

        Ok(Self {
            cfg,
            platform,
            broker,
            plugins,
            handler,
            events,
        })
    }

    /// The message handler, used by interactive frontends for direct chat,
    /// publish, request, and watch operations.
    pub fn handler(&self) -> Arc<MessageHandler> {
        Arc::clone(&self.handler)
    }

    /// The runner's configuration.
    pub fn config(&self) -> &Config {
        &self.cfg
    }

    fn emit(&self, event: Event) {
        if let Some(events) = &self.events {
            events.send(event);
        }
    }

    /// Starts every consumer and parks until `shutdown` resolves, then tears
    /// the agent down.
    pub async fn run(&self, shutdown: impl Future<Output = ()> + Send) -> Result<()> {
        self.emit(Event::Status {
            time: Utc::now(),
            connected: true,
            agent_name: self.cfg.agent.name.clone(),
            detail: None,
        });

        if let Some(broker) = &self.broker {
            let tools = broker.tools_info();
            tracing::info!(count = tools.len(), "tools available");
            self.emit(Event::ToolsAvailable {
                time: Utc::now(),
                tools,
            });
        }

        let mut consumers = Vec::new();
        for topic in &self.cfg.agent.topics.subscribe {
            consumers.push(self.start_consumer(topic).await?);
        }

        tracing::info!(
            agent = %self.cfg.agent.name,
            subscriptions = ?self.cfg.agent.topics.subscribe,
            "agent running"
        );

        shutdown.await;
        tracing::info!("shutting down");

        for consumer in consumers {
            consumer.abort();
        }

        self.handler.stop_watching().await;
        self.plugins.close_all();
        if let Some(broker) = &self.broker {
            broker.close().await;
        }
        if let Err(e) = self.platform.close().await {
            tracing::warn!(error = %e, "platform close failed");
        }

        self.emit(Event::Status {
            time: Utc::now(),
            connected: false,
            agent_name: self.cfg.agent.name.clone(),
            detail: Some("shutdown".into()),
        });

        Ok(())
    }

    /// Starts one consumer task for a subscribe entry.
    ///
    /// Events from one source are processed sequentially (the pipeline is
    /// non-reentrant per event); distinct sources run concurrently on their
    /// own tasks.
    async fn start_consumer(&self, topic: &str) -> Result<tokio::task::JoinHandle<()>> {
        let handler = Arc::clone(&self.handler);

        if self.plugins.is_plugin(topic) {
            // Adapter source: the emit callback only enqueues, so the
            // adapter's loop never waits on the pipeline.
            tracing::info!(plugin = %topic, "starting plugin source");
            let (tx, mut rx) = mpsc::unbounded_channel::<SubscribeMessage>();

            let source_topic = topic.to_owned();
            self.plugins.start_source(topic, move |data| {
                let _ = tx.send(SubscribeMessage::new(source_topic.clone(), data.into_bytes()));
            })?;

            Ok(tokio::spawn(async move {
                while let Some(msg) = rx.recv().await {
                    handler.handle(msg).await;
                }
            }))
        } else {
            tracing::info!(topic = %topic, "subscribing to topic");
            let mut subscription =
                self.platform
                    .subscribe(topic)
                    .await
                    .map_err(|e| RunnerError::Platform {
                        reason: format!("failed to subscribe to {topic}: {e}"),
                    })?;

            Ok(tokio::spawn(async move {
                while let Some(msg) = subscription.recv().await {
                    handler.handle(msg).await;
                }
            }))
        }
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
