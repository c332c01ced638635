//! Wires the transport, responder, and poll scheduler together.
//!
//! Two long-lived activities share one outbound client: the subscription
//! loop (strictly sequential envelope handling) and the poll scheduler
//! task. Each persisted file has exactly one owning task, so no locking
//! is needed around the history or ledger writes.

use std::sync::Arc;
use std::time::Duration;

use anyhow::Result;
use tokio::sync::watch;
use tokio::task::JoinHandle;

use crate::config::BotConfig;
use crate::history::ChatStore;
use crate::llm::{LlmClient, TextGenerator};
use crate::poll::{PollLedger, PollManager};
use crate::responder::Responder;
use crate::scheduler::{run_poll_scheduler, ScheduleSpec};
use crate::signal::{Outbound, SignalClient};

const INITIAL_BACKOFF: Duration = Duration::from_secs(1);
const MAX_BACKOFF: Duration = Duration::from_secs(60);

pub struct BotRuntime {
    config: BotConfig,
    client: SignalClient,
    outbound: Arc<dyn Outbound>,
    generator: Arc<dyn TextGenerator>,
}

impl BotRuntime {
    /// Validate config and construct the shared clients. The returned
    /// runtime owns nothing persistent yet; stores are loaded by the
    /// loop that owns them.
    pub fn bootstrap(config: BotConfig) -> Result<Self> {
        config.validate()?;

        let client = SignalClient::new(
            config.daemon_host.clone(),
            config.daemon_port,
            Duration::from_secs(config.daemon_timeout_secs),
        );
        let generator: Arc<dyn TextGenerator> = Arc::new(LlmClient::new(&config));

        Ok(Self {
            outbound: Arc::new(client.clone()),
            client,
            generator,
            config,
        })
    }

    /// Spawn the poll scheduler task, if enabled. The task owns the
    /// ledger exclusively and drains on shutdown instead of being
    /// aborted, so a batch in flight still reaches its ledger save.
    pub fn spawn_poll_scheduler(&self, shutdown: watch::Receiver<bool>) -> Option<JoinHandle<()>> {
        if !self.config.poll.enabled {
            tracing::info!("Poll scheduling disabled");
            return None;
        }

        let ledger = PollLedger::load(&self.config.poll.state_file);
        let manager = PollManager::new(ledger, self.config.group_id.clone(), &self.config.poll);
        let spec = ScheduleSpec::from_config(&self.config.poll);
        let check_on_startup = self.config.poll.check_on_startup;
        let outbound = self.outbound.clone();
        let generator = self.generator.clone();

        Some(tokio::spawn(run_poll_scheduler(
            manager,
            spec,
            check_on_startup,
            outbound,
            generator,
            shutdown,
        )))
    }

    /// Run the subscription loop until shutdown is signaled. Owns the
    /// history store. Stream closure or connect failure triggers an
    /// exponential-backoff reconnect instead of ending the process.
    /// Shutdown is only observed between envelopes, so the envelope being
    /// handled always finishes its reply and persistence first.
    pub async fn run_subscription_loop(&self, mut shutdown: watch::Receiver<bool>) {
        tracing::info!("{}", "=".repeat(60));
        tracing::info!("Marvin Bot Starting");
        tracing::info!("Group: {}", self.config.group_id);
        tracing::info!("Bot: {}", self.config.bot_number);
        tracing::info!("LLM: {}", self.config.llm_url);
        tracing::info!("{}", "=".repeat(60));

        let mut store = ChatStore::load(&self.config.history_file, self.config.context_messages);
        let responder = Responder::new(&self.config, self.outbound.clone(), self.generator.clone());

        if let Err(e) = self.client.flush_receive().await {
            tracing::warn!("Initial receive flush failed: {}", e);
        }

        let mut backoff = INITIAL_BACKOFF;
        loop {
            if *shutdown.borrow() {
                break;
            }
            match self.client.subscribe().await {
                Ok(mut subscription) => {
                    backoff = INITIAL_BACKOFF;
                    loop {
                        let event = tokio::select! {
                            biased;
                            _ = shutdown.changed() => break,
                            event = subscription.next_event() => event,
                        };
                        match event {
                            Ok(Some(envelope)) => {
                                responder.handle_envelope(&mut store, &envelope).await;
                            }
                            Ok(None) => break,
                            Err(e) => {
                                tracing::warn!("Subscription stream error: {}", e);
                                break;
                            }
                        }
                    }
                    if *shutdown.borrow() {
                        break;
                    }
                }
                Err(e) => {
                    tracing::warn!("Failed to open subscription: {}", e);
                }
            }

            tracing::info!("Reconnecting to daemon in {:?}", backoff);
            tokio::select! {
                biased;
                _ = shutdown.changed() => break,
                _ = tokio::time::sleep(backoff) => {}
            }
            backoff = (backoff * 2).min(MAX_BACKOFF);
        }
        tracing::info!("Subscription loop stopped");
    }
}
