//! The single consumer of the event bus.
//!
//! Every source gets its own lane: one sequential worker fed by a bounded
//! queue. Events from one source are handled in arrival order while
//! different sources proceed independently. A source whose lane is full has
//! its new events failed instead of stalling the bus.

use std::{
    any::Any,
    collections::{HashMap, VecDeque},
    panic::AssertUnwindSafe,
    sync::{Arc, Mutex},
    time::{Duration, Instant},
};

use {
    bambooclaw_channels::Delivery,
    bambooclaw_common::{
        Envelope, Event, EventId, EventReceiver, EventSource, Outcome, Reply, ReplyContent,
    },
    bambooclaw_config::DispatchConfig,
    chrono::{DateTime, Utc},
    futures::FutureExt,
    serde::Serialize,
    tokio::{sync::mpsc, task::JoinSet},
    tokio_util::sync::CancellationToken,
    tracing::{debug, info, warn},
};

use crate::{
    agent::{AgentCapability, AgentContext},
    error::DispatchError,
    memory::{ConversationStore, StoredMessage},
    router::ReplyRouter,
};

#[derive(Debug, Clone)]
pub struct DispatchSettings {
    pub agent_timeout: Duration,
    pub history_limit: usize,
    pub record_capacity: usize,
    pub lane_capacity: usize,
}

impl Default for DispatchSettings {
    fn default() -> Self {
        Self::from_config(&DispatchConfig::default())
    }
}

impl DispatchSettings {
    #[must_use]
    pub fn from_config(config: &DispatchConfig) -> Self {
        Self {
            agent_timeout: Duration::from_secs(config.agent_timeout_secs.max(1)),
            history_limit: config.history_limit,
            record_capacity: config.record_capacity.max(1),
            lane_capacity: config.queue_capacity.max(1),
        }
    }
}

/// What happened to one event.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct DispatchRecord {
    pub event_id: EventId,
    pub source: String,
    pub conversation: String,
    pub received_at: DateTime<Utc>,
    pub finished_at: DateTime<Utc>,
    pub replies: usize,
    pub delivered: usize,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    pub duration_ms: u64,
}

pub struct Dispatcher {
    agent: Arc<dyn AgentCapability>,
    memory: Arc<dyn ConversationStore>,
    router: Option<Arc<dyn ReplyRouter>>,
    settings: DispatchSettings,
    records: Mutex<VecDeque<DispatchRecord>>,
}

impl Dispatcher {
    #[must_use]
    pub fn new(
        agent: Arc<dyn AgentCapability>,
        memory: Arc<dyn ConversationStore>,
        settings: DispatchSettings,
    ) -> Self {
        Self {
            agent,
            memory,
            router: None,
            settings,
            records: Mutex::new(VecDeque::new()),
        }
    }

    /// Route replies to channel-sourced events through `router`.
    #[must_use]
    pub fn with_router(mut self, router: Arc<dyn ReplyRouter>) -> Self {
        self.router = Some(router);
        self
    }

    /// Most recent records, oldest first.
    #[must_use]
    pub fn records(&self) -> Vec<DispatchRecord> {
        self.records
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .iter()
            .cloned()
            .collect()
    }

    #[must_use]
    pub fn record_for(&self, event_id: EventId) -> Option<DispatchRecord> {
        self.records
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .iter()
            .rev()
            .find(|r| r.event_id == event_id)
            .cloned()
    }

    /// Drain the bus until it closes or `cancel` fires. Lanes finish the event
    /// in hand; anything still queued is failed.
    pub async fn run(self: Arc<Self>, mut rx: EventReceiver, cancel: CancellationToken) {
        let mut lanes: HashMap<EventSource, mpsc::Sender<Envelope>> = HashMap::new();
        let mut workers = JoinSet::new();
        info!(agent = self.agent.name(), "dispatcher started");

        loop {
            let envelope = tokio::select! {
                biased;
                () = cancel.cancelled() => break,
                next = rx.recv() => match next {
                    Some(envelope) => envelope,
                    None => break,
                },
            };

            let source = envelope.event.source().clone();
            let lane = lanes.entry(source.clone()).or_insert_with(|| {
                debug!(source = %source, "opening dispatch lane");
                let (tx, lane_rx) = mpsc::channel(self.settings.lane_capacity);
                workers.spawn(Arc::clone(&self).lane(lane_rx, cancel.clone()));
                tx
            });
            match lane.try_send(envelope) {
                Ok(()) => {},
                Err(mpsc::error::TrySendError::Full(mut envelope)) => {
                    warn!(
                        source = %source,
                        event_id = %envelope.event.id(),
                        capacity = self.settings.lane_capacity,
                        "dispatch lane full, shedding event"
                    );
                    let error = format!("dispatch lane for {source} is full");
                    self.push_record(self.record(
                        &envelope.event,
                        0,
                        0,
                        Some(error.clone()),
                        0,
                    ));
                    envelope.complete(Outcome::Failed { error });
                },
                Err(mpsc::error::TrySendError::Closed(mut envelope)) => {
                    warn!(source = %source, "dispatch lane closed, reopening on next event");
                    envelope.complete(Outcome::Failed {
                        error: "dispatch lane closed".into(),
                    });
                    lanes.remove(&source);
                },
            }
        }

        rx.close();
        while let Ok(mut envelope) = rx.try_recv() {
            envelope.complete(Outcome::Failed {
                error: "dispatcher shutting down".into(),
            });
        }
        drop(lanes);
        while let Some(joined) = workers.join_next().await {
            if let Err(e) = joined {
                warn!(error = %e, "dispatch lane task failed");
            }
        }
        info!("dispatcher stopped");
    }

    async fn lane(self: Arc<Self>, mut rx: mpsc::Receiver<Envelope>, cancel: CancellationToken) {
        while let Some(mut envelope) = rx.recv().await {
            if cancel.is_cancelled() {
                envelope.complete(Outcome::Failed {
                    error: "dispatcher shutting down".into(),
                });
                continue;
            }
            self.handle(&mut envelope).await;
        }
    }

    async fn handle(&self, envelope: &mut Envelope) {
        let started = Instant::now();
        let result = self.process(&envelope.event).await;
        let event = &envelope.event;
        let duration_ms = u64::try_from(started.elapsed().as_millis()).unwrap_or(u64::MAX);

        let (record, outcome) = match result {
            Ok((replies, delivered)) => {
                info!(
                    event_id = %event.id(),
                    source = %event.source(),
                    replies = replies.len(),
                    delivered,
                    duration_ms,
                    "event dispatched"
                );
                (
                    self.record(event, replies.len(), delivered, None, duration_ms),
                    Outcome::Completed { replies, delivered },
                )
            },
            Err(e) => {
                warn!(
                    event_id = %event.id(),
                    source = %event.source(),
                    error = %e,
                    duration_ms,
                    "event produced no reply"
                );
                let error = e.to_string();
                (
                    self.record(event, 0, 0, Some(error.clone()), duration_ms),
                    Outcome::Failed { error },
                )
            },
        };

        self.push_record(record);
        envelope.complete(outcome);
    }

    fn push_record(&self, record: DispatchRecord) {
        let mut records = self.records.lock().unwrap_or_else(|e| e.into_inner());
        if records.len() >= self.settings.record_capacity {
            records.pop_front();
        }
        records.push_back(record);
    }

    fn record(
        &self,
        event: &Event,
        replies: usize,
        delivered: usize,
        error: Option<String>,
        duration_ms: u64,
    ) -> DispatchRecord {
        DispatchRecord {
            event_id: event.id(),
            source: event.source().to_string(),
            conversation: event.origin_conversation().to_string(),
            received_at: event.received_at(),
            finished_at: Utc::now(),
            replies,
            delivered,
            error,
            duration_ms,
        }
    }

    async fn process(&self, event: &Event) -> Result<(Vec<Reply>, usize), DispatchError> {
        let conversation = event.conversation_key();
        let input = event.payload();

        let history = match self
            .memory
            .query(&conversation, &input.text, self.settings.history_limit)
            .await
        {
            Ok(history) => history,
            Err(e) => {
                warn!(conversation = %conversation, error = %e, "history lookup failed");
                Vec::new()
            },
        };
        if let Err(e) = self
            .memory
            .store(&conversation, StoredMessage::user(input.text.clone()))
            .await
        {
            warn!(conversation = %conversation, error = %e, "failed to store inbound message");
        }

        let context = AgentContext {
            event_id: event.id(),
            source: event.source().clone(),
            conversation: conversation.clone(),
            auth: event.auth().clone(),
            history,
        };
        let contents = self.invoke(&context, event).await?;

        let replies: Vec<Reply> = contents
            .into_iter()
            .filter(|c| !c.text.trim().is_empty() || !c.attachments.is_empty())
            .map(|c| Reply::to_event(event, c))
            .collect();
        for reply in &replies {
            if let Err(e) = self
                .memory
                .store(
                    &conversation,
                    StoredMessage::assistant(reply.content.text.clone()),
                )
                .await
            {
                warn!(conversation = %conversation, error = %e, "failed to store reply");
            }
        }

        let delivered = match event.source().channel_name() {
            Some(channel) => self.deliver(channel, &replies).await,
            None => 0,
        };
        Ok((replies, delivered))
    }

    async fn invoke(
        &self,
        context: &AgentContext,
        event: &Event,
    ) -> Result<Vec<ReplyContent>, DispatchError> {
        let call = AssertUnwindSafe(self.agent.complete(context, event.payload())).catch_unwind();
        match tokio::time::timeout(self.settings.agent_timeout, call).await {
            Err(_) => Err(DispatchError::Timeout {
                after: self.settings.agent_timeout,
            }),
            Ok(Err(panic)) => Err(DispatchError::Panicked {
                message: panic_message(panic.as_ref()),
            }),
            Ok(Ok(Err(e))) => Err(DispatchError::unavailable(format!("{e:#}"))),
            Ok(Ok(Ok(contents))) => Ok(contents),
        }
    }

    async fn deliver(&self, channel: &str, replies: &[Reply]) -> usize {
        let Some(router) = &self.router else {
            debug!(channel, "no reply router, replies not delivered");
            return 0;
        };
        let mut delivered = 0;
        for reply in replies {
            match router.route(channel, reply).await {
                Ok(Delivery::Delivered) => delivered += 1,
                Ok(Delivery::Rejected(reason)) => {
                    warn!(channel, event_id = %reply.event_id, reason = %reason, "reply rejected");
                },
                Ok(Delivery::Throttled { retry_after }) => {
                    warn!(
                        channel,
                        event_id = %reply.event_id,
                        retry_after_ms = u64::try_from(retry_after.as_millis()).unwrap_or(u64::MAX),
                        "reply throttled"
                    );
                },
                Err(e) => {
                    warn!(channel, event_id = %reply.event_id, error = %e, "reply delivery failed");
                },
            }
        }
        delivered
    }
}

fn panic_message(panic: &(dyn Any + Send)) -> String {
    if let Some(s) = panic.downcast_ref::<&str>() {
        (*s).to_string()
    } else if let Some(s) = panic.downcast_ref::<String>() {
        s.clone()
    } else {
        "unknown panic".to_string()
    }
}

#[allow(clippy::unwrap_used, clippy::expect_used)]
#[cfg(test)]
mod tests {
    use {
        super::*,
        crate::{agent::EchoAgent, memory::InMemoryConversationStore},
        anyhow::bail,
        async_trait::async_trait,
        bambooclaw_common::{AuthContext, EventSender, Payload, event_bus},
        tokio::task::JoinHandle,
    };

    /// Echoes, except for a few magic inputs.
    #[derive(Default)]
    struct ScriptedAgent {
        completed: Mutex<Vec<String>>,
        history_seen: Mutex<Vec<usize>>,
    }

    #[async_trait]
    impl AgentCapability for ScriptedAgent {
        fn name(&self) -> &str {
            "scripted"
        }

        async fn complete(
            &self,
            context: &AgentContext,
            input: &Payload,
        ) -> anyhow::Result<Vec<ReplyContent>> {
            self.history_seen
                .lock()
                .unwrap()
                .push(context.history.len());
            match input.text.as_str() {
                "hang" => tokio::time::sleep(Duration::from_secs(30)).await,
                "panic" => panic!("agent blew up"),
                "fail" => bail!("backend down"),
                "silent" => return Ok(vec![ReplyContent::text("   ")]),
                text if text.starts_with("slow") => {
                    tokio::time::sleep(Duration::from_millis(200)).await;
                },
                _ => {},
            }
            self.completed.lock().unwrap().push(input.text.clone());
            Ok(vec![ReplyContent::text(format!("re: {}", input.text))])
        }
    }

    #[derive(Default)]
    struct RecordingRouter {
        routed: Mutex<Vec<(String, Reply)>>,
    }

    #[async_trait]
    impl ReplyRouter for RecordingRouter {
        async fn route(&self, channel: &str, reply: &Reply) -> anyhow::Result<Delivery> {
            self.routed
                .lock()
                .unwrap()
                .push((channel.to_string(), reply.clone()));
            Ok(Delivery::Delivered)
        }
    }

    struct Harness {
        dispatcher: Arc<Dispatcher>,
        agent: Arc<ScriptedAgent>,
        router: Arc<RecordingRouter>,
        events: EventSender,
        cancel: CancellationToken,
        task: JoinHandle<()>,
    }

    fn harness(settings: DispatchSettings) -> Harness {
        let agent = Arc::new(ScriptedAgent::default());
        let router = Arc::new(RecordingRouter::default());
        let dispatcher = Arc::new(
            Dispatcher::new(
                agent.clone(),
                Arc::new(InMemoryConversationStore::default()),
                settings,
            )
            .with_router(router.clone()),
        );
        let (events, rx) = event_bus(16);
        let cancel = CancellationToken::new();
        let task = tokio::spawn(Arc::clone(&dispatcher).run(rx, cancel.clone()));
        Harness {
            dispatcher,
            agent,
            router,
            events,
            cancel,
            task,
        }
    }

    fn channel_event(channel: &str, conversation: &str, text: &str) -> Event {
        Event::new(
            EventSource::channel(channel),
            conversation,
            Payload::text(text),
            AuthContext::Anonymous,
        )
    }

    async fn dispatch(events: &EventSender, event: Event) -> Outcome {
        events.send_tracked(event).await.unwrap().await.unwrap()
    }

    #[tokio::test]
    async fn channel_reply_is_routed_back_to_origin() {
        let h = harness(DispatchSettings::default());
        let event = channel_event("ops", "chat-1", "hello");
        let id = event.id();

        let outcome = dispatch(&h.events, event).await;
        let Outcome::Completed { replies, delivered } = outcome else {
            panic!("expected completion");
        };
        assert_eq!(replies.len(), 1);
        assert_eq!(delivered, 1);

        let routed = h.router.routed.lock().unwrap().clone();
        assert_eq!(routed.len(), 1);
        assert_eq!(routed[0].0, "ops");
        assert_eq!(routed[0].1.event_id, id);
        assert_eq!(routed[0].1.target_conversation, "chat-1");
        assert_eq!(routed[0].1.content.text, "re: hello");

        let record = h.dispatcher.record_for(id).unwrap();
        assert_eq!(record.delivered, 1);
        assert!(record.error.is_none());
    }

    #[tokio::test]
    async fn gateway_and_cron_replies_are_not_routed() {
        let h = harness(DispatchSettings::default());
        for source in [EventSource::Gateway, EventSource::Cron] {
            let event = Event::new(source, "c", Payload::text("ping"), AuthContext::Anonymous);
            let outcome = dispatch(&h.events, event).await;
            let Outcome::Completed { replies, delivered } = outcome else {
                panic!("expected completion");
            };
            assert_eq!(replies.len(), 1);
            assert_eq!(delivered, 0);
        }
        assert!(h.router.routed.lock().unwrap().is_empty());
    }

    #[tokio::test]
    async fn blank_replies_are_dropped() {
        let h = harness(DispatchSettings::default());
        let outcome = dispatch(&h.events, channel_event("ops", "c", "silent")).await;
        assert_eq!(outcome, Outcome::Completed {
            replies: vec![],
            delivered: 0,
        });
        assert!(h.router.routed.lock().unwrap().is_empty());
    }

    #[tokio::test]
    async fn one_source_is_fifo_while_sources_interleave() {
        let h = harness(DispatchSettings::default());
        let slow = h
            .events
            .send_tracked(channel_event("a", "c", "slow-1"))
            .await
            .unwrap();
        let fast_a = h
            .events
            .send_tracked(channel_event("a", "c", "fast-2"))
            .await
            .unwrap();
        let fast_b = h
            .events
            .send_tracked(channel_event("b", "c", "fast-b"))
            .await
            .unwrap();

        fast_b.await.unwrap();
        // The other source finished while `a` was still busy with its slow event.
        assert_eq!(h.agent.completed.lock().unwrap().clone(), vec!["fast-b"]);

        slow.await.unwrap();
        fast_a.await.unwrap();
        assert_eq!(h.agent.completed.lock().unwrap().clone(), vec![
            "fast-b", "slow-1", "fast-2"
        ]);
    }

    #[tokio::test]
    async fn saturated_source_does_not_delay_other_sources() {
        let h = harness(DispatchSettings {
            lane_capacity: 1,
            agent_timeout: Duration::from_secs(60),
            ..DispatchSettings::default()
        });
        let mut flooded = Vec::new();
        for _ in 0..4 {
            flooded.push(
                h.events
                    .send_tracked(channel_event("a", "c", "hang"))
                    .await
                    .unwrap(),
            );
        }

        let outcome = tokio::time::timeout(
            Duration::from_secs(2),
            dispatch(&h.events, Event::new(
                EventSource::Cron,
                "cron:digest",
                Payload::text("digest"),
                AuthContext::Anonymous,
            )),
        )
        .await
        .unwrap();
        assert!(outcome.is_ok());

        // One event in hand and one queued; the rest are shed.
        let mut shed = 0;
        for rx in flooded {
            if let Ok(Ok(Outcome::Failed { error })) =
                tokio::time::timeout(Duration::from_millis(200), rx).await
            {
                assert!(error.contains("full"));
                shed += 1;
            }
        }
        assert!(shed >= 2);
        assert!(
            h.dispatcher
                .records()
                .iter()
                .any(|r| r.error.as_deref().is_some_and(|e| e.contains("full")))
        );
        h.cancel.cancel();
    }

    #[tokio::test]
    async fn agent_timeout_is_recorded_and_loop_continues() {
        let h = harness(DispatchSettings {
            agent_timeout: Duration::from_millis(50),
            ..DispatchSettings::default()
        });
        let event = channel_event("ops", "c", "hang");
        let id = event.id();
        let outcome = dispatch(&h.events, event).await;
        assert!(matches!(&outcome, Outcome::Failed { error } if error.contains("timed out")));
        assert!(h.dispatcher.record_for(id).unwrap().error.is_some());

        assert!(dispatch(&h.events, channel_event("ops", "c", "next")).await.is_ok());
        assert_eq!(h.router.routed.lock().unwrap().len(), 1);
    }

    #[tokio::test]
    async fn agent_panic_and_failure_do_not_stop_the_loop() {
        let h = harness(DispatchSettings::default());

        let outcome = dispatch(&h.events, channel_event("ops", "c", "panic")).await;
        assert!(matches!(&outcome, Outcome::Failed { error } if error.contains("agent blew up")));

        let outcome = dispatch(&h.events, channel_event("ops", "c", "fail")).await;
        assert!(matches!(&outcome, Outcome::Failed { error } if error.contains("backend down")));

        assert!(dispatch(&h.events, channel_event("ops", "c", "still alive")).await.is_ok());
        assert_eq!(h.router.routed.lock().unwrap().len(), 1);
    }

    #[tokio::test]
    async fn history_is_passed_to_the_agent() {
        let h = harness(DispatchSettings::default());
        dispatch(&h.events, channel_event("ops", "c1", "hello")).await;
        dispatch(&h.events, channel_event("ops", "c1", "hello again")).await;
        dispatch(&h.events, channel_event("ops", "other", "hello")).await;

        // Second call sees the first user message and its reply; a different
        // conversation sees nothing.
        assert_eq!(h.agent.history_seen.lock().unwrap().clone(), vec![0, 2, 0]);
    }

    #[tokio::test]
    async fn record_ring_is_bounded() {
        let h = harness(DispatchSettings {
            record_capacity: 2,
            ..DispatchSettings::default()
        });
        let mut last = None;
        for i in 0..3 {
            let event = channel_event("ops", "c", &format!("m{i}"));
            last = Some(event.id());
            dispatch(&h.events, event).await;
        }
        let records = h.dispatcher.records();
        assert_eq!(records.len(), 2);
        assert_eq!(records[1].event_id, last.unwrap());
    }

    #[tokio::test]
    async fn cancel_stops_the_loop() {
        let h = harness(DispatchSettings::default());
        dispatch(&h.events, channel_event("ops", "c", "x")).await;
        h.cancel.cancel();
        tokio::time::timeout(Duration::from_secs(2), h.task)
            .await
            .unwrap()
            .unwrap();
    }

    #[test]
    fn release_builds_keep_unwinding_for_panic_isolation() {
        let manifest = include_str!("../../../Cargo.toml");
        let release = manifest
            .split("[profile.release]")
            .nth(1)
            .unwrap()
            .split("\n[")
            .next()
            .unwrap();
        assert!(!release.contains("\"abort\""));
        assert!(release.contains("panic         = \"unwind\""));
    }

    #[tokio::test]
    async fn echo_agent_without_router() {
        let dispatcher = Arc::new(Dispatcher::new(
            Arc::new(EchoAgent),
            Arc::new(InMemoryConversationStore::default()),
            DispatchSettings::default(),
        ));
        let (events, rx) = event_bus(4);
        let cancel = CancellationToken::new();
        tokio::spawn(Arc::clone(&dispatcher).run(rx, cancel.clone()));

        let outcome = dispatch(&events, channel_event("ops", "c", "echo me")).await;
        let Outcome::Completed { replies, delivered } = outcome else {
            panic!("expected completion");
        };
        assert_eq!(replies[0].content.text, "echo me");
        assert_eq!(delivered, 0);
        cancel.cancel();
    }
}
