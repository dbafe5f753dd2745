use crate::sync::coalesce::{SubscriptionReconciler, TimerFire};
use crate::sync::connection::{ConnectionAction, ConnectionMachine};
use crate::sync::envelope::{decode_frame, Envelope, EventRoute};
use crate::sync::identity::IdentifierResolver;
use crate::sync::metrics::apply_metric_event;
use crate::sync::refresh::{
    apply_refresh_payload, execute_refresh, RefreshRequest, RefreshResult, RefreshSource,
};
use crate::sync::sink::StateSink;
use crate::sync::status::apply_status_event;
use crate::sync::subscriptions::normalize_market_data_event;
use crate::sync::telemetry::fan_out_telemetry;
use crate::sync::transport::{TokenProvider, Transport, TransportEvent, TransportHandle};
use crate::sync::types::{
    ControlMessage, FeedStatus, Field, MarketDataStatusUpdate, MarketDataUpdate, SyncConfig,
};
use chrono::{DateTime, Utc};
use serde_json::Value;
use std::collections::HashSet;
use std::future::pending;
use std::sync::Arc;
use tokio::sync::mpsc;
use tokio::time::{Instant, Interval, MissedTickBehavior};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

/// Routes decoded envelopes to the reconcilers. Every error stops here as a log line.
pub struct SyncEngine {
    sink: Arc<dyn StateSink>,
    resolver: IdentifierResolver,
    subscriptions: SubscriptionReconciler,
}

impl SyncEngine {
    pub fn new(sink: Arc<dyn StateSink>, config: &SyncConfig) -> Self {
        Self {
            sink,
            resolver: IdentifierResolver::new(),
            subscriptions: SubscriptionReconciler::new(
                config.coalesce_window,
                config.empty_clear_delay,
            ),
        }
    }

    /// Handles one inbound text frame and returns the refreshes it asks for.
    pub fn handle_frame(&mut self, text: &str, now: Instant) -> Vec<RefreshRequest> {
        match decode_frame(text) {
            Ok(Some(envelope)) => self.handle_envelope(envelope, now),
            Ok(None) => {
                debug!("ignoring frame with unrecognized type or event");
                Vec::new()
            }
            Err(error) => {
                warn!(%error, "dropping malformed frame");
                Vec::new()
            }
        }
    }

    pub fn handle_envelope(&mut self, envelope: Envelope, now: Instant) -> Vec<RefreshRequest> {
        let received_at = envelope.timestamp.unwrap_or_else(Utc::now);
        let outcome = match envelope.route {
            EventRoute::Status => apply_status_event(
                &envelope.payload,
                &mut self.resolver,
                self.sink.as_ref(),
                received_at,
            ),
            EventRoute::Metric => apply_metric_event(
                &envelope.payload,
                &mut self.resolver,
                self.sink.as_ref(),
                received_at,
            ),
            EventRoute::MarketData => {
                self.handle_market_data(&envelope.payload, received_at, now);
                Ok(Vec::new())
            }
        };

        match outcome {
            Ok(refresh) => refresh,
            Err(error) => {
                warn!(route = ?envelope.route, %error, "dropping event");
                Vec::new()
            }
        }
    }

    fn handle_market_data(&mut self, payload: &Value, updated_at: DateTime<Utc>, now: Instant) {
        let event = match normalize_market_data_event(payload) {
            Ok(event) => event,
            Err(error) => {
                warn!(%error, "keeping last subscription list after malformed market data");
                self.sink
                    .set_market_data_subscriptions_status(MarketDataStatusUpdate {
                        status: FeedStatus::Idle,
                        updated_at,
                        error: Field::Value(error.to_string()),
                    });
                return;
            }
        };

        if let Some(telemetry) = event.telemetry.as_ref() {
            fan_out_telemetry(telemetry, updated_at, &mut self.resolver, self.sink.as_ref());
        }

        let update = self.subscriptions.apply(event, updated_at, now);
        self.sink.set_market_data_subscriptions(update);
    }

    pub fn next_deadline(&self) -> Option<Instant> {
        self.subscriptions.next_deadline()
    }

    pub fn fire_due(&mut self, now: Instant) {
        for fire in self.subscriptions.fire_due(now) {
            let items = match fire {
                TimerFire::Settled(items) | TimerFire::Pruned(items) => items,
                TimerFire::Cleared => Vec::new(),
            };
            self.sink.set_market_data_subscriptions(MarketDataUpdate {
                items: Some(items),
                ..MarketDataUpdate::default()
            });
        }
    }

    pub fn apply_refresh(&mut self, result: RefreshResult) {
        let payload = match result.payload {
            Ok(payload) => payload,
            Err(error) => {
                warn!(request = ?result.request, %error, "refresh fetch failed");
                return;
            }
        };

        if let Err(error) = apply_refresh_payload(
            &result.request,
            &payload,
            &mut self.resolver,
            self.sink.as_ref(),
            Utc::now(),
        ) {
            warn!(request = ?result.request, %error, "dropping refresh payload");
        }
    }

    pub fn discard_pending(&mut self) {
        self.subscriptions.discard();
    }
}

/// Everything the client loop talks to.
#[derive(Clone)]
pub struct SyncCollaborators {
    pub sink: Arc<dyn StateSink>,
    pub transport: Arc<dyn Transport>,
    pub tokens: Arc<dyn TokenProvider>,
    pub refresh: Arc<dyn RefreshSource>,
}

enum LoopEvent {
    Transport(TransportEvent),
    Refresh(RefreshResult),
    Deadline,
    Poll,
}

struct ClientLoop {
    config: SyncConfig,
    collaborators: SyncCollaborators,
    engine: SyncEngine,
    machine: ConnectionMachine,
    events_tx: mpsc::UnboundedSender<TransportEvent>,
    refresh_tx: mpsc::UnboundedSender<RefreshResult>,
    handle: Option<Box<dyn TransportHandle>>,
    poll: Option<Interval>,
    in_flight: HashSet<RefreshRequest>,
    refresh_cancel: CancellationToken,
    session_expired: bool,
}

impl ClientLoop {
    fn execute(&mut self, actions: Vec<ConnectionAction>) {
        for action in actions {
            match action {
                ConnectionAction::OpenTransport => {
                    if self.handle.is_none() {
                        self.handle = Some(self.collaborators.transport.subscribe(
                            Arc::clone(&self.collaborators.tokens),
                            self.events_tx.clone(),
                        ));
                    }
                }
                ConnectionAction::DisposeTransport => {
                    if let Some(mut handle) = self.handle.take() {
                        handle.dispose();
                    }
                }
                ConnectionAction::SendSubscribe => {
                    let message = ControlMessage::subscribe(&self.config.topics);
                    let sent = self
                        .handle
                        .as_ref()
                        .map(|handle| handle.send(&message))
                        .unwrap_or(false);
                    if sent {
                        info!(topics = ?self.config.topics, "subscribed to event topics");
                    } else {
                        warn!("failed to send topic subscription");
                    }
                }
                ConnectionAction::StartPolling => {
                    let mut ticker = tokio::time::interval(self.config.poll_interval);
                    ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);
                    self.poll = Some(ticker);
                    info!(
                        interval_ms = self.config.poll_interval.as_millis() as u64,
                        "pull refresh started"
                    );
                }
                ConnectionAction::StopPolling => {
                    self.poll = None;
                    info!("pull refresh stopped");
                }
                ConnectionAction::ExpireSession => {
                    warn!("authentication rejected by event stream, expiring session");
                    self.collaborators.sink.logout_session();
                    self.session_expired = true;
                }
                ConnectionAction::Publish(state) => {
                    self.collaborators.sink.set_connection_state(state);
                }
            }
        }
    }

    fn schedule_refresh(&mut self, request: RefreshRequest) {
        if !self.in_flight.insert(request.clone()) {
            return;
        }

        let source = Arc::clone(&self.collaborators.refresh);
        let results = self.refresh_tx.clone();
        let cancel_token = self.refresh_cancel.clone();
        tokio::spawn(async move {
            tokio::select! {
                _ = cancel_token.cancelled() => {}
                result = execute_refresh(source.as_ref(), request) => {
                    let _ = results.send(result);
                }
            }
        });
    }

    fn on_transport_event(&mut self, event: TransportEvent) {
        match event {
            TransportEvent::Open => {
                let actions = self.machine.on_open();
                self.execute(actions);
            }
            TransportEvent::Message(text) => {
                if !self.machine.is_started() {
                    return;
                }
                let refresh = self.engine.handle_frame(&text, Instant::now());
                for request in refresh {
                    self.schedule_refresh(request);
                }
            }
            TransportEvent::Error(error) => {
                warn!(%error, "event stream error");
                let actions = self.machine.on_error();
                self.execute(actions);
            }
            TransportEvent::Close(close) => {
                let auth_failure = self.config.is_auth_failure(&close);
                info!(code = ?close.code, reason = %close.reason, auth_failure, "event stream closed");
                let actions = self.machine.on_close(auth_failure);
                self.execute(actions);
            }
        }
    }

    fn on_refresh_result(&mut self, result: RefreshResult) {
        self.in_flight.remove(&result.request);
        self.engine.apply_refresh(result);
    }
}

async fn wait_until(deadline: Option<Instant>) {
    match deadline {
        Some(deadline) => tokio::time::sleep_until(deadline).await,
        None => pending::<()>().await,
    }
}

async fn wait_tick(ticker: Option<&mut Interval>) {
    match ticker {
        Some(ticker) => {
            ticker.tick().await;
        }
        None => pending::<()>().await,
    }
}

/// Runs one client session until cancelled or until the server rejects authentication.
pub async fn run_sync_client(
    config: SyncConfig,
    collaborators: SyncCollaborators,
    cancel_token: CancellationToken,
) {
    let (events_tx, mut events_rx) = mpsc::unbounded_channel();
    let (refresh_tx, mut refresh_rx) = mpsc::unbounded_channel();
    let mut client = ClientLoop {
        engine: SyncEngine::new(Arc::clone(&collaborators.sink), &config),
        machine: ConnectionMachine::new(config.force_pull, config.fallback_poll),
        config,
        collaborators,
        events_tx,
        refresh_tx,
        handle: None,
        poll: None,
        in_flight: HashSet::new(),
        refresh_cancel: cancel_token.child_token(),
        session_expired: false,
    };

    let actions = client.machine.connect();
    client.execute(actions);

    loop {
        let deadline = client.engine.next_deadline();
        let next = tokio::select! {
            _ = cancel_token.cancelled() => break,
            Some(event) = events_rx.recv() => LoopEvent::Transport(event),
            Some(result) = refresh_rx.recv() => LoopEvent::Refresh(result),
            _ = wait_until(deadline) => LoopEvent::Deadline,
            _ = wait_tick(client.poll.as_mut()) => LoopEvent::Poll,
        };

        match next {
            LoopEvent::Transport(event) => client.on_transport_event(event),
            LoopEvent::Refresh(result) => client.on_refresh_result(result),
            LoopEvent::Deadline => client.engine.fire_due(Instant::now()),
            LoopEvent::Poll => client.schedule_refresh(RefreshRequest::AllStrategies),
        }

        if client.session_expired {
            break;
        }
    }

    client.refresh_cancel.cancel();
    client.engine.discard_pending();
    let actions = client.machine.disconnect();
    client.execute(actions);
    info!("sync client stopped");
}
