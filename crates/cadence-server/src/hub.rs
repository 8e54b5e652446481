use std::collections::{HashMap, VecDeque};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Mutex;
use std::time::{Duration, Instant};

use serde_json::json;
use thiserror::Error;
use tokio::sync::mpsc;
use uuid::Uuid;

use cadence_types::{Event, WireEvent};

#[derive(Debug, Clone)]
pub struct HubConfig {
    pub max_connections: usize,
    pub replay_capacity: usize,
    pub replay_ttl: Duration,
}

impl Default for HubConfig {
    fn default() -> Self {
        Self {
            max_connections: 64,
            replay_capacity: 256,
            replay_ttl: Duration::from_secs(300),
        }
    }
}

#[derive(Debug, Error)]
pub enum HubError {
    #[error("connection limit reached ({0})")]
    ConnectionLimit(usize),
}

struct ReplayBuffer {
    events: VecDeque<WireEvent>,
    last_seen: Instant,
}

struct HubInner {
    senders: HashMap<String, mpsc::UnboundedSender<WireEvent>>,
    replay: HashMap<String, ReplayBuffer>,
}

/// Everything a freshly accepted client needs: its id, the live event
/// receiver, and whatever it missed since `last_sequence`.
#[derive(Debug)]
pub struct ClientConnection {
    pub client_id: String,
    pub receiver: mpsc::UnboundedReceiver<WireEvent>,
    pub missed: Vec<WireEvent>,
}

/// Fan-out point between the in-process event bus and connected
/// observers. Stamps every event with a hub-wide monotonic sequence
/// number and keeps a bounded, TTL-bounded replay buffer per client so a
/// reconnecting observer can catch up.
pub struct WebSocketHub {
    sequence: AtomicU64,
    config: HubConfig,
    inner: Mutex<HubInner>,
}

impl WebSocketHub {
    pub fn new(config: HubConfig) -> Self {
        Self {
            sequence: AtomicU64::new(0),
            config,
            inner: Mutex::new(HubInner {
                senders: HashMap::new(),
                replay: HashMap::new(),
            }),
        }
    }

    pub fn next_sequence(&self) -> u64 {
        self.sequence.fetch_add(1, Ordering::SeqCst) + 1
    }

    /// Assign the next sequence number to an event without broadcasting
    /// it; used for per-client messages like the connect heartbeat.
    pub fn stamp(&self, event: &Event) -> WireEvent {
        WireEvent::from_event(event, self.next_sequence(), json!({}))
    }

    pub fn publish(&self, event: &Event) {
        let wire = self.stamp(event);
        let mut inner = self.inner.lock().unwrap_or_else(|e| e.into_inner());
        let inner = &mut *inner;

        // Expired buffers belong to clients that never came back.
        let ttl = self.config.replay_ttl;
        let senders = &inner.senders;
        inner
            .replay
            .retain(|id, buffer| senders.contains_key(id) || buffer.last_seen.elapsed() <= ttl);

        for (client_id, buffer) in inner.replay.iter_mut() {
            buffer.events.push_back(wire.clone());
            while buffer.events.len() > self.config.replay_capacity {
                buffer.events.pop_front();
            }
            if inner.senders.contains_key(client_id) {
                buffer.last_seen = Instant::now();
            }
        }

        inner
            .senders
            .retain(|_, sender| sender.send(wire.clone()).is_ok());
    }

    pub fn connect(
        &self,
        client_id: Option<String>,
        last_sequence: Option<u64>,
    ) -> Result<ClientConnection, HubError> {
        let mut inner = self.inner.lock().unwrap_or_else(|e| e.into_inner());
        if inner.senders.len() >= self.config.max_connections {
            return Err(HubError::ConnectionLimit(self.config.max_connections));
        }

        let client_id = client_id.unwrap_or_else(|| Uuid::new_v4().to_string());
        let (sender, receiver) = mpsc::unbounded_channel();

        let missed = match (inner.replay.get(&client_id), last_sequence) {
            (Some(buffer), Some(last_sequence)) => buffer
                .events
                .iter()
                .filter(|event| event.sequence_number > last_sequence)
                .cloned()
                .collect(),
            _ => Vec::new(),
        };

        inner
            .replay
            .entry(client_id.clone())
            .and_modify(|buffer| buffer.last_seen = Instant::now())
            .or_insert_with(|| ReplayBuffer {
                events: VecDeque::new(),
                last_seen: Instant::now(),
            });
        inner.senders.insert(client_id.clone(), sender);

        tracing::info!(client_id, replayed = missed.len(), "websocket client connected");
        Ok(ClientConnection {
            client_id,
            receiver,
            missed,
        })
    }

    pub fn disconnect(&self, client_id: &str) {
        let mut inner = self.inner.lock().unwrap_or_else(|e| e.into_inner());
        inner.senders.remove(client_id);
        if let Some(buffer) = inner.replay.get_mut(client_id) {
            buffer.last_seen = Instant::now();
        }
        tracing::info!(client_id, "websocket client disconnected");
    }

    pub fn connection_count(&self) -> usize {
        self.inner
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .senders
            .len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use cadence_types::EventType;
    use serde_json::json;

    fn heartbeat() -> Event {
        Event::new(EventType::SystemHeartbeat, json!({}))
    }

    #[test]
    fn sequence_numbers_are_strictly_monotonic() {
        let hub = WebSocketHub::new(HubConfig::default());
        let connection = hub.connect(None, None).expect("connect");
        let mut receiver = connection.receiver;

        for _ in 0..5 {
            hub.publish(&heartbeat());
        }
        let mut last = 0;
        for _ in 0..5 {
            let event = receiver.try_recv().expect("event");
            assert!(event.sequence_number > last);
            last = event.sequence_number;
        }
        // stamp() shares the same counter.
        assert!(hub.stamp(&heartbeat()).sequence_number > last);
    }

    #[test]
    fn reconnect_replays_only_missed_events() {
        let hub = WebSocketHub::new(HubConfig::default());
        let connection = hub.connect(Some("observer".to_string()), None).expect("connect");
        assert!(connection.missed.is_empty());

        hub.publish(&heartbeat());
        hub.publish(&heartbeat());
        hub.disconnect("observer");

        // Missed while away.
        hub.publish(&heartbeat());
        hub.publish(&heartbeat());

        let reconnected = hub
            .connect(Some("observer".to_string()), Some(2))
            .expect("reconnect");
        let sequences: Vec<u64> = reconnected
            .missed
            .iter()
            .map(|e| e.sequence_number)
            .collect();
        assert_eq!(sequences, vec![3, 4]);
    }

    #[test]
    fn replay_buffer_is_bounded() {
        let hub = WebSocketHub::new(HubConfig {
            replay_capacity: 3,
            ..HubConfig::default()
        });
        let _connection = hub.connect(Some("c".to_string()), None).expect("connect");
        for _ in 0..10 {
            hub.publish(&heartbeat());
        }
        hub.disconnect("c");

        let reconnected = hub.connect(Some("c".to_string()), Some(0)).expect("reconnect");
        assert_eq!(reconnected.missed.len(), 3);
        assert_eq!(
            reconnected
                .missed
                .iter()
                .map(|e| e.sequence_number)
                .collect::<Vec<_>>(),
            vec![8, 9, 10]
        );
    }

    #[test]
    fn connection_limit_is_enforced() {
        let hub = WebSocketHub::new(HubConfig {
            max_connections: 2,
            ..HubConfig::default()
        });
        let _a = hub.connect(None, None).expect("first");
        let _b = hub.connect(None, None).expect("second");
        let err = hub.connect(None, None).expect_err("limit");
        assert!(matches!(err, HubError::ConnectionLimit(2)));

        hub.disconnect(&_a.client_id);
        assert!(hub.connect(None, None).is_ok());
    }

    #[test]
    fn stale_replay_buffers_are_evicted() {
        let hub = WebSocketHub::new(HubConfig {
            replay_ttl: Duration::from_millis(0),
            ..HubConfig::default()
        });
        let connection = hub.connect(Some("ghost".to_string()), None).expect("connect");
        hub.publish(&heartbeat());
        drop(connection);
        hub.disconnect("ghost");

        std::thread::sleep(Duration::from_millis(5));
        // The sweep runs on publish; the ghost's buffer is gone after it.
        hub.publish(&heartbeat());
        let reconnected = hub
            .connect(Some("ghost".to_string()), Some(0))
            .expect("reconnect");
        assert!(reconnected.missed.is_empty());
    }
}
