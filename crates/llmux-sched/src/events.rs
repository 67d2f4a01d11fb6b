use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;

use serde::{Deserialize, Serialize};
use tokio::sync::{RwLock, broadcast};

use llmux_common::PipelineError;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub enum Event {
    Operational(OperationalEvent),
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub enum OperationalEvent {
    BlacklistAdded {
        id: String,
        reason_code: String,
        permanent: bool,
        expires_at_ms: Option<i64>,
    },
    BlacklistRemoved {
        id: String,
    },
    BlacklistExpired {
        id: String,
    },
    PoolAdded {
        id: String,
    },
    PoolRemoved {
        id: String,
    },
    ErrorHandled {
        code: String,
        action: String,
    },
}

impl OperationalEvent {
    pub fn blacklist_added(id: &str, reason: &PipelineError, permanent: bool, expires_at_ms: Option<i64>) -> Self {
        OperationalEvent::BlacklistAdded {
            id: id.to_string(),
            reason_code: reason.code.clone(),
            permanent,
            expires_at_ms,
        }
    }
}

pub trait EventSink: Send + Sync {
    fn write<'a>(&'a self, event: &'a Event) -> Pin<Box<dyn Future<Output = ()> + Send + 'a>>;
}

/// Terminal sink: every operational event lands on the log stream as a
/// structured record.
pub struct TracingEventSink;

impl EventSink for TracingEventSink {
    fn write<'a>(&'a self, event: &'a Event) -> Pin<Box<dyn Future<Output = ()> + Send + 'a>> {
        Box::pin(async move {
            let detail = serde_json::to_string(event).unwrap_or_default();
            tracing::info!(event = "operational", detail = %detail);
        })
    }
}

/// Broadcast hub with optional persistent sinks. Lagging broadcast
/// subscribers drop events; sinks get every event on a spawned task.
#[derive(Clone)]
pub struct EventHub {
    inner: Arc<Inner>,
}

struct Inner {
    tx: broadcast::Sender<Event>,
    sinks: RwLock<Vec<Arc<dyn EventSink>>>,
}

impl EventHub {
    pub fn new(buffer: usize) -> Self {
        let (tx, _) = broadcast::channel(buffer);
        Self {
            inner: Arc::new(Inner {
                tx,
                sinks: RwLock::new(Vec::new()),
            }),
        }
    }

    pub fn subscribe(&self) -> broadcast::Receiver<Event> {
        self.inner.tx.subscribe()
    }

    pub async fn add_sink(&self, sink: Arc<dyn EventSink>) {
        self.inner.sinks.write().await.push(sink);
    }

    pub async fn emit(&self, event: Event) {
        let _ = self.inner.tx.send(event.clone());
        let sinks = self.inner.sinks.read().await.clone();
        for sink in sinks {
            let event = event.clone();
            tokio::spawn(async move {
                sink.write(&event).await;
            });
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::time::Duration;

    struct CountingSink {
        seen: AtomicUsize,
    }

    impl EventSink for CountingSink {
        fn write<'a>(&'a self, _event: &'a Event) -> Pin<Box<dyn Future<Output = ()> + Send + 'a>> {
            Box::pin(async move {
                self.seen.fetch_add(1, Ordering::SeqCst);
            })
        }
    }

    #[tokio::test]
    async fn registered_sinks_receive_every_event() {
        let hub = EventHub::new(8);
        let sink = Arc::new(CountingSink {
            seen: AtomicUsize::new(0),
        });
        hub.add_sink(sink.clone()).await;
        hub.add_sink(Arc::new(TracingEventSink)).await;

        for _ in 0..3 {
            hub.emit(Event::Operational(OperationalEvent::PoolAdded {
                id: "p.m".to_string(),
            }))
            .await;
        }

        // Sink writes run on spawned tasks; give them a beat.
        for _ in 0..50 {
            if sink.seen.load(Ordering::SeqCst) == 3 {
                break;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        assert_eq!(sink.seen.load(Ordering::SeqCst), 3);
    }
}

