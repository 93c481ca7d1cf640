use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use dashmap::DashMap;
use serde::Serialize;
use tokio::sync::broadcast;

/// Lines kept for late subscribers.
pub const HISTORY_CAPACITY: usize = 1000;
/// Live messages buffered per subscriber before it starts lagging.
pub const CHANNEL_CAPACITY: usize = 100;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum MessageKind {
    Output,
    Error,
    StageMarker,
    Completed,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct OutputMessage {
    #[serde(rename = "type")]
    pub kind: MessageKind,
    pub line: String,
    pub timestamp: String,
    pub line_num: u64,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub stage: Option<String>,
    /// `begin` or `end` on stage markers.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub status: Option<String>,
}

/// Live output of one task: a bounded history plus a broadcast channel.
pub struct OutputStream {
    task_id: i64,
    history: Mutex<VecDeque<OutputMessage>>,
    sender: broadcast::Sender<OutputMessage>,
    closed: AtomicBool,
    closed_at: Mutex<Option<Instant>>,
}

impl OutputStream {
    pub fn new(task_id: i64) -> Self {
        let (sender, _) = broadcast::channel(CHANNEL_CAPACITY);
        Self {
            task_id,
            history: Mutex::new(VecDeque::with_capacity(HISTORY_CAPACITY)),
            sender,
            closed: AtomicBool::new(false),
            closed_at: Mutex::new(None),
        }
    }

    pub fn task_id(&self) -> i64 {
        self.task_id
    }

    pub fn publish(&self, message: OutputMessage) {
        if self.closed.load(Ordering::Acquire) {
            return;
        }
        let Ok(mut history) = self.history.lock() else {
            return;
        };
        if history.len() == HISTORY_CAPACITY {
            history.pop_front();
        }
        history.push_back(message.clone());
        // No receivers is fine.
        let _ = self.sender.send(message);
    }

    /// Buffered history and a receiver for everything published after it.
    pub fn subscribe(&self) -> (Vec<OutputMessage>, broadcast::Receiver<OutputMessage>) {
        match self.history.lock() {
            Ok(history) => {
                let receiver = self.sender.subscribe();
                (history.iter().cloned().collect(), receiver)
            }
            Err(_) => (Vec::new(), self.sender.subscribe()),
        }
    }

    pub fn history(&self) -> Vec<OutputMessage> {
        self.history
            .lock()
            .map(|h| h.iter().cloned().collect())
            .unwrap_or_default()
    }

    pub fn subscriber_count(&self) -> usize {
        self.sender.receiver_count()
    }

    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::Acquire)
    }

    /// Publish a final `completed` message and stop accepting output.
    pub fn close(&self, summary: &str, line_num: u64) {
        self.publish(OutputMessage {
            kind: MessageKind::Completed,
            line: summary.to_string(),
            timestamp: crate::db::now(),
            line_num,
            stage: None,
            status: None,
        });
        if let Ok(mut closed_at) = self.closed_at.lock() {
            *closed_at = Some(Instant::now());
        }
        self.closed.store(true, Ordering::Release);
    }

    /// Accept output again for another run of the same task. History is kept.
    pub fn reopen(&self) {
        if let Ok(mut closed_at) = self.closed_at.lock() {
            *closed_at = None;
        }
        self.closed.store(false, Ordering::Release);
    }

    /// Time since `close`, if closed.
    pub fn closed_for(&self) -> Option<Duration> {
        self.closed_at.lock().ok().and_then(|c| c.map(|at| at.elapsed()))
    }
}

/// Output streams of every task with live or recent output.
#[derive(Default)]
pub struct StreamRegistry {
    streams: DashMap<i64, Arc<OutputStream>>,
}

impl StreamRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Stream for a run of `task_id`. A stream closed by an earlier run
    /// (plan before confirmation, requeued attempt) is reopened.
    pub fn get_or_create(&self, task_id: i64) -> Arc<OutputStream> {
        let stream = self
            .streams
            .entry(task_id)
            .or_insert_with(|| Arc::new(OutputStream::new(task_id)))
            .clone();
        if stream.is_closed() {
            stream.reopen();
        }
        stream
    }

    pub fn get(&self, task_id: i64) -> Option<Arc<OutputStream>> {
        self.streams.get(&task_id).map(|s| s.value().clone())
    }

    pub fn remove(&self, task_id: i64) -> Option<Arc<OutputStream>> {
        self.streams.remove(&task_id).map(|(_, s)| s)
    }

    /// Drop streams closed for at least `retention` that nobody is watching.
    pub fn prune_closed(&self, retention: Duration) -> usize {
        let before = self.streams.len();
        self.streams.retain(|_, s| {
            let expired = s.closed_for().is_some_and(|age| age >= retention);
            !(expired && s.subscriber_count() == 0)
        });
        before - self.streams.len()
    }

    pub fn len(&self) -> usize {
        self.streams.len()
    }

    pub fn is_empty(&self) -> bool {
        self.streams.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn line(n: u64) -> OutputMessage {
        OutputMessage {
            kind: MessageKind::Output,
            line: format!("line {}", n),
            timestamp: String::new(),
            line_num: n,
            stage: None,
            status: None,
        }
    }

    #[test]
    fn test_history_is_bounded() {
        let stream = OutputStream::new(1);
        for n in 0..(HISTORY_CAPACITY as u64 + 5) {
            stream.publish(line(n));
        }
        let history = stream.history();
        assert_eq!(history.len(), HISTORY_CAPACITY);
        assert_eq!(history[0].line_num, 5);
    }

    #[tokio::test]
    async fn test_subscriber_gets_history_then_live() {
        let stream = OutputStream::new(1);
        stream.publish(line(1));
        let (history, mut rx) = stream.subscribe();
        assert_eq!(history.len(), 1);
        stream.publish(line(2));
        let live = rx.recv().await.unwrap();
        assert_eq!(live.line_num, 2);
    }

    #[test]
    fn test_closed_streams_pruned() {
        let registry = StreamRegistry::new();
        registry.get_or_create(1).close("done", 1);
        registry.get_or_create(2);
        assert_eq!(registry.prune_closed(Duration::from_secs(60)), 0);
        assert_eq!(registry.prune_closed(Duration::ZERO), 1);
        assert!(registry.get(2).is_some());
    }

    #[test]
    fn test_watched_streams_survive_pruning() {
        let registry = StreamRegistry::new();
        let stream = registry.get_or_create(1);
        let (_, _rx) = stream.subscribe();
        stream.close("done", 1);
        assert_eq!(registry.prune_closed(Duration::ZERO), 0);
    }

    #[test]
    fn test_rerun_reopens_closed_stream() {
        let registry = StreamRegistry::new();
        let first = registry.get_or_create(7);
        first.publish(line(1));
        first.close("plan done", 2);

        let second = registry.get_or_create(7);
        assert!(!second.is_closed());
        second.publish(line(3));
        let lines: Vec<u64> = second.history().iter().map(|m| m.line_num).collect();
        assert_eq!(lines, vec![1, 2, 3]);
        assert!(second.closed_for().is_none());
    }
}
