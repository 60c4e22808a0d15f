//! Per-task NDJSON log stream manager backing `WS /ws/logs/{task_id}`.
//! Keeps a bounded history ring per task plus a live broadcast channel,
//! so a subscriber joining mid-task gets the backlog before tailing.

use std::collections::{HashMap, VecDeque};
use std::sync::Arc;
use tokio::sync::{broadcast, Mutex};
use uuid::Uuid;

const MAX_HISTORY_LINES: usize = 10_000;

struct TaskStream {
    tx: broadcast::Sender<String>,
    history: VecDeque<String>,
    ended: bool,
}

/// Each agent's runtime broadcasts its structured log lines here in
/// real time; WS clients subscribe to get history replay + live tail for
/// any task.
pub struct TaskStreamManager {
    streams: Mutex<HashMap<Uuid, TaskStream>>,
}

impl TaskStreamManager {
    pub fn new() -> Arc<Self> {
        Arc::new(Self { streams: Mutex::new(HashMap::new()) })
    }

    pub async fn start(&self, task_id: Uuid) {
        let (tx, _) = broadcast::channel(512);
        let mut map = self.streams.lock().await;
        map.insert(task_id, TaskStream { tx, history: VecDeque::new(), ended: false });
    }

    pub async fn push_line(&self, task_id: Uuid, line: String) {
        let mut map = self.streams.lock().await;
        if let Some(s) = map.get_mut(&task_id) {
            let _ = s.tx.send(line.clone());
            s.history.push_back(line);
            if s.history.len() > MAX_HISTORY_LINES {
                s.history.pop_front();
            }
        }
    }

    pub async fn push_agent_log(&self, task_id: Uuid, agent: &str, level: &str, msg: &str) {
        let line = serde_json::json!({
            "agent": agent,
            "level": level,
            "msg": msg,
        })
        .to_string();
        self.push_line(task_id, line).await;
    }

    /// Marks a task's stream ended (sends a `stream_end` marker, keeps
    /// history for late subscribers).
    pub async fn end_task(&self, task_id: Uuid) {
        let line = r#"{"type":"stream_end"}"#.to_string();
        let mut map = self.streams.lock().await;
        if let Some(s) = map.get_mut(&task_id) {
            let _ = s.tx.send(line.clone());
            s.history.push_back(line);
            if s.history.len() > MAX_HISTORY_LINES {
                s.history.pop_front();
            }
            s.ended = true;
        }
    }

    /// Returns `(history_snapshot, live_receiver)`. The receiver is
    /// `None` once the stream has ended, signalling the WS handler to
    /// close after replaying history.
    pub async fn subscribe(&self, task_id: Uuid) -> (Vec<String>, Option<broadcast::Receiver<String>>) {
        let map = self.streams.lock().await;
        match map.get(&task_id) {
            Some(s) => {
                let history: Vec<String> = s.history.iter().cloned().collect();
                let rx = if !s.ended { Some(s.tx.subscribe()) } else { None };
                (history, rx)
            }
            None => (Vec::new(), None),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn subscribe_replays_history_then_live_tail() {
        let mgr = TaskStreamManager::new();
        let task_id = Uuid::new_v4();
        mgr.start(task_id).await;
        mgr.push_agent_log(task_id, "planner", "info", "starting").await;

        let (history, rx) = mgr.subscribe(task_id).await;
        assert_eq!(history.len(), 1);
        assert!(rx.is_some());
    }

    #[tokio::test]
    async fn ended_stream_has_no_live_receiver() {
        let mgr = TaskStreamManager::new();
        let task_id = Uuid::new_v4();
        mgr.start(task_id).await;
        mgr.end_task(task_id).await;

        let (history, rx) = mgr.subscribe(task_id).await;
        assert_eq!(history.last().unwrap(), r#"{"type":"stream_end"}"#);
        assert!(rx.is_none());
    }

    #[tokio::test]
    async fn unknown_task_returns_empty_history_and_no_receiver() {
        let mgr = TaskStreamManager::new();
        let (history, rx) = mgr.subscribe(Uuid::new_v4()).await;
        assert!(history.is_empty());
        assert!(rx.is_none());
    }
}
