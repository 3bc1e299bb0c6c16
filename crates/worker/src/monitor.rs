//! Per-frame statistics published for observers
//!
//! The processor publishes; observers subscribe and get the recent history
//! followed by live entries. Publishing never waits on observers: slow
//! subscribers lag and skip entries instead.

use crate::distributor::ConnectionId;
use crate::tensor::TensorSummary;
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use splitinfer_proto::Prediction;
use std::collections::VecDeque;
use tokio::sync::broadcast;

/// Outcome of one predicted frame
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MonitorEntry {
    pub frame_number: u32,
    pub connection_id: ConnectionId,
    pub inference_time_ms: u64,
    pub predictions: Vec<Prediction>,
    /// Summary of the decoded input tensor
    pub preview: TensorSummary,
}

pub struct MonitorStats {
    tx: broadcast::Sender<MonitorEntry>,
    history: Mutex<VecDeque<MonitorEntry>>,
    capacity: usize,
}

impl MonitorStats {
    /// Keep the last `capacity` entries for late subscribers
    pub fn new(capacity: usize) -> Self {
        let (tx, _) = broadcast::channel(capacity.max(16));
        Self {
            tx,
            history: Mutex::new(VecDeque::with_capacity(capacity)),
            capacity,
        }
    }

    pub fn publish(&self, entry: MonitorEntry) {
        let mut history = self.history.lock();
        if self.capacity > 0 {
            if history.len() == self.capacity {
                history.pop_front();
            }
            history.push_back(entry.clone());
        }
        // No subscribers is fine
        let _ = self.tx.send(entry);
    }

    /// Snapshot of the history plus a receiver for everything after it
    pub fn subscribe(&self) -> (Vec<MonitorEntry>, broadcast::Receiver<MonitorEntry>) {
        let history = self.history.lock();
        (history.iter().cloned().collect(), self.tx.subscribe())
    }

    pub fn history_len(&self) -> usize {
        self.history.lock().len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::tensor::DType;

    fn entry(frame_number: u32) -> MonitorEntry {
        MonitorEntry {
            frame_number,
            connection_id: 1,
            inference_time_ms: 3,
            predictions: Vec::new(),
            preview: TensorSummary {
                shape: vec![1],
                dtype: DType::U8,
                min: 0.0,
                max: 0.0,
                mean: 0.0,
            },
        }
    }

    #[test]
    fn test_history_is_bounded() {
        let stats = MonitorStats::new(3);
        for i in 0..5 {
            stats.publish(entry(i));
        }

        let (history, _) = stats.subscribe();
        let frames: Vec<u32> = history.iter().map(|e| e.frame_number).collect();
        assert_eq!(frames, vec![2, 3, 4]);
    }

    #[tokio::test]
    async fn test_subscriber_sees_history_then_live() {
        let stats = MonitorStats::new(8);
        stats.publish(entry(1));

        let (history, mut rx) = stats.subscribe();
        stats.publish(entry(2));

        assert_eq!(history, vec![entry(1)]);
        assert_eq!(rx.recv().await.unwrap(), entry(2));
    }

    #[test]
    fn test_entry_json_shape() {
        let value = serde_json::to_value(entry(7)).unwrap();
        assert_eq!(value["frame_number"], 7);
        assert_eq!(value["preview"]["dtype"], "uint8");
    }
}
