//! In-process publish/subscribe.
//!
//! Delivery goes to subscribers attached at publish time. Nothing is stored
//! for late subscribers; consumers that need durability should poll the
//! query interface instead.

use crate::StudyKey;
use chrono::{DateTime, Utc};
use std::sync::mpsc::{self, Receiver, Sender};
use std::sync::Mutex;
use uuid::Uuid;

/// Broadcast when a study has been closed and its report handed to export
#[derive(Clone, Debug, PartialEq)]
pub struct StudyClosed {
    pub study: StudyKey,
    pub total_dap: f64,
    pub exposure_count: u32,
    /// Export item carrying the report, if the build succeeded
    pub export_item: Option<Uuid>,
    pub closed_at: DateTime<Utc>,
}

/// Live dose figures for display after each exposure
#[derive(Clone, Debug, PartialEq)]
pub struct DoseUpdate {
    pub study: StudyKey,
    pub exposure_id: Uuid,
    pub exposure_dap: Option<f64>,
    pub total_dap: f64,
    pub exposure_count: u32,
    pub threshold_exceeded: bool,
}

/// Registry of channel subscribers for one event type
pub struct Broadcast<T> {
    subscribers: Mutex<Vec<Sender<T>>>,
}

impl<T: Clone> Broadcast<T> {
    pub fn new() -> Self {
        Self {
            subscribers: Mutex::new(Vec::new()),
        }
    }

    pub fn subscribe(&self) -> Receiver<T> {
        let (tx, rx) = mpsc::channel();
        self.subscribers
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .push(tx);
        rx
    }

    /// Send to every live subscriber, dropping the disconnected ones.
    /// Returns the number of subscribers reached.
    pub fn publish(&self, event: T) -> usize {
        let mut subscribers = self.subscribers.lock().unwrap_or_else(|e| e.into_inner());
        subscribers.retain(|tx| tx.send(event.clone()).is_ok());
        subscribers.len()
    }

    pub fn subscriber_count(&self) -> usize {
        self.subscribers.lock().unwrap_or_else(|e| e.into_inner()).len()
    }
}

impl<T: Clone> Default for Broadcast<T> {
    fn default() -> Self {
        Self::new()
    }
}
