//! Fan-out of a finished item to every destination of a task.
//!
//! Each destination is attempted independently: media is resolved, the
//! post is sent, and the outcome is recorded against the task label. A
//! failure for one destination never affects the others.

use std::sync::Arc;

use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::error::DeliveryError;
use crate::pipeline::types::{MediaResolver, MessageEnvelope, OutboundItem, OutboundSender};
use crate::store::StatsSink;
use crate::tasks::model::Task;

/// Outcome for one destination.
#[derive(Debug, Clone)]
pub struct DestinationResult {
    pub destination: i64,
    pub outcome: Result<(), DeliveryError>,
}

/// Per-destination results of one dispatch.
#[derive(Debug, Clone)]
pub struct DispatchReport {
    /// Correlates the log lines of one dispatch.
    pub id: Uuid,
    pub task: String,
    pub results: Vec<DestinationResult>,
}

impl DispatchReport {
    pub fn delivered(&self) -> usize {
        self.results.iter().filter(|r| r.outcome.is_ok()).count()
    }

    pub fn failed(&self) -> usize {
        self.results.len() - self.delivered()
    }

    /// Nothing was attempted (no media and no caption).
    pub fn is_empty(&self) -> bool {
        self.results.is_empty()
    }
}

pub struct Dispatcher {
    sender: Arc<dyn OutboundSender>,
    media: Arc<dyn MediaResolver>,
    stats: Arc<dyn StatsSink>,
}

impl Dispatcher {
    pub fn new(
        sender: Arc<dyn OutboundSender>,
        media: Arc<dyn MediaResolver>,
        stats: Arc<dyn StatsSink>,
    ) -> Self {
        Self {
            sender,
            media,
            stats,
        }
    }

    /// Deliver `items` with `caption` to each of the task's destinations.
    ///
    /// Items without media contribute nothing but their place in the post;
    /// when none carries media the caption goes out as a text message.
    pub async fn dispatch(
        &self,
        task: &Task,
        items: &[MessageEnvelope],
        caption: &str,
    ) -> DispatchReport {
        let mut report = DispatchReport {
            id: Uuid::new_v4(),
            task: task.label.clone(),
            results: Vec::with_capacity(task.destinations.len()),
        };

        let has_media = items.iter().any(|m| m.media.is_some());
        if !has_media && caption.trim().is_empty() {
            debug!(task = %task.label, "Nothing to send (no media, empty caption)");
            return report;
        }

        for &destination in &task.destinations {
            let outcome = if has_media {
                self.send_media(destination, items, caption).await
            } else {
                self.sender.send_text(destination, caption).await
            };

            match &outcome {
                Ok(()) => info!(
                    dispatch = %report.id,
                    task = %task.label,
                    destination,
                    items = items.len(),
                    "Delivered"
                ),
                Err(e) => warn!(
                    dispatch = %report.id,
                    task = %task.label,
                    destination,
                    kind = e.label(),
                    error = %e,
                    "Delivery failed"
                ),
            }

            if let Err(e) = self
                .stats
                .record_stat(task.owner_id, &task.label, outcome.is_ok())
                .await
            {
                warn!(task = %task.label, error = %e, "Failed to record delivery stat");
            }

            report.results.push(DestinationResult {
                destination,
                outcome,
            });
        }

        report
    }

    /// Resolve every media item for one destination, then send them as one
    /// post. A missing body aborts this destination only; a missing
    /// thumbnail is left out.
    async fn send_media(
        &self,
        destination: i64,
        items: &[MessageEnvelope],
        caption: &str,
    ) -> Result<(), DeliveryError> {
        let mut outbound = Vec::with_capacity(items.len());
        for media in items.iter().filter_map(|m| m.media.as_ref()) {
            let body = self
                .media
                .fetch_media(media)
                .await
                .map_err(|source| DeliveryError::MediaUnavailable {
                    destination,
                    source,
                })?;
            let thumbnail = self.media.thumbnail(media, &body).await;

            outbound.push(OutboundItem {
                kind: media.kind,
                body,
                thumbnail,
                file_name: media.file_name.clone(),
                mime_type: media.mime_type.clone(),
            });
        }

        self.sender.send_items(destination, outbound, caption).await
    }
}
