//! Batch copy of a message range from one channel to a destination.
//!
//! The range is given as two `https://t.me/c/<channel>/<message>` links.
//! Messages are copied one by one in ascending id order, paced to stay
//! clear of platform flood limits.

use std::time::Duration;

use async_trait::async_trait;
use tracing::{info, warn};

use crate::error::{DeliveryError, PipelineError};
use crate::tasks::model::marked_channel_id;

/// Pause after each successful copy.
pub const DEFAULT_PACE: Duration = Duration::from_millis(1500);
/// Pause after a failed copy.
pub const DEFAULT_ERROR_PACE: Duration = Duration::from_secs(3);
/// Largest range a single batch may cover.
pub const MAX_BATCH_SPAN: i64 = 5000;

/// Platform primitive that re-posts an existing message.
#[async_trait]
pub trait BatchCopier: Send + Sync {
    async fn copy_message(
        &self,
        from_chat: i64,
        message_id: i64,
        to_chat: i64,
    ) -> Result<(), DeliveryError>;
}

/// Parse a private-channel message link into `(marked chat id, message id)`.
pub fn parse_message_link(link: &str) -> Result<(i64, i64), PipelineError> {
    let invalid = || PipelineError::InvalidLink(link.to_string());

    let rest = link
        .trim()
        .strip_prefix("https://")
        .or_else(|| link.trim().strip_prefix("http://"))
        .ok_or_else(invalid)?;
    let path = rest.strip_prefix("t.me/c/").ok_or_else(invalid)?;

    let mut parts = path.split('/');
    let channel = parts.next().ok_or_else(invalid)?;
    let message = parts.next().ok_or_else(invalid)?;
    // Links may carry a `?single` style query on the message part.
    let message = message.split(['?', '#']).next().unwrap_or_default();

    let all_digits = |s: &str| !s.is_empty() && s.bytes().all(|b| b.is_ascii_digit());
    if !all_digits(channel) || !all_digits(message) {
        return Err(invalid());
    }

    let channel: i64 = channel.parse().map_err(|_| invalid())?;
    let message: i64 = message.parse().map_err(|_| invalid())?;
    if channel == 0 || message == 0 {
        return Err(invalid());
    }
    let source = marked_channel_id(channel).ok_or_else(invalid)?;
    Ok((source, message))
}

/// A validated batch range.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BatchRequest {
    pub source: i64,
    pub first: i64,
    pub last: i64,
    pub destination: i64,
}

impl BatchRequest {
    /// Build from two links and a destination chat id.
    ///
    /// Links may be given in either order.
    pub fn from_links(start: &str, end: &str, destination: i64) -> Result<Self, PipelineError> {
        let (start_chat, start_id) = parse_message_link(start)?;
        let (end_chat, end_id) = parse_message_link(end)?;

        if start_chat != end_chat {
            return Err(PipelineError::Batch(
                "start and end links must be from the same channel".into(),
            ));
        }

        let (first, last) = if start_id <= end_id {
            (start_id, end_id)
        } else {
            (end_id, start_id)
        };
        if last - first + 1 > MAX_BATCH_SPAN {
            return Err(PipelineError::Batch(format!(
                "range of {} messages exceeds the limit of {MAX_BATCH_SPAN}",
                last - first + 1
            )));
        }

        Ok(Self {
            source: start_chat,
            first,
            last,
            destination,
        })
    }

    pub fn len(&self) -> usize {
        (self.last - self.first + 1) as usize
    }

    pub fn is_empty(&self) -> bool {
        self.last < self.first
    }
}

#[derive(Debug, Clone, Copy)]
pub struct BatchPacing {
    pub between: Duration,
    pub after_error: Duration,
}

impl Default for BatchPacing {
    fn default() -> Self {
        Self {
            between: DEFAULT_PACE,
            after_error: DEFAULT_ERROR_PACE,
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct BatchReport {
    pub copied: usize,
    pub failed_ids: Vec<i64>,
}

impl BatchReport {
    pub fn failed(&self) -> usize {
        self.failed_ids.len()
    }
}

/// Copy every message in the request's range, continuing past failures.
pub async fn run_batch(
    copier: &dyn BatchCopier,
    request: BatchRequest,
    pacing: BatchPacing,
) -> BatchReport {
    info!(
        source = request.source,
        first = request.first,
        last = request.last,
        destination = request.destination,
        "Batch copy started"
    );

    let mut report = BatchReport::default();
    for message_id in request.first..=request.last {
        match copier
            .copy_message(request.source, message_id, request.destination)
            .await
        {
            Ok(()) => {
                report.copied += 1;
                tokio::time::sleep(pacing.between).await;
            }
            Err(e) => {
                warn!(message_id, error = %e, "Batch copy failed for message, skipping");
                report.failed_ids.push(message_id);
                tokio::time::sleep(pacing.after_error).await;
            }
        }
    }

    info!(
        copied = report.copied,
        failed = report.failed(),
        "Batch copy complete"
    );
    report
}
