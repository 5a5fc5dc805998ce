//! Result correlation for inbound frames.
//!
//! The receive loop hands every text frame to [`Correlator::handle_text`],
//! which classifies it and applies its effect:
//! - auth acks are reported back to the session
//! - server job ids are attached to the oldest waiting batch job
//! - progress goes to the progress observer and never touches the cache
//! - errors and data are written to the cache slot of every fingerprint
//!   listed in the frame's `cache_key`
//!
//! Frame handling never blocks and never fails: malformed frames are logged
//! and dropped. File results are only recorded here; downloading them is
//! left to the waiter on the caller's task.

pub mod file_results;
pub mod progress;

pub use progress::{LogProgress, ProgressObserver, ProgressReporter};

use std::sync::Arc;

use serde_json::Value;

use crate::cache::fingerprint::render_value;
use crate::cache::{CacheStore, Fingerprint, Resolution};
use crate::protocol::{InboundFrame, parse_inbound};
use crate::session::jobs::JobRegistry;

/// Longest frame excerpt included in log lines.
const LOG_EXCERPT_LIMIT: usize = 200;

/// What the session should do after a frame was handled.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FrameOutcome {
    /// The service acknowledged the API key.
    Authenticated,
    /// The frame wrote at least one cache slot.
    Resolved,
    /// The frame was applied without touching the cache.
    Handled,
    /// The frame was valid but had nothing to apply.
    Ignored,
    /// The frame could not be parsed and was dropped.
    Malformed,
}

pub struct Correlator {
    cache: Arc<CacheStore>,
    jobs: Arc<JobRegistry>,
    progress: ProgressReporter,
}

impl Correlator {
    pub fn new(
        cache: Arc<CacheStore>,
        jobs: Arc<JobRegistry>,
        observer: Arc<dyn ProgressObserver>,
    ) -> Self {
        Self {
            cache,
            jobs,
            progress: ProgressReporter::new(observer),
        }
    }

    pub fn handle_text(&self, text: &str, authenticated: bool) -> FrameOutcome {
        match parse_inbound(text) {
            Ok(frame) => self.handle_frame(frame, authenticated),
            Err(e) => {
                log::warn!(
                    target: "finx_socket::correlator",
                    "Dropping malformed frame ({}): {}",
                    e,
                    excerpt(text)
                );
                FrameOutcome::Malformed
            }
        }
    }

    pub fn handle_frame(&self, frame: InboundFrame, authenticated: bool) -> FrameOutcome {
        match frame {
            InboundFrame::AuthAck if !authenticated => FrameOutcome::Authenticated,
            InboundFrame::AuthAck => FrameOutcome::Ignored,
            InboundFrame::JobId(job_id) => match self.jobs.assign_job_id(job_id.clone()) {
                Some(batch) => {
                    log::debug!(
                        target: "finx_socket::correlator",
                        "Batch {} assigned server job id {}",
                        batch,
                        job_id
                    );
                    FrameOutcome::Handled
                }
                None => {
                    log::debug!(
                        target: "finx_socket::correlator",
                        "Job id {} arrived with no batch waiting for one",
                        job_id
                    );
                    FrameOutcome::Ignored
                }
            },
            InboundFrame::Progress(update) => {
                self.progress.report(&update);
                FrameOutcome::Handled
            }
            InboundFrame::Error {
                message,
                cache_keys,
            } => {
                log::error!(target: "finx_socket::correlator", "API returned error: {}", message);
                if cache_keys.is_empty() {
                    return FrameOutcome::Ignored;
                }
                for fingerprint in &cache_keys {
                    self.cache
                        .write(fingerprint, Resolution::RemoteError(message.clone()));
                }
                FrameOutcome::Resolved
            }
            InboundFrame::Data {
                payload,
                cache_keys,
            } => {
                if cache_keys.is_empty() {
                    return FrameOutcome::Ignored;
                }
                self.distribute(payload, &cache_keys);
                FrameOutcome::Resolved
            }
            InboundFrame::Status(payload) => {
                log::debug!(
                    target: "finx_socket::correlator",
                    "Status frame: {}",
                    excerpt(&payload.to_string())
                );
                FrameOutcome::Ignored
            }
        }
    }

    /// Write the part of `payload` that belongs to each fingerprint.
    fn distribute(&self, payload: Value, cache_keys: &[Fingerprint]) {
        if let Value::Array(records) = &payload
            && records_carry_identity(records)
        {
            for fingerprint in cache_keys {
                let resolution = match select_record(records, fingerprint) {
                    Selection::Record(record) => Resolution::from_payload(record.clone()),
                    Selection::Whole => Resolution::from_payload(payload.clone()),
                    Selection::NoMatch => {
                        log::warn!(
                            target: "finx_socket::correlator",
                            "No record in a {}-record result matches {}",
                            records.len(),
                            fingerprint
                        );
                        Resolution::Unmatched(format!(
                            "no record among {} matches the request",
                            records.len()
                        ))
                    }
                };
                self.cache.write(fingerprint, resolution);
            }
            return;
        }

        if let [fingerprint] = cache_keys {
            self.cache.write(fingerprint, Resolution::from_payload(payload));
            return;
        }
        for fingerprint in cache_keys {
            self.cache
                .write(fingerprint, Resolution::from_payload(payload.clone()));
        }
    }
}

enum Selection<'a> {
    Record(&'a Value),
    Whole,
    NoMatch,
}

/// Records identify themselves through `cache_key` or `security_id`.
fn records_carry_identity(records: &[Value]) -> bool {
    !records.is_empty()
        && records.iter().all(Value::is_object)
        && records
            .iter()
            .any(|r| r.get("cache_key").is_some() || r.get("security_id").is_some())
}

fn record_fingerprint(record: &Value) -> Option<Fingerprint> {
    match record.get("cache_key")? {
        Value::String(cell) => Fingerprint::from_cell(cell),
        other => Fingerprint::from_wire(other),
    }
}

/// Pick the record answering `fingerprint`.
///
/// An exact `cache_key` match wins; otherwise records are matched on the
/// security id encoded in the primary key. Requests without a security id
/// receive the whole list unless the records are keyed by `cache_key`.
fn select_record<'a>(records: &'a [Value], fingerprint: &Fingerprint) -> Selection<'a> {
    if let Some(record) = records
        .iter()
        .find(|r| record_fingerprint(r).as_ref() == Some(fingerprint))
    {
        return Selection::Record(record);
    }

    let keyed_by_cache_key = records.iter().any(|r| r.get("cache_key").is_some());
    match fingerprint.security_id() {
        Some(security_id) if records.iter().any(|r| r.get("security_id").is_some()) => records
            .iter()
            .find(|r| {
                r.get("security_id")
                    .is_some_and(|id| render_value(id) == security_id)
            })
            .map_or(Selection::NoMatch, Selection::Record),
        _ if keyed_by_cache_key => Selection::NoMatch,
        _ => Selection::Whole,
    }
}

fn excerpt(text: &str) -> &str {
    match text.char_indices().nth(LOG_EXCERPT_LIMIT) {
        Some((index, _)) => &text[..index],
        None => text,
    }
}
