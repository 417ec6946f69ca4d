//! Work request construction and the discovery-tag codec.
//!
//! The platform scheduler knows nothing about job records; job identity is
//! carried on every submitted request as discovery tags. This crate owns the
//! tag scheme and the deterministic encode/decode between a job's identity
//! fields and a schedulable [`RequestSpec`].
//!
//! # Invariants
//!
//! - `decode(encode(job).tags)` returns the same identity fields.
//! - A spec is never built expedited with a non-zero delay; the platform
//!   rejects or silently ignores such requests, so the expedite flag is
//!   suppressed instead.

use serde::{Deserialize, Serialize};
use thiserror::Error;

use jobsync_statemap::Priority;

/// Tag prefix carrying the job id.
pub const TAG_PREFIX_JOB_ID: &str = "job_id:";

/// Tag prefix carrying the job function name.
pub const TAG_PREFIX_JOB_FUNC: &str = "job_func:";

/// Literal tag marking an expedited request.
pub const TAG_EXPEDITED: &str = "job_expedited";

/// Literal tag marking a long-running request.
pub const TAG_LONG_RUNNING: &str = "job_long_running";

/// Build the discovery tag for a job id.
pub fn job_id_tag(id: &str) -> String {
    format!("{TAG_PREFIX_JOB_ID}{id}")
}

/// Build the discovery tag for a job function.
pub fn job_func_tag(func: &str) -> String {
    format!("{TAG_PREFIX_JOB_FUNC}{func}")
}

/// Errors decoding a request's tags back into job identity.
#[derive(Debug, Error, PartialEq, Eq)]
pub enum DecodeError {
    /// A required identity tag was absent. The request was created by an
    /// incompatible version and is unreconcilable for that job.
    #[error("request tags missing required tag: {0}")]
    MissingTag(&'static str),
}

/// Job identity fields recovered from a request's tags.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RequestIdentity {
    /// Job id from the job store.
    pub job_id: String,

    /// Function name of the job body.
    pub job_func: String,

    /// Whether the request was submitted expedited.
    pub expedite: bool,

    /// Whether the request was marked long-running.
    pub long_running: bool,
}

/// Decode job identity from a request's discovery tags.
///
/// Fails if the job id or job function tag is absent.
pub fn decode(tags: &[String]) -> Result<RequestIdentity, DecodeError> {
    let mut job_id = None;
    let mut job_func = None;
    let mut expedite = false;
    let mut long_running = false;

    for tag in tags {
        if let Some(id) = tag.strip_prefix(TAG_PREFIX_JOB_ID) {
            job_id = Some(id.to_string());
        } else if let Some(func) = tag.strip_prefix(TAG_PREFIX_JOB_FUNC) {
            job_func = Some(func.to_string());
        } else if tag == TAG_EXPEDITED {
            expedite = true;
        } else if tag == TAG_LONG_RUNNING {
            long_running = true;
        }
    }

    Ok(RequestIdentity {
        job_id: job_id.ok_or(DecodeError::MissingTag("job_id"))?,
        job_func: job_func.ok_or(DecodeError::MissingTag("job_func"))?,
        expedite,
        long_running,
    })
}

/// A fully built, schedulable work request.
///
/// `unique_name` is the scheduler's uniqueness key: one live request per
/// job id at a time.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RequestSpec {
    /// Uniqueness key at the scheduler (the job id).
    pub unique_name: String,

    /// Discovery tags encoding job identity.
    pub tags: Vec<String>,

    /// Initial delay before the request becomes runnable.
    pub delay_secs: u32,

    /// Whether the request is submitted expedited.
    pub expedited: bool,
}

/// Builder for [`RequestSpec`]s.
#[derive(Debug, Clone)]
pub struct RequestBuilder {
    id: String,
    func: Option<String>,
    expedite: bool,
    long_running: bool,
    delay_secs: u32,
}

impl RequestBuilder {
    /// Start a builder for the given job id.
    pub fn new(id: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            func: None,
            expedite: false,
            long_running: false,
            delay_secs: 0,
        }
    }

    /// Rebuild a request from identity decoded off an existing request,
    /// preserving its original expedite and long-running intent.
    pub fn from_identity(identity: &RequestIdentity) -> Self {
        Self::new(identity.job_id.clone())
            .func(identity.job_func.clone())
            .expedite(identity.expedite)
            .long_running(identity.long_running)
    }

    /// Job id this request is for.
    pub fn id(&self) -> &str {
        &self.id
    }

    /// Set the job function name.
    pub fn func(mut self, func: impl Into<String>) -> Self {
        self.func = Some(func.into());
        self
    }

    /// Request expedited scheduling.
    pub fn expedite(mut self, expedite: bool) -> Self {
        self.expedite = expedite;
        self
    }

    /// Derive the expedite flag from a job priority.
    pub fn expedite_for(self, priority: Priority) -> Self {
        self.expedite(priority.expedites())
    }

    /// Mark the request long-running.
    pub fn long_running(mut self, long_running: bool) -> Self {
        self.long_running = long_running;
        self
    }

    /// Set the initial delay in seconds.
    pub fn delay_secs(mut self, delay_secs: u32) -> Self {
        self.delay_secs = delay_secs;
        self
    }

    /// Build the request spec.
    ///
    /// Expedite is only honored with zero delay; otherwise the flag and its
    /// tag are dropped from the built spec.
    pub fn build(self) -> RequestSpec {
        let expedited = self.expedite && self.delay_secs == 0;

        let mut tags = vec![job_id_tag(&self.id)];
        if let Some(func) = &self.func {
            tags.push(job_func_tag(func));
        }
        if expedited {
            tags.push(TAG_EXPEDITED.to_string());
        }
        if self.long_running {
            tags.push(TAG_LONG_RUNNING.to_string());
        }

        RequestSpec {
            unique_name: self.id,
            tags,
            delay_secs: self.delay_secs,
            expedited,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_tag_roundtrip() {
        let spec = RequestBuilder::new("j1")
            .func("sync")
            .expedite(true)
            .long_running(true)
            .build();

        let identity = decode(&spec.tags).unwrap();
        assert_eq!(identity.job_id, "j1");
        assert_eq!(identity.job_func, "sync");
        assert!(identity.expedite);
        assert!(identity.long_running);
    }

    #[test]
    fn test_expedite_suppressed_with_delay() {
        let spec = RequestBuilder::new("j1")
            .func("sync")
            .expedite(true)
            .delay_secs(30)
            .build();

        assert!(!spec.expedited);
        assert!(!spec.tags.iter().any(|t| t == TAG_EXPEDITED));

        // Decoding reflects what was actually submitted.
        let identity = decode(&spec.tags).unwrap();
        assert!(!identity.expedite);
    }

    #[test]
    fn test_expedite_honored_with_zero_delay() {
        let spec = RequestBuilder::new("j1")
            .func("sync")
            .expedite(true)
            .delay_secs(0)
            .build();

        assert!(spec.expedited);
        assert!(spec.tags.iter().any(|t| t == TAG_EXPEDITED));
    }

    #[test]
    fn test_expedite_for_priority() {
        let spec = RequestBuilder::new("j1")
            .func("sync")
            .expedite_for(Priority::High)
            .build();
        assert!(spec.expedited);

        let spec = RequestBuilder::new("j1")
            .func("sync")
            .expedite_for(Priority::Regular)
            .build();
        assert!(!spec.expedited);
    }

    #[test]
    fn test_decode_missing_tags() {
        let err = decode(&[job_func_tag("sync")]).unwrap_err();
        assert_eq!(err, DecodeError::MissingTag("job_id"));

        let err = decode(&[job_id_tag("j1")]).unwrap_err();
        assert_eq!(err, DecodeError::MissingTag("job_func"));
    }

    #[test]
    fn test_from_identity_preserves_intent() {
        let original = RequestBuilder::new("j2")
            .func("cleanup")
            .expedite(false)
            .long_running(true)
            .build();

        let identity = decode(&original.tags).unwrap();
        let rebuilt = RequestBuilder::from_identity(&identity).build();

        assert_eq!(rebuilt.unique_name, "j2");
        assert_eq!(rebuilt.tags, original.tags);
    }

    #[test]
    fn test_unique_name_is_job_id() {
        let spec = RequestBuilder::new("j3").func("sync").build();
        assert_eq!(spec.unique_name, "j3");
    }
}
