//! Fault taxonomy for benchmark runs.
//!
//! Only the variants reported by [`BenchError::is_fatal`] end the process with a
//! non-zero status. Point failures, missing metric labels and gate decisions are
//! absorbed into the data model and never surface as errors.

/// Typed faults raised by the environment, supervisor and sweep layers.
#[derive(Debug, thiserror::Error)]
pub enum BenchError {
    /// The isolated environment could not be provisioned or validated.
    #[error("environment fault: {0}")]
    EnvironmentFault(String),

    /// The server never printed its readiness marker.
    #[error("server did not become ready within {timeout_secs}s")]
    StartupTimeout { timeout_secs: u64 },

    /// The server died (or logged a fatal marker) before becoming ready.
    #[error("server crashed during startup: {reason}")]
    StartupCrash { reason: String },

    /// The server died between points and the single restart attempt failed.
    #[error("server crashed mid-sweep and could not be recovered: {reason}")]
    MidRunCrash { reason: String },
}

impl BenchError {
    /// Whether this fault aborts the whole run.
    pub fn is_fatal(&self) -> bool {
        !matches!(self, BenchError::MidRunCrash { .. })
    }

    /// Locate a typed fault anywhere in an `anyhow` error chain.
    pub fn find(error: &anyhow::Error) -> Option<&BenchError> {
        error
            .chain()
            .find_map(|cause| cause.downcast_ref::<BenchError>())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use anyhow::Context;

    #[test]
    fn mid_run_crash_is_not_fatal() {
        let err = BenchError::MidRunCrash {
            reason: "health probe failed".into(),
        };
        assert!(!err.is_fatal());
        assert!(BenchError::StartupTimeout { timeout_secs: 600 }.is_fatal());
        assert!(BenchError::EnvironmentFault("pull failed".into()).is_fatal());
    }

    #[test]
    fn find_walks_context_chain() {
        let result: anyhow::Result<()> = Err(BenchError::StartupCrash {
            reason: "oom".into(),
        })
        .context("variant baseline");
        let err = result.unwrap_err();
        match BenchError::find(&err) {
            Some(BenchError::StartupCrash { reason }) => assert_eq!(reason, "oom"),
            other => panic!("unexpected {other:?}"),
        }
    }
}
