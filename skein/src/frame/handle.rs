//! Resume handles: authenticated references to a paused frame + snapshot.
//!
//! A handle's token is opaque and single-use by default; validation rejects
//! unknown tokens, expired tokens, replays, rollbacks (stale frame version),
//! and frames that are not in a resumable status.

use std::collections::HashMap;
use std::sync::Mutex;

use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};

use super::{ExecutionFrame, FrameError};

/// Reference handed to callers when a frame pauses or waits for intervention.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct ResumeHandle {
    pub frame_id: String,
    pub snapshot_id: String,
    pub frame_version: u64,
    pub token: String,
}

struct IssuedToken {
    frame_id: String,
    snapshot_id: String,
    frame_version: u64,
    owner: String,
    scope: String,
    expires_at: DateTime<Utc>,
    remaining_uses: u32,
}

/// Issues and validates resume tokens.
pub struct HandleIssuer {
    ttl: Duration,
    tokens: Mutex<HashMap<String, IssuedToken>>,
}

impl Default for HandleIssuer {
    fn default() -> Self {
        Self {
            ttl: Duration::hours(24),
            tokens: Mutex::new(HashMap::new()),
        }
    }
}

impl HandleIssuer {
    pub fn new(ttl: Duration) -> Self {
        Self {
            ttl,
            tokens: Mutex::new(HashMap::new()),
        }
    }

    /// Issues a single-use handle bound to the frame's current version and
    /// snapshot.
    pub fn issue(&self, frame: &ExecutionFrame, owner: &str) -> ResumeHandle {
        let token = format!("rtk_{}", uuid::Uuid::new_v4().simple());
        let handle = ResumeHandle {
            frame_id: frame.frame_id.clone(),
            snapshot_id: frame.context_snapshot_id.clone(),
            frame_version: frame.version,
            token: token.clone(),
        };
        let mut tokens = self.tokens.lock().unwrap_or_else(|e| e.into_inner());
        tokens.insert(
            token,
            IssuedToken {
                frame_id: frame.frame_id.clone(),
                snapshot_id: frame.context_snapshot_id.clone(),
                frame_version: frame.version,
                owner: owner.to_string(),
                scope: "resume".to_string(),
                expires_at: Utc::now() + self.ttl,
                remaining_uses: 1,
            },
        );
        handle
    }

    /// Validates and consumes one use of a handle against the live frame.
    pub fn validate(
        &self,
        handle: &ResumeHandle,
        frame: &ExecutionFrame,
        owner: &str,
    ) -> Result<(), FrameError> {
        let mut tokens = self.tokens.lock().unwrap_or_else(|e| e.into_inner());
        let record = tokens
            .get_mut(&handle.token)
            .ok_or_else(|| FrameError::InvalidHandle("unknown token".to_string()))?;

        if record.scope != "resume" {
            return Err(FrameError::InvalidHandle("wrong scope".to_string()));
        }
        if record.owner != owner {
            return Err(FrameError::InvalidHandle("wrong owner".to_string()));
        }
        if record.frame_id != handle.frame_id
            || record.snapshot_id != handle.snapshot_id
            || record.frame_version != handle.frame_version
        {
            return Err(FrameError::InvalidHandle(
                "handle does not match issued token".to_string(),
            ));
        }
        if record.frame_id != frame.frame_id {
            return Err(FrameError::InvalidHandle("wrong frame".to_string()));
        }
        if Utc::now() > record.expires_at {
            return Err(FrameError::InvalidHandle("token expired".to_string()));
        }
        if record.remaining_uses == 0 {
            return Err(FrameError::InvalidHandle("token replayed".to_string()));
        }
        // Stale version: the frame progressed since the handle was issued;
        // resuming would roll it back.
        if frame.version != handle.frame_version {
            return Err(FrameError::InvalidHandle(format!(
                "stale frame version {} (current {})",
                handle.frame_version, frame.version
            )));
        }
        if !frame.status.is_resumable() {
            return Err(FrameError::NotResumable {
                frame_id: frame.frame_id.clone(),
                status: frame.status.as_str().to_string(),
            });
        }
        record.remaining_uses -= 1;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::frame::FrameStatus;

    fn paused_frame() -> ExecutionFrame {
        let mut frame = ExecutionFrame::new("agent", "@prompt -> x\nhi\n@end\n");
        frame.status = FrameStatus::Paused;
        frame.context_snapshot_id = "snap_1".into();
        frame
    }

    #[test]
    fn issue_then_validate_succeeds_once() {
        let issuer = HandleIssuer::default();
        let frame = paused_frame();
        let handle = issuer.issue(&frame, "owner");
        assert!(issuer.validate(&handle, &frame, "owner").is_ok());
        // Replay is rejected.
        let err = issuer.validate(&handle, &frame, "owner").unwrap_err();
        assert!(err.to_string().contains("replayed"));
    }

    #[test]
    fn stale_version_is_rejected() {
        let issuer = HandleIssuer::default();
        let mut frame = paused_frame();
        let handle = issuer.issue(&frame, "owner");
        frame.version += 1;
        let err = issuer.validate(&handle, &frame, "owner").unwrap_err();
        assert!(err.to_string().contains("stale"));
    }

    #[test]
    fn non_resumable_status_is_rejected() {
        let issuer = HandleIssuer::default();
        let mut frame = paused_frame();
        let handle = issuer.issue(&frame, "owner");
        frame.status = FrameStatus::Completed;
        assert!(matches!(
            issuer.validate(&handle, &frame, "owner"),
            Err(FrameError::NotResumable { .. })
        ));
    }

    #[test]
    fn forged_and_expired_tokens_are_rejected() {
        let issuer = HandleIssuer::new(Duration::seconds(-1));
        let frame = paused_frame();
        let handle = issuer.issue(&frame, "owner");
        let err = issuer.validate(&handle, &frame, "owner").unwrap_err();
        assert!(err.to_string().contains("expired"));

        let forged = ResumeHandle {
            token: "rtk_forged".into(),
            ..handle
        };
        let err = issuer.validate(&forged, &frame, "owner").unwrap_err();
        assert!(err.to_string().contains("unknown token"));
    }

    #[test]
    fn tampered_fields_are_rejected() {
        let issuer = HandleIssuer::default();
        let frame = paused_frame();
        let mut handle = issuer.issue(&frame, "owner");
        handle.frame_version = 99;
        let err = issuer.validate(&handle, &frame, "owner").unwrap_err();
        assert!(err.to_string().contains("does not match"));
    }
}
