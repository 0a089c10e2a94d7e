//! Single-flight upload session
//!
//! A receiver process serves exactly one upload. The session moves
//! `Idle -> Uploading -> Done`, or back from `Uploading` to `Idle` when a
//! transfer fails, and every move goes through [`Session::apply`] under one
//! lock. Reaching `Done` fires the completion signal the server waits on.

use std::sync::Arc;

use parking_lot::Mutex;
use tokio_util::sync::CancellationToken;
use tracing::debug;

/// Where the receiver is in its one-upload lifetime
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum SessionState {
    /// Waiting for an upload
    Idle,
    /// A transfer is in progress
    Uploading,
    /// An upload completed; nothing else will be accepted
    Done,
}

/// Requested state change
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Transition {
    /// Claim the session for a new transfer
    Begin,
    /// The transfer completed
    Finish,
    /// The transfer failed; allow another attempt
    Abort,
}

impl SessionState {
    /// State after `transition`, or `None` when the move is not allowed
    pub fn next(self, transition: Transition) -> Option<SessionState> {
        match (self, transition) {
            (SessionState::Idle, Transition::Begin) => Some(SessionState::Uploading),
            (SessionState::Uploading, Transition::Finish) => Some(SessionState::Done),
            (SessionState::Uploading, Transition::Abort) => Some(SessionState::Idle),
            _ => None,
        }
    }
}

/// Upload session shared by all request handlers of one receiver
#[derive(Debug)]
pub struct Session {
    state: Mutex<SessionState>,
    completed: CancellationToken,
}

impl Default for Session {
    fn default() -> Self {
        Self::new()
    }
}

impl Session {
    /// A fresh, idle session
    pub fn new() -> Self {
        Self {
            state: Mutex::new(SessionState::Idle),
            completed: CancellationToken::new(),
        }
    }

    /// Current state
    pub fn state(&self) -> SessionState {
        *self.state.lock()
    }

    /// Apply a transition atomically
    ///
    /// Returns the new state, or the unchanged current state when the
    /// transition is not allowed from it.
    pub fn apply(&self, transition: Transition) -> Result<SessionState, SessionState> {
        let mut state = self.state.lock();
        let current = *state;
        let next = current.next(transition).ok_or(current)?;
        *state = next;
        if next == SessionState::Done {
            self.completed.cancel();
        }
        debug!(from = ?current, to = ?next, "upload session transition");
        Ok(next)
    }

    /// Claim the session for a transfer
    ///
    /// The returned permit reverts the session to `Idle` when dropped without
    /// [`UploadPermit::finish`], so an early return or a panic in the handler
    /// never leaves the session stuck in `Uploading`.
    pub fn begin(self: &Arc<Self>) -> Result<UploadPermit, SessionState> {
        self.apply(Transition::Begin)?;
        Ok(UploadPermit {
            session: self.clone(),
            finished: false,
        })
    }

    /// Resolves once an upload has completed
    pub async fn completed(&self) {
        self.completed.cancelled().await
    }

    /// Whether an upload has completed
    pub fn is_completed(&self) -> bool {
        self.completed.is_cancelled()
    }
}

/// Exclusive right to perform the transfer
#[derive(Debug)]
pub struct UploadPermit {
    session: Arc<Session>,
    finished: bool,
}

impl UploadPermit {
    /// Mark the transfer complete, moving the session to `Done`
    pub fn finish(mut self) {
        self.finished = true;
        // Only the permit holder can be in Uploading, so Finish always applies
        let _ = self.session.apply(Transition::Finish);
    }
}

impl Drop for UploadPermit {
    fn drop(&mut self) {
        if !self.finished {
            let _ = self.session.apply(Transition::Abort);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn only_lifecycle_transitions_are_allowed() {
        use SessionState::*;
        use Transition::*;

        assert_eq!(Idle.next(Begin), Some(Uploading));
        assert_eq!(Uploading.next(Finish), Some(Done));
        assert_eq!(Uploading.next(Abort), Some(Idle));

        assert_eq!(Idle.next(Finish), None);
        assert_eq!(Idle.next(Abort), None);
        assert_eq!(Uploading.next(Begin), None);
        for t in [Begin, Finish, Abort] {
            assert_eq!(Done.next(t), None, "Done is terminal");
        }
    }

    #[test]
    fn rejected_transition_reports_current_state() {
        let session = Session::new();
        assert_eq!(session.apply(Transition::Finish), Err(SessionState::Idle));
        assert_eq!(session.state(), SessionState::Idle);
    }

    /// Story: while one upload runs, others are turned away; once it
    /// finishes, the session is closed for good
    #[test]
    fn story_single_flight() {
        let session = Arc::new(Session::new());
        let permit = session.begin().unwrap();
        assert_eq!(session.begin().unwrap_err(), SessionState::Uploading);

        permit.finish();
        assert_eq!(session.state(), SessionState::Done);
        assert!(session.is_completed());
        assert_eq!(session.begin().unwrap_err(), SessionState::Done);
    }

    /// Story: a failed transfer releases the session for a retry
    #[test]
    fn story_dropped_permit_reverts_to_idle() {
        let session = Arc::new(Session::new());
        {
            let _permit = session.begin().unwrap();
            assert_eq!(session.state(), SessionState::Uploading);
        }
        assert_eq!(session.state(), SessionState::Idle);
        assert!(!session.is_completed());
        assert!(session.begin().is_ok());
    }

    #[test]
    fn concurrent_begins_admit_exactly_one() {
        let session = Arc::new(Session::new());
        let handles: Vec<_> = (0..16)
            .map(|_| {
                let session = session.clone();
                std::thread::spawn(move || session.begin().map(std::mem::forget).is_ok())
            })
            .collect();
        let admitted = handles
            .into_iter()
            .map(|h| h.join().unwrap())
            .filter(|ok| *ok)
            .count();
        assert_eq!(admitted, 1);
    }

    #[tokio::test]
    async fn completion_signal_fires_on_finish() {
        let session = Arc::new(Session::new());
        let waiter = {
            let session = session.clone();
            tokio::spawn(async move { session.completed().await })
        };
        session.begin().unwrap().finish();
        tokio::time::timeout(std::time::Duration::from_secs(1), waiter)
            .await
            .unwrap()
            .unwrap();
    }
}
