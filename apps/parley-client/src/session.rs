use std::sync::{Mutex, MutexGuard, PoisonError};

use reqwest::StatusCode;
use thiserror::Error;
use tokio::sync::{oneshot, watch};

use crate::transport::{ApiRequest, ApiResponse, SessionTransport, TransportError};

#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum SessionError {
    /// Renewal failed; the caller has to authenticate again.
    #[error("session ended")]
    SessionEnded,
    #[error(transparent)]
    Transport(#[from] TransportError),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionStatus {
    Anonymous,
    Active,
    Ended,
}

type Waiter = oneshot::Sender<Result<String, SessionError>>;

enum RefreshState {
    Idle,
    Refreshing { waiters: Vec<Waiter> },
}

struct SessionInner {
    token: Option<String>,
    /// Bumped whenever the token is replaced or cleared.
    generation: u64,
    /// Generation left behind by the last failed renewal.
    ended_generation: Option<u64>,
    refresh: RefreshState,
}

/// Holds the access token and recovers from expiry with at most one renewal
/// call per expiry episode.
pub struct SessionController<T> {
    transport: T,
    inner: Mutex<SessionInner>,
    status: watch::Sender<SessionStatus>,
}

enum Recovery {
    Ready(String),
    Ended,
    Wait(oneshot::Receiver<Result<String, SessionError>>),
    Lead,
}

impl<T: SessionTransport> SessionController<T> {
    pub fn new(transport: T) -> Self {
        let (status, _) = watch::channel(SessionStatus::Anonymous);
        Self {
            transport,
            inner: Mutex::new(SessionInner {
                token: None,
                generation: 0,
                ended_generation: None,
                refresh: RefreshState::Idle,
            }),
            status,
        }
    }

    pub fn transport(&self) -> &T {
        &self.transport
    }

    fn lock(&self) -> MutexGuard<'_, SessionInner> {
        self.inner.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Installs a token obtained from login or registration.
    pub fn install_token(&self, token: String) {
        let mut inner = self.lock();
        inner.token = Some(token);
        inner.generation += 1;
        drop(inner);
        self.status.send_replace(SessionStatus::Active);
    }

    /// Drops the held token, e.g. after logout.
    pub fn clear(&self) {
        let mut inner = self.lock();
        inner.token = None;
        inner.generation += 1;
        drop(inner);
        self.status.send_replace(SessionStatus::Anonymous);
    }

    #[must_use]
    pub fn token(&self) -> Option<String> {
        self.lock().token.clone()
    }

    #[must_use]
    pub fn status(&self) -> watch::Receiver<SessionStatus> {
        self.status.subscribe()
    }

    /// Sends `request` with the current token. A 401 triggers one recovery
    /// and one replay; a second 401 is returned to the caller as is.
    ///
    /// # Errors
    /// Returns [`SessionError::SessionEnded`] when renewal fails, or the
    /// transport error of either attempt.
    pub async fn execute(&self, request: ApiRequest) -> Result<ApiResponse, SessionError> {
        let (token, generation) = {
            let inner = self.lock();
            (inner.token.clone(), inner.generation)
        };
        let response = self.transport.send(&request, token.as_deref()).await?;
        if response.status != StatusCode::UNAUTHORIZED {
            return Ok(response);
        }

        let fresh = self.recover(generation).await?;
        Ok(self.transport.send(&request, Some(&fresh)).await?)
    }

    /// Returns a token newer than `seen_generation`, renewing only if no
    /// other caller already did or is doing so.
    async fn recover(&self, seen_generation: u64) -> Result<String, SessionError> {
        let step = {
            let mut guard = self.lock();
            let inner = &mut *guard;
            match inner.refresh {
                RefreshState::Refreshing { ref mut waiters } => {
                    let (sender, receiver) = oneshot::channel();
                    waiters.push(sender);
                    Recovery::Wait(receiver)
                }
                RefreshState::Idle => match inner.token.clone() {
                    Some(token) if inner.generation != seen_generation => Recovery::Ready(token),
                    // a late 401 from an episode whose renewal already failed
                    None if inner.generation != seen_generation
                        && inner.ended_generation == Some(inner.generation) =>
                    {
                        Recovery::Ended
                    }
                    _ => {
                        inner.refresh = RefreshState::Refreshing {
                            waiters: Vec::new(),
                        };
                        Recovery::Lead
                    }
                },
            }
        };

        match step {
            Recovery::Ready(token) => Ok(token),
            Recovery::Ended => Err(SessionError::SessionEnded),
            Recovery::Wait(receiver) => receiver.await.unwrap_or(Err(SessionError::SessionEnded)),
            Recovery::Lead => {
                let guard = RefreshGuard {
                    controller: self,
                    armed: true,
                };
                let outcome = self.transport.renew().await;
                guard.complete(outcome)
            }
        }
    }

    fn settle(&self, outcome: Result<String, SessionError>) -> Result<String, SessionError> {
        let mut inner = self.lock();
        let waiters = match std::mem::replace(&mut inner.refresh, RefreshState::Idle) {
            RefreshState::Refreshing { waiters } => waiters,
            RefreshState::Idle => Vec::new(),
        };
        inner.generation += 1;
        inner.token = outcome.as_ref().ok().cloned();
        inner.ended_generation = outcome.is_err().then_some(inner.generation);
        drop(inner);

        let status = if outcome.is_ok() {
            SessionStatus::Active
        } else {
            SessionStatus::Ended
        };
        self.status.send_replace(status);
        tracing::debug!(
            event = "client.session.renew",
            outcome = if outcome.is_ok() { "renewed" } else { "ended" },
            waiters = waiters.len()
        );
        for waiter in waiters {
            let _ = waiter.send(outcome.clone());
        }
        outcome
    }
}

/// Fails parked waiters if the renewing future is dropped mid-flight.
struct RefreshGuard<'a, T: SessionTransport> {
    controller: &'a SessionController<T>,
    armed: bool,
}

impl<T: SessionTransport> RefreshGuard<'_, T> {
    fn complete(
        mut self,
        outcome: Result<String, TransportError>,
    ) -> Result<String, SessionError> {
        self.armed = false;
        let outcome = outcome.map_err(|error| {
            tracing::warn!(event = "client.session.renew", outcome = "failed", error = %error);
            SessionError::SessionEnded
        });
        self.controller.settle(outcome)
    }
}

impl<T: SessionTransport> Drop for RefreshGuard<'_, T> {
    fn drop(&mut self) {
        if self.armed {
            let _ = self.controller.settle(Err(SessionError::SessionEnded));
        }
    }
}
