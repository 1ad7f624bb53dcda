//! Shared key-value connection plumbing.
//!
//! One multiplexed connection, opened lazily and guarded by a mutex. Every
//! command tries once on the current socket, then reconnects and retries
//! once; a second failure surfaces as `infrastructure-unavailable`.

use redis::FromRedisValue;
use tokio::sync::Mutex;

use crate::error::{Error, Result};
use crate::observability::LogEvent;

/// Lazily-connected handle to the key-value service.
pub struct RedisHandle {
    client: redis::Client,
    url: String,
    connection: Mutex<Option<redis::aio::MultiplexedConnection>>,
}

impl RedisHandle {
    /// Validate the URL and build an unconnected handle.
    pub fn open(url: &str) -> Result<Self> {
        let client = redis::Client::open(url).map_err(|err| {
            Error::InfrastructureUnavailable(format!("invalid redis url {url}: {err}"))
        })?;
        Ok(Self {
            client,
            url: url.to_string(),
            connection: Mutex::new(None),
        })
    }

    /// The configured endpoint URL.
    pub fn url(&self) -> &str {
        &self.url
    }

    async fn ensure_connection(
        &self,
        connection: &mut Option<redis::aio::MultiplexedConnection>,
    ) -> Result<()> {
        if connection.is_some() {
            return Ok(());
        }
        let opened = self
            .client
            .get_multiplexed_async_connection()
            .await
            .map_err(|err| {
                Error::InfrastructureUnavailable(format!(
                    "failed to open redis connection: {err}"
                ))
            })?;
        *connection = Some(opened);
        tracing::debug!(
            event = LogEvent::StoreConnected.as_str(),
            url = %self.url,
            "key-value store connected"
        );
        Ok(())
    }

    /// Run one command; reconnect-and-retry once on failure.
    pub async fn run_command<T, F>(&self, operation: &'static str, build: F) -> Result<T>
    where
        T: FromRedisValue + Send,
        F: Fn() -> redis::Cmd,
    {
        let mut last_err: Option<Error> = None;
        for attempt in 0..2 {
            let mut conn_guard = self.connection.lock().await;
            self.ensure_connection(&mut conn_guard).await?;
            let conn = conn_guard.as_mut().ok_or_else(|| {
                Error::InfrastructureUnavailable("redis connection unavailable".to_string())
            })?;
            let cmd = build();
            let result: redis::RedisResult<T> = cmd.query_async(conn).await;
            match result {
                Ok(value) => {
                    if attempt > 0 {
                        tracing::debug!(
                            event = LogEvent::StoreCommandRetrySucceeded.as_str(),
                            operation,
                            attempt = attempt + 1,
                            "redis command succeeded after retry"
                        );
                    }
                    return Ok(value);
                }
                Err(err) => {
                    tracing::warn!(
                        event = LogEvent::StoreCommandRetryFailed.as_str(),
                        operation,
                        attempt = attempt + 1,
                        error = %err,
                        "redis command attempt failed; reconnecting"
                    );
                    // Drop the stale socket so the next attempt reopens.
                    *conn_guard = None;
                    last_err = Some(Error::InfrastructureUnavailable(format!(
                        "redis command '{operation}' failed: {err}"
                    )));
                    if attempt == 0 {
                        continue;
                    }
                }
            }
        }
        Err(last_err.unwrap_or_else(|| {
            Error::InfrastructureUnavailable(format!(
                "redis command '{operation}' failed for unknown reason"
            ))
        }))
    }

    /// Run one atomic pipeline; reconnect-and-retry once on failure.
    pub async fn run_pipeline<T, F>(&self, operation: &'static str, build: F) -> Result<T>
    where
        T: FromRedisValue + Send,
        F: Fn() -> redis::Pipeline,
    {
        let mut last_err: Option<Error> = None;
        for attempt in 0..2 {
            let mut conn_guard = self.connection.lock().await;
            self.ensure_connection(&mut conn_guard).await?;
            let conn = conn_guard.as_mut().ok_or_else(|| {
                Error::InfrastructureUnavailable("redis connection unavailable".to_string())
            })?;
            let pipe = build();
            let result: redis::RedisResult<T> = pipe.query_async(conn).await;
            match result {
                Ok(value) => {
                    if attempt > 0 {
                        tracing::debug!(
                            event = LogEvent::StoreCommandRetrySucceeded.as_str(),
                            operation,
                            attempt = attempt + 1,
                            "redis pipeline succeeded after retry"
                        );
                    }
                    return Ok(value);
                }
                Err(err) => {
                    tracing::warn!(
                        event = LogEvent::StoreCommandRetryFailed.as_str(),
                        operation,
                        attempt = attempt + 1,
                        error = %err,
                        "redis pipeline attempt failed; reconnecting"
                    );
                    *conn_guard = None;
                    last_err = Some(Error::InfrastructureUnavailable(format!(
                        "redis pipeline '{operation}' failed: {err}"
                    )));
                    if attempt == 0 {
                        continue;
                    }
                }
            }
        }
        Err(last_err.unwrap_or_else(|| {
            Error::InfrastructureUnavailable(format!(
                "redis pipeline '{operation}' failed for unknown reason"
            ))
        }))
    }

    /// Round-trip probe.
    pub async fn ping(&self) -> Result<()> {
        let _: String = self
            .run_command("ping", || redis::cmd("PING"))
            .await?;
        Ok(())
    }
}
