/*!
 * RPC facade
 *
 * Every remote call runs under a deadline. The call itself executes on a
 * short-lived worker thread; the facade waits on a channel with a timeout.
 * A call that misses the deadline marks the connection broken and is
 * abandoned; the worker keeps its own reference to the session and exits
 * quietly whenever the server finally answers.
 *
 * Recoverable failures (network disconnect, expired session) get exactly
 * one reconnect-and-retry; everything else propagates.
 */

use std::thread;
use std::time::Duration;

use crossbeam_channel::bounded;
use log::warn;

use crate::client::{ClientResult, Session};
use crate::conn::{Conn, ConnPool};
use crate::error::{FsError, Result};

#[derive(Debug, Clone)]
pub struct Rpc {
    timeout: Duration,
}

impl Rpc {
    pub fn new(timeout_sec: u64) -> Self {
        Self::with_timeout(Duration::from_secs(timeout_sec.max(1)))
    }

    pub fn with_timeout(timeout: Duration) -> Self {
        Self { timeout }
    }

    pub fn timeout(&self) -> Duration {
        self.timeout
    }

    /// Run a bare remote call (connect, disconnect, probes) under the
    /// deadline.
    pub fn dispatch<T, F>(&self, op: &'static str, f: F) -> Result<T>
    where
        T: Send + 'static,
        F: FnOnce() -> ClientResult<T> + Send + 'static,
    {
        let (tx, rx) = bounded(1);
        thread::Builder::new()
            .name("irodsfs-rpc".into())
            .spawn(move || {
                let _ = tx.send(f());
            })
            .map_err(|e| FsError::ResourceExhausted(format!("rpc worker: {}", e)))?;

        match rx.recv_timeout(self.timeout) {
            Ok(Ok(value)) => Ok(value),
            Ok(Err(e)) => Err(e.into()),
            Err(_) => Err(FsError::RpcTimeout {
                op,
                timeout: self.timeout,
            }),
        }
    }

    /// One remote call on a pooled connection, serialized by the
    /// connection lock. A timeout marks the session broken.
    pub fn call<T, F>(&self, conn: &Conn, op: &'static str, f: F) -> Result<T>
    where
        T: Send + 'static,
        F: FnOnce(&dyn Session) -> ClientResult<T> + Send + 'static,
    {
        let _serialized = conn.lock();
        let session = conn.session();
        let result = self.dispatch(op, move || f(session.as_ref()));
        match &result {
            Ok(_) => conn.update_last_act(),
            Err(FsError::RpcTimeout { .. }) => {
                warn!("{} timed out on connection {}", op, conn.id());
                conn.mark_broken();
            }
            Err(_) => {}
        }
        result
    }

    /// Like `call`, but reconnects the underlying session and retries
    /// exactly once when the failure is recoverable.
    pub fn call_with_reconnect<T, F>(
        &self,
        pool: &ConnPool,
        conn: &Conn,
        op: &'static str,
        f: F,
    ) -> Result<T>
    where
        T: Send + 'static,
        F: Fn(&dyn Session) -> ClientResult<T> + Send + Sync + Clone + 'static,
    {
        match self.call(conn, op, f.clone()) {
            Err(e) if e.is_recoverable() => {
                warn!(
                    "{} failed on connection {} ({}); reconnecting and retrying",
                    op,
                    conn.id(),
                    e
                );
                pool.reconnect(conn)?;
                self.call(conn, op, f)
            }
            result => result,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::client::ClientError;

    #[test]
    fn test_dispatch_returns_value() {
        let rpc = Rpc::with_timeout(Duration::from_secs(1));
        let out = rpc.dispatch("probe", || Ok::<_, ClientError>(7)).unwrap();
        assert_eq!(out, 7);
    }

    #[test]
    fn test_dispatch_propagates_error() {
        let rpc = Rpc::with_timeout(Duration::from_secs(1));
        let err = rpc
            .dispatch("probe", || Err::<(), _>(ClientError::NotFound("/x".into())))
            .unwrap_err();
        assert!(matches!(err, FsError::NotFound(_)));
    }

    #[test]
    fn test_dispatch_times_out() {
        let rpc = Rpc::with_timeout(Duration::from_millis(50));
        let err = rpc
            .dispatch("probe", || {
                thread::sleep(Duration::from_millis(500));
                Ok::<_, ClientError>(())
            })
            .unwrap_err();
        assert!(matches!(err, FsError::RpcTimeout { op: "probe", .. }));
    }
}
