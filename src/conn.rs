/*!
 * Connection pool
 *
 * Owns every authenticated session and leases them to the rest of the
 * filesystem. File-io connections are held exclusively for the lifetime of
 * an open file; short-op connections may be shared by any number of
 * stateless callers when reuse is enabled; one-time-use connections are
 * torn down as soon as they are released. The pool never exceeds
 * `max_conn` live sessions: a caller that cannot be served blocks until a
 * lease is returned.
 *
 * A timer tick drives the reaper: idle connections past the timeout are
 * closed, idle-but-warm connections past the keepalive threshold get a
 * lightweight probe so the server keeps them alive.
 */

use std::mem;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use log::{debug, info, warn};
use parking_lot::{Condvar, Mutex, MutexGuard, RwLock};

use crate::client::{Account, Client, Session};
use crate::config::FsConfig;
use crate::error::{FsError, Result};
use crate::rpc::Rpc;

/// What a leased connection is used for.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnKind {
    /// Exclusive lease for the lifetime of an open file
    FileIo,
    /// Short, stateless calls; shareable when reuse is enabled
    ShortOp,
    /// Fresh session destroyed on release
    OneTimeUse,
}

struct ConnState {
    session: Arc<dyn Session>,
    broken: bool,
    in_use: u32,
    last_act: Instant,
    last_use: Instant,
}

/// One pooled connection. RPC traffic on it is serialized by `lock()`.
pub struct Conn {
    id: u64,
    kind: ConnKind,
    op_lock: Mutex<()>,
    state: RwLock<ConnState>,
}

impl Conn {
    fn new(id: u64, kind: ConnKind, session: Arc<dyn Session>, in_use: u32) -> Self {
        let now = Instant::now();
        Self {
            id,
            kind,
            op_lock: Mutex::new(()),
            state: RwLock::new(ConnState {
                session,
                broken: false,
                in_use,
                last_act: now,
                last_use: now,
            }),
        }
    }

    pub fn id(&self) -> u64 {
        self.id
    }

    pub fn kind(&self) -> ConnKind {
        self.kind
    }

    /// Serialize mutating traffic on this connection.
    pub fn lock(&self) -> MutexGuard<'_, ()> {
        self.op_lock.lock()
    }

    pub fn session(&self) -> Arc<dyn Session> {
        self.state.read().session.clone()
    }

    pub fn update_last_act(&self) {
        self.state.write().last_act = Instant::now();
    }

    pub fn mark_broken(&self) {
        self.state.write().broken = true;
    }

    pub fn is_broken(&self) -> bool {
        self.state.read().broken
    }

    pub fn in_use_count(&self) -> u32 {
        self.state.read().in_use
    }
}

/// Snapshot of pool occupancy per connection type.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ConnReport {
    pub inuse_file_io: usize,
    pub inuse_short_op: usize,
    pub inuse_one_time_use: usize,
    pub free_file_io: usize,
    pub free_short_op: usize,
}

struct PoolInner {
    conns: Vec<Arc<Conn>>,
    /// Slots reserved for connects in flight; counted against the cap
    pending: usize,
}

pub struct ConnPool {
    client: Arc<dyn Client>,
    account: Account,
    rpc: Rpc,
    max_conn: usize,
    conn_reuse: bool,
    conn_timeout: Duration,
    keepalive: Duration,
    check_interval: Duration,
    inner: Mutex<PoolInner>,
    freed: Condvar,
    next_id: AtomicU64,
    last_check: Mutex<Instant>,
}

impl ConnPool {
    pub fn new(client: Arc<dyn Client>, account: Account, cfg: &FsConfig) -> Self {
        Self {
            client,
            account,
            rpc: Rpc::new(cfg.rpc_timeout_sec),
            max_conn: cfg.max_conn,
            conn_reuse: cfg.conn_reuse,
            conn_timeout: Duration::from_secs(cfg.conn_timeout_sec),
            keepalive: Duration::from_secs(cfg.conn_keepalive_sec),
            check_interval: Duration::from_secs(cfg.conn_check_interval_sec),
            inner: Mutex::new(PoolInner {
                conns: Vec::new(),
                pending: 0,
            }),
            freed: Condvar::new(),
            next_id: AtomicU64::new(1),
            last_check: Mutex::new(Instant::now()),
        }
    }

    /// One-shot connectivity probe against the configured endpoint.
    pub fn test(&self) -> Result<()> {
        let session = self.connect_session()?;
        self.drop_session(session);
        Ok(())
    }

    /// Lease a connection of the requested kind, blocking at the cap until
    /// another caller releases one.
    pub fn get_and_use(&self, kind: ConnKind) -> Result<Arc<Conn>> {
        match kind {
            ConnKind::ShortOp if self.conn_reuse => self.lease_shared(),
            // without reuse, short ops ride throwaway sessions
            ConnKind::ShortOp | ConnKind::OneTimeUse => self.lease_fresh(ConnKind::OneTimeUse),
            ConnKind::FileIo => self.lease_exclusive(),
        }
    }

    fn lease_exclusive(&self) -> Result<Arc<Conn>> {
        let mut inner = self.inner.lock();
        loop {
            if let Some(conn) = inner
                .conns
                .iter()
                .filter(|c| c.kind == ConnKind::FileIo)
                .filter(|c| {
                    let st = c.state.read();
                    st.in_use == 0 && !st.broken
                })
                .max_by_key(|c| c.state.read().last_act)
                .cloned()
            {
                let mut st = conn.state.write();
                st.in_use = 1;
                st.last_act = Instant::now();
                drop(st);
                return Ok(conn);
            }
            if inner.conns.len() + inner.pending < self.max_conn {
                return self.create_conn(inner, ConnKind::FileIo);
            }
            self.freed.wait(&mut inner);
        }
    }

    fn lease_shared(&self) -> Result<Arc<Conn>> {
        let mut inner = self.inner.lock();
        loop {
            // prefer the warmest short-op connection
            if let Some(conn) = inner
                .conns
                .iter()
                .filter(|c| c.kind == ConnKind::ShortOp && !c.state.read().broken)
                .max_by_key(|c| c.state.read().last_act)
                .cloned()
            {
                let mut st = conn.state.write();
                st.in_use += 1;
                st.last_act = Instant::now();
                drop(st);
                return Ok(conn);
            }
            if inner.conns.len() + inner.pending < self.max_conn {
                return self.create_conn(inner, ConnKind::ShortOp);
            }
            self.freed.wait(&mut inner);
        }
    }

    fn lease_fresh(&self, kind: ConnKind) -> Result<Arc<Conn>> {
        let mut inner = self.inner.lock();
        while inner.conns.len() + inner.pending >= self.max_conn {
            self.freed.wait(&mut inner);
        }
        self.create_conn(inner, kind)
    }

    /// Like `get_and_use`, but fails with resource-exhausted instead of
    /// blocking at the cap. Background workers use this so a foreground
    /// thread joining them can never wait on a lease they will never get.
    pub fn try_get_and_use(&self, kind: ConnKind) -> Result<Arc<Conn>> {
        let inner = self.inner.lock();
        match kind {
            ConnKind::ShortOp if self.conn_reuse => {
                if let Some(conn) = inner
                    .conns
                    .iter()
                    .filter(|c| c.kind == ConnKind::ShortOp && !c.state.read().broken)
                    .max_by_key(|c| c.state.read().last_act)
                    .cloned()
                {
                    let mut st = conn.state.write();
                    st.in_use += 1;
                    st.last_act = Instant::now();
                    drop(st);
                    return Ok(conn);
                }
            }
            ConnKind::FileIo => {
                if let Some(conn) = inner
                    .conns
                    .iter()
                    .filter(|c| c.kind == ConnKind::FileIo)
                    .filter(|c| {
                        let st = c.state.read();
                        st.in_use == 0 && !st.broken
                    })
                    .max_by_key(|c| c.state.read().last_act)
                    .cloned()
                {
                    let mut st = conn.state.write();
                    st.in_use = 1;
                    st.last_act = Instant::now();
                    drop(st);
                    return Ok(conn);
                }
            }
            _ => {}
        }
        if inner.conns.len() + inner.pending >= self.max_conn {
            return Err(FsError::ResourceExhausted(format!(
                "connection cap of {} reached",
                self.max_conn
            )));
        }
        let kind = match kind {
            ConnKind::ShortOp if !self.conn_reuse => ConnKind::OneTimeUse,
            other => other,
        };
        self.create_conn(inner, kind)
    }

    /// Connect outside the pool lock; the reserved slot keeps the cap honest.
    fn create_conn(&self, mut inner: MutexGuard<'_, PoolInner>, kind: ConnKind) -> Result<Arc<Conn>> {
        inner.pending += 1;
        drop(inner);

        let session = match self.connect_session() {
            Ok(session) => session,
            Err(e) => {
                self.inner.lock().pending -= 1;
                self.freed.notify_one();
                return Err(e);
            }
        };

        let id = self.next_id.fetch_add(1, Ordering::SeqCst);
        let conn = Arc::new(Conn::new(id, kind, session, 1));
        debug!("created {:?} connection {}", kind, id);

        let mut inner = self.inner.lock();
        inner.pending -= 1;
        inner.conns.push(conn.clone());
        Ok(conn)
    }

    /// Return a lease. A connection whose count reaches zero becomes
    /// eligible for reuse or reaping; one-time-use and broken connections
    /// are closed right away.
    pub fn unuse(&self, conn: &Arc<Conn>) {
        let destroy = {
            let mut inner = self.inner.lock();
            let mut st = conn.state.write();
            st.in_use = st.in_use.saturating_sub(1);
            let now = Instant::now();
            st.last_use = now;
            st.last_act = now;
            let destroy = st.in_use == 0 && (conn.kind == ConnKind::OneTimeUse || st.broken);
            drop(st);
            if destroy {
                inner.conns.retain(|c| c.id != conn.id);
            }
            destroy
        };
        self.freed.notify_all();
        if destroy {
            debug!("closing {:?} connection {}", conn.kind, conn.id);
            self.drop_session(conn.session());
        }
    }

    /// Tear down and re-establish the session in place, preserving the
    /// connection identifier. Used on transient errors classified as
    /// recoverable.
    pub fn reconnect(&self, conn: &Conn) -> Result<()> {
        let _serialized = conn.lock();
        info!("reconnecting connection {}", conn.id);
        let session = self.connect_session()?;
        let old = {
            let mut st = conn.state.write();
            st.broken = false;
            st.last_act = Instant::now();
            mem::replace(&mut st.session, session)
        };
        self.drop_session(old);
        Ok(())
    }

    /// Reaper; invoked from the timer at the configured cadence.
    pub fn tick(&self) {
        {
            let mut last = self.last_check.lock();
            if last.elapsed() < self.check_interval {
                return;
            }
            *last = Instant::now();
        }

        let mut to_close = Vec::new();
        let mut to_probe = Vec::new();
        {
            let mut inner = self.inner.lock();
            inner.conns.retain(|conn| {
                let st = conn.state.read();
                if st.in_use > 0 {
                    return true;
                }
                if conn.kind == ConnKind::OneTimeUse
                    || st.broken
                    || st.last_use.elapsed() > self.conn_timeout
                {
                    to_close.push(conn.clone());
                    false
                } else {
                    if st.last_act.elapsed() > self.keepalive {
                        to_probe.push(conn.clone());
                    }
                    true
                }
            });
        }

        let closed_any = !to_close.is_empty();
        for conn in to_close {
            debug!("reaping idle connection {}", conn.id);
            self.drop_session(conn.session());
        }
        for conn in to_probe {
            let home = self.account.home_collection();
            match self
                .rpc
                .call(&conn, "keepalive", move |s| s.obj_stat(&home).map(|_| ()))
            {
                Ok(()) => debug!("keepalive ok on connection {}", conn.id),
                Err(e) => {
                    warn!("keepalive failed on connection {}: {}", conn.id, e);
                    conn.mark_broken();
                }
            }
        }
        if closed_any {
            self.freed.notify_all();
        }
    }

    /// Snapshot counts of free and in-use connections per type.
    pub fn report(&self) -> ConnReport {
        let inner = self.inner.lock();
        let mut report = ConnReport::default();
        for conn in &inner.conns {
            let in_use = conn.state.read().in_use > 0;
            match (conn.kind, in_use) {
                (ConnKind::FileIo, true) => report.inuse_file_io += 1,
                (ConnKind::FileIo, false) => report.free_file_io += 1,
                (ConnKind::ShortOp, true) => report.inuse_short_op += 1,
                (ConnKind::ShortOp, false) => report.free_short_op += 1,
                (ConnKind::OneTimeUse, true) => report.inuse_one_time_use += 1,
                // counted as closing
                (ConnKind::OneTimeUse, false) => {}
            }
        }
        report
    }

    /// Number of live connections, in-flight connects included.
    pub fn live_count(&self) -> usize {
        let inner = self.inner.lock();
        inner.conns.len() + inner.pending
    }

    /// Disconnect everything. Callers must have released their leases.
    pub fn close_all(&self) {
        let conns: Vec<Arc<Conn>> = {
            let mut inner = self.inner.lock();
            inner.conns.drain(..).collect()
        };
        for conn in conns {
            self.drop_session(conn.session());
        }
        self.freed.notify_all();
    }

    fn connect_session(&self) -> Result<Arc<dyn Session>> {
        let client = self.client.clone();
        let account = self.account.clone();
        let session = self.rpc.dispatch("connect", move || client.connect(&account))?;
        if let Some(ticket) = &self.account.ticket {
            let s = session.clone();
            let t = ticket.clone();
            self.rpc
                .dispatch("setSessionTicket", move || s.set_session_ticket(&t))?;
        }
        Ok(session)
    }

    /// Best-effort disconnect; a dead peer must not wedge the caller.
    fn drop_session(&self, session: Arc<dyn Session>) {
        let _ = self.rpc.dispatch("disconnect", move || session.disconnect());
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::client::memory::{MemoryClient, MemoryServer};
    use std::thread;

    fn test_pool(cfg: FsConfig) -> (MemoryServer, ConnPool) {
        let server = MemoryServer::new();
        server.mkdir_all("/tempZone/home/rods");
        let client = Arc::new(MemoryClient::new(server.clone()));
        let account = Account::new("memory", "tempZone", "rods");
        let pool = ConnPool::new(client, account, &cfg);
        (server, pool)
    }

    #[test]
    fn test_file_io_lease_is_exclusive() {
        let (_server, pool) = test_pool(FsConfig::default());

        let a = pool.get_and_use(ConnKind::FileIo).unwrap();
        let b = pool.get_and_use(ConnKind::FileIo).unwrap();
        assert_ne!(a.id(), b.id());
        assert_eq!(a.in_use_count(), 1);

        pool.unuse(&a);
        let c = pool.get_and_use(ConnKind::FileIo).unwrap();
        // the released connection is reused, not a new one
        assert_eq!(c.id(), a.id());

        pool.unuse(&b);
        pool.unuse(&c);
        pool.close_all();
    }

    #[test]
    fn test_short_op_shared_when_reuse_enabled() {
        let cfg = FsConfig {
            conn_reuse: true,
            ..Default::default()
        };
        let (_server, pool) = test_pool(cfg);

        let a = pool.get_and_use(ConnKind::ShortOp).unwrap();
        let b = pool.get_and_use(ConnKind::ShortOp).unwrap();
        assert_eq!(a.id(), b.id());
        assert_eq!(a.in_use_count(), 2);

        pool.unuse(&a);
        pool.unuse(&b);
        assert_eq!(pool.report().free_short_op, 1);
        pool.close_all();
    }

    #[test]
    fn test_short_op_without_reuse_is_one_time_use() {
        let (server, pool) = test_pool(FsConfig::default());

        let a = pool.get_and_use(ConnKind::ShortOp).unwrap();
        assert_eq!(a.kind(), ConnKind::OneTimeUse);
        let connects = server.counts().connects;

        pool.unuse(&a);
        assert_eq!(pool.live_count(), 0);

        let b = pool.get_and_use(ConnKind::ShortOp).unwrap();
        assert_eq!(server.counts().connects, connects + 1);
        pool.unuse(&b);
        pool.close_all();
    }

    #[test]
    fn test_cap_blocks_until_release() {
        let cfg = FsConfig {
            max_conn: 1,
            ..Default::default()
        };
        let (_server, pool) = test_pool(cfg);
        let pool = Arc::new(pool);

        let first = pool.get_and_use(ConnKind::FileIo).unwrap();
        assert_eq!(pool.live_count(), 1);

        let waiter = {
            let pool = pool.clone();
            thread::spawn(move || {
                let conn = pool.get_and_use(ConnKind::FileIo).unwrap();
                pool.unuse(&conn);
            })
        };

        // the waiter cannot make progress while the lease is held
        thread::sleep(Duration::from_millis(150));
        assert!(!waiter.is_finished());
        assert_eq!(pool.live_count(), 1);

        pool.unuse(&first);
        waiter.join().unwrap();
        assert!(pool.live_count() <= 1);
        pool.close_all();
    }

    #[test]
    fn test_reconnect_preserves_identifier() {
        let (server, pool) = test_pool(FsConfig::default());

        let conn = pool.get_and_use(ConnKind::FileIo).unwrap();
        let id = conn.id();
        server.kill_sessions();
        assert!(conn.session().obj_stat("/tempZone/home/rods").is_err());

        pool.reconnect(&conn).unwrap();
        assert_eq!(conn.id(), id);
        assert!(conn.session().obj_stat("/tempZone/home/rods").is_ok());

        pool.unuse(&conn);
        pool.close_all();
    }

    #[test]
    fn test_reaper_closes_idle_connections() {
        let cfg = FsConfig {
            conn_reuse: true,
            conn_timeout_sec: 0,
            conn_check_interval_sec: 0,
            ..Default::default()
        };
        let (_server, pool) = test_pool(cfg);

        let conn = pool.get_and_use(ConnKind::ShortOp).unwrap();
        pool.unuse(&conn);
        assert_eq!(pool.live_count(), 1);

        thread::sleep(Duration::from_millis(20));
        pool.tick();
        assert_eq!(pool.live_count(), 0);
    }

    #[test]
    fn test_keepalive_probe_refreshes_idle_connection() {
        let cfg = FsConfig {
            conn_reuse: true,
            conn_keepalive_sec: 0,
            conn_check_interval_sec: 0,
            ..Default::default()
        };
        let (server, pool) = test_pool(cfg);

        let conn = pool.get_and_use(ConnKind::ShortOp).unwrap();
        pool.unuse(&conn);
        let stats_before = server.counts().stats;

        thread::sleep(Duration::from_millis(20));
        pool.tick();
        assert!(server.counts().stats > stats_before);
        assert_eq!(pool.live_count(), 1);
        pool.close_all();
    }

    #[test]
    fn test_probe_endpoint() {
        let (_server, pool) = test_pool(FsConfig::default());
        assert!(pool.test().is_ok());
    }
}
