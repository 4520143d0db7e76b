//! The connection pool: gate-based reader/writer traffic control.

use crate::connection::{AccessMode, ConnectionFactory, PooledConnection};
use crate::error::{PoolError, PoolResult};
use parking_lot::{Condvar, Mutex, RwLock};
use std::collections::HashMap;
use std::marker::PhantomData;
use std::sync::Arc;
use std::thread::{self, ThreadId};

#[derive(Debug)]
struct ReaderSlot<H> {
    conn: PooledConnection<H>,
    depth: usize,
}

#[derive(Debug)]
struct SourceState<H> {
    /// Open: readers are admitted. Closed while a writer owns the source
    /// or maintenance is draining it.
    gate_open: bool,
    /// Exclusive maintenance in progress or pending.
    maintenance: bool,
    /// Live readers keyed by owning thread, with re-entrancy depth.
    readers: HashMap<ThreadId, ReaderSlot<H>>,
    /// Idle read handles kept to amortize open cost.
    idle: Vec<PooledConnection<H>>,
    /// The single cached writer handle, created lazily.
    writer: Option<PooledConnection<H>>,
    /// The thread that owns the writer, set before it is entered so a
    /// waiting writer already excludes competing writers and maintenance.
    writer_owner: Option<ThreadId>,
    /// Re-entrancy depth of the writer owner.
    writer_depth: usize,
}

impl<H> Default for SourceState<H> {
    fn default() -> Self {
        Self {
            gate_open: true,
            maintenance: false,
            readers: HashMap::new(),
            idle: Vec::new(),
            writer: None,
            writer_owner: None,
            writer_depth: 0,
        }
    }
}

struct Source<H> {
    name: String,
    state: Mutex<SourceState<H>>,
    /// Readers wait here for the gate to open.
    gate_cv: Condvar,
    /// Writers and maintenance wait here for readers (and each other) to
    /// drain.
    drain_cv: Condvar,
}

impl<H> Source<H> {
    fn new(name: &str) -> Self {
        Self {
            name: name.to_string(),
            state: Mutex::new(SourceState::default()),
            gate_cv: Condvar::new(),
            drain_cv: Condvar::new(),
        }
    }
}

/// Which hold a guard releases on drop.
#[derive(Debug, Clone, Copy)]
enum Role {
    Reader,
    Writer,
}

/// Manages read-only and read-write handles per data-source name.
///
/// See the crate docs for the admission-control semantics. The pool is
/// generic over a [`ConnectionFactory`] so tests and callers inject their
/// own handle type; handles are created lazily and cached per source.
pub struct ConnectionPool<F: ConnectionFactory> {
    factory: F,
    sources: RwLock<HashMap<String, Arc<Source<F::Handle>>>>,
}

impl<F: ConnectionFactory> ConnectionPool<F> {
    /// Creates a pool over the given factory.
    pub fn new(factory: F) -> Self {
        Self {
            factory,
            sources: RwLock::new(HashMap::new()),
        }
    }

    fn source(&self, name: &str) -> Arc<Source<F::Handle>> {
        if let Some(source) = self.sources.read().get(name) {
            return Arc::clone(source);
        }
        let mut map = self.sources.write();
        Arc::clone(
            map.entry(name.to_string())
                .or_insert_with(|| Arc::new(Source::new(name))),
        )
    }

    /// Acquires a read-only connection, blocking while the gate is closed.
    ///
    /// Re-entrant: a thread already holding any connection for this
    /// source (read or write) reuses it rather than deadlocking itself.
    pub fn read(&self, name: &str) -> PoolResult<ReadGuard<'_, F::Handle>> {
        let source = self.source(name);
        let tid = thread::current().id();
        let mut state = source.state.lock();

        // Re-entrant on the writer: a nested read inside a write hold.
        if state.writer_owner == Some(tid) {
            let conn = state
                .writer
                .clone()
                .expect("writer handle present while owned");
            state.writer_depth += 1;
            drop(state);
            return Ok(ReadGuard::new(source, conn, Role::Writer));
        }

        // Re-entrant on an existing read hold.
        if let Some(slot) = state.readers.get_mut(&tid) {
            slot.depth += 1;
            let conn = slot.conn.clone();
            drop(state);
            return Ok(ReadGuard::new(source, conn, Role::Reader));
        }

        while !state.gate_open || state.maintenance {
            source.gate_cv.wait(&mut state);
        }

        let conn = match state.idle.pop() {
            Some(conn) => conn,
            None => {
                let handle = self.factory.connect(name, AccessMode::ReadOnly)?;
                PooledConnection::new(
                    handle,
                    AccessMode::ReadOnly,
                    self.factory.is_persistent(name),
                )
            }
        };
        state.readers.insert(
            tid,
            ReaderSlot {
                conn: conn.clone(),
                depth: 1,
            },
        );
        drop(state);
        Ok(ReadGuard::new(source, conn, Role::Reader))
    }

    /// Acquires the single read-write connection.
    ///
    /// Closes the gate so new readers queue, then waits for live readers
    /// to drain to zero before the writer is entered. Re-entrant for the
    /// owning thread.
    ///
    /// # Errors
    ///
    /// Returns [`PoolError::UpgradeDeadlock`] if the calling thread holds
    /// a read connection for this source: waiting for readers to drain
    /// would block on the caller's own hold.
    pub fn write(&self, name: &str) -> PoolResult<WriteGuard<'_, F::Handle>> {
        let source = self.source(name);
        let tid = thread::current().id();
        let mut state = source.state.lock();

        if state.writer_owner == Some(tid) {
            let conn = state
                .writer
                .clone()
                .expect("writer handle present while owned");
            state.writer_depth += 1;
            drop(state);
            return Ok(WriteGuard::new(source, conn));
        }

        if state.readers.contains_key(&tid) {
            return Err(PoolError::UpgradeDeadlock {
                name: source.name.clone(),
            });
        }

        while state.maintenance || state.writer_owner.is_some() {
            source.drain_cv.wait(&mut state);
        }

        // Claim the writer role and close the gate, then wait out the
        // readers that are already inside.
        state.writer_owner = Some(tid);
        state.gate_open = false;
        while !state.readers.is_empty() {
            source.drain_cv.wait(&mut state);
        }

        if state.writer.is_none() {
            match self.factory.connect(name, AccessMode::ReadWrite) {
                Ok(handle) => {
                    state.writer = Some(PooledConnection::new(
                        handle,
                        AccessMode::ReadWrite,
                        self.factory.is_persistent(name),
                    ));
                }
                Err(e) => {
                    state.writer_owner = None;
                    if !state.maintenance {
                        state.gate_open = true;
                    }
                    source.gate_cv.notify_all();
                    source.drain_cv.notify_all();
                    return Err(e);
                }
            }
        }
        state.writer_depth = 1;
        let conn = state
            .writer
            .clone()
            .expect("writer handle just ensured");
        drop(state);
        Ok(WriteGuard::new(source, conn))
    }

    /// Non-blocking write acquisition.
    ///
    /// Returns `Ok(None)` if the source is busy (live readers, another
    /// writer, or maintenance) instead of waiting.
    pub fn try_write(&self, name: &str) -> PoolResult<Option<WriteGuard<'_, F::Handle>>> {
        let source = self.source(name);
        let tid = thread::current().id();
        let mut state = source.state.lock();

        if state.writer_owner == Some(tid) {
            let conn = state
                .writer
                .clone()
                .expect("writer handle present while owned");
            state.writer_depth += 1;
            drop(state);
            return Ok(Some(WriteGuard::new(source, conn)));
        }

        if state.readers.contains_key(&tid)
            || state.maintenance
            || state.writer_owner.is_some()
            || !state.readers.is_empty()
        {
            return Ok(None);
        }

        state.writer_owner = Some(tid);
        state.gate_open = false;
        if state.writer.is_none() {
            match self.factory.connect(name, AccessMode::ReadWrite) {
                Ok(handle) => {
                    state.writer = Some(PooledConnection::new(
                        handle,
                        AccessMode::ReadWrite,
                        self.factory.is_persistent(name),
                    ));
                }
                Err(e) => {
                    state.writer_owner = None;
                    state.gate_open = true;
                    source.gate_cv.notify_all();
                    source.drain_cv.notify_all();
                    return Err(e);
                }
            }
        }
        state.writer_depth = 1;
        let conn = state
            .writer
            .clone()
            .expect("writer handle just ensured");
        drop(state);
        Ok(Some(WriteGuard::new(source, conn)))
    }

    /// Runs a maintenance operation against a quiescent source.
    ///
    /// Closes the gate, waits for every in-flight reader and the writer
    /// to finish (never preempting them), drops all cached handles so the
    /// datastore is fully closed, runs `f`, then reopens the source.
    /// All new acquisitions block until `f` returns.
    ///
    /// # Errors
    ///
    /// Returns [`PoolError::MaintenanceReentry`] if the calling thread
    /// still holds a connection for this source.
    pub fn with_exclusive<R>(&self, name: &str, f: impl FnOnce() -> R) -> PoolResult<R> {
        let source = self.source(name);
        let tid = thread::current().id();
        let mut state = source.state.lock();

        if state.readers.contains_key(&tid) || state.writer_owner == Some(tid) {
            return Err(PoolError::MaintenanceReentry {
                name: source.name.clone(),
            });
        }

        while state.maintenance || state.writer_owner.is_some() {
            source.drain_cv.wait(&mut state);
        }
        state.maintenance = true;
        state.gate_open = false;
        while !state.readers.is_empty() {
            source.drain_cv.wait(&mut state);
        }

        // Quiescent: close every cached handle before handing over.
        state.idle.clear();
        state.writer = None;
        drop(state);

        tracing::debug!(source = %source.name, "pool quiescent, running maintenance");
        let out = f();

        let mut state = source.state.lock();
        state.maintenance = false;
        state.gate_open = true;
        source.gate_cv.notify_all();
        source.drain_cv.notify_all();
        Ok(out)
    }

    /// Drains a source and removes it from the pool.
    pub fn shutdown(&self, name: &str) -> PoolResult<()> {
        self.with_exclusive(name, || ())?;
        self.sources.write().remove(name);
        Ok(())
    }

    /// Drains and removes every source.
    pub fn shutdown_all(&self) -> PoolResult<()> {
        let names: Vec<String> = self.sources.read().keys().cloned().collect();
        for name in names {
            self.shutdown(&name)?;
        }
        Ok(())
    }

    /// The number of live readers for a source.
    pub fn reader_count(&self, name: &str) -> usize {
        self.source(name).state.lock().readers.len()
    }

    /// The number of idle cached read handles for a source.
    pub fn idle_count(&self, name: &str) -> usize {
        self.source(name).state.lock().idle.len()
    }

    /// Whether the writer is currently owned for a source.
    pub fn writer_held(&self, name: &str) -> bool {
        self.source(name).state.lock().writer_owner.is_some()
    }
}

impl<F: ConnectionFactory> std::fmt::Debug for ConnectionPool<F> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ConnectionPool")
            .field("sources", &self.sources.read().len())
            .finish_non_exhaustive()
    }
}

fn release_reader<H>(source: &Source<H>) {
    let tid = thread::current().id();
    let mut state = source.state.lock();
    let emptied = if let Some(slot) = state.readers.get_mut(&tid) {
        slot.depth -= 1;
        if slot.depth == 0 {
            if let Some(slot) = state.readers.remove(&tid) {
                if slot.conn.is_persistent() {
                    state.idle.push(slot.conn);
                }
            }
            state.readers.is_empty()
        } else {
            false
        }
    } else {
        false
    };
    if emptied {
        source.drain_cv.notify_all();
    }
}

fn release_writer<H>(source: &Source<H>) {
    let mut state = source.state.lock();
    state.writer_depth -= 1;
    if state.writer_depth == 0 {
        state.writer_owner = None;
        if !state.maintenance {
            state.gate_open = true;
        }
        source.gate_cv.notify_all();
        source.drain_cv.notify_all();
    }
}

/// A held read-only connection. Released on drop.
///
/// Not `Send`: the hold is thread-affine by construction.
pub struct ReadGuard<'p, H> {
    source: Arc<Source<H>>,
    conn: PooledConnection<H>,
    role: Role,
    _not_send: PhantomData<*mut ()>,
    _pool: PhantomData<&'p ()>,
}

impl<H> ReadGuard<'_, H> {
    fn new(source: Arc<Source<H>>, conn: PooledConnection<H>, role: Role) -> Self {
        Self {
            source,
            conn,
            role,
            _not_send: PhantomData,
            _pool: PhantomData,
        }
    }

    /// The pooled connection backing this guard.
    #[must_use]
    pub fn connection(&self) -> &PooledConnection<H> {
        &self.conn
    }
}

impl<H> std::ops::Deref for ReadGuard<'_, H> {
    type Target = H;

    fn deref(&self) -> &H {
        &self.conn
    }
}

impl<H> Drop for ReadGuard<'_, H> {
    fn drop(&mut self) {
        match self.role {
            Role::Reader => release_reader(&self.source),
            Role::Writer => release_writer(&self.source),
        }
    }
}

/// The held read-write connection. Released on drop, which reopens the
/// gate and wakes queued readers.
///
/// Not `Send`: the hold is thread-affine by construction.
pub struct WriteGuard<'p, H> {
    source: Arc<Source<H>>,
    conn: PooledConnection<H>,
    _not_send: PhantomData<*mut ()>,
    _pool: PhantomData<&'p ()>,
}

impl<H> WriteGuard<'_, H> {
    fn new(source: Arc<Source<H>>, conn: PooledConnection<H>) -> Self {
        Self {
            source,
            conn,
            _not_send: PhantomData,
            _pool: PhantomData,
        }
    }

    /// The pooled connection backing this guard.
    #[must_use]
    pub fn connection(&self) -> &PooledConnection<H> {
        &self.conn
    }
}

impl<H> std::ops::Deref for WriteGuard<'_, H> {
    type Target = H;

    fn deref(&self) -> &H {
        &self.conn
    }
}

impl<H> Drop for WriteGuard<'_, H> {
    fn drop(&mut self) {
        release_writer(&self.source);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicI32, AtomicUsize, Ordering};
    use std::sync::mpsc;
    use std::time::Duration;

    struct CountingFactory {
        connects: AtomicUsize,
        persistent: bool,
    }

    impl CountingFactory {
        fn new() -> Self {
            Self {
                connects: AtomicUsize::new(0),
                persistent: true,
            }
        }

        fn transient() -> Self {
            Self {
                connects: AtomicUsize::new(0),
                persistent: false,
            }
        }

        fn connects(&self) -> usize {
            self.connects.load(Ordering::SeqCst)
        }
    }

    impl ConnectionFactory for CountingFactory {
        type Handle = String;

        fn connect(&self, source: &str, mode: AccessMode) -> PoolResult<String> {
            self.connects.fetch_add(1, Ordering::SeqCst);
            Ok(format!("{source}:{mode:?}"))
        }

        fn is_persistent(&self, _source: &str) -> bool {
            self.persistent
        }
    }

    struct FailingFactory;

    impl ConnectionFactory for FailingFactory {
        type Handle = ();

        fn connect(&self, source: &str, _mode: AccessMode) -> PoolResult<()> {
            Err(PoolError::connect(source, "no such datastore"))
        }
    }

    #[test]
    fn read_then_release_returns_handle_to_idle() {
        let pool = ConnectionPool::new(CountingFactory::new());
        {
            let guard = pool.read("main").unwrap();
            assert_eq!(&*guard, "main:ReadOnly");
            assert_eq!(pool.reader_count("main"), 1);
        }
        assert_eq!(pool.reader_count("main"), 0);
        assert_eq!(pool.idle_count("main"), 1);

        // Second read reuses the idle handle
        let _guard = pool.read("main").unwrap();
        assert_eq!(pool.factory.connects(), 1);
    }

    #[test]
    fn non_persistent_handles_are_dropped_on_release() {
        let pool = ConnectionPool::new(CountingFactory::transient());
        drop(pool.read("main").unwrap());
        assert_eq!(pool.idle_count("main"), 0);

        drop(pool.read("main").unwrap());
        assert_eq!(pool.factory.connects(), 2);
    }

    #[test]
    fn nested_reads_are_reentrant() {
        let pool = ConnectionPool::new(CountingFactory::new());
        let outer = pool.read("main").unwrap();
        let inner = pool.read("main").unwrap();
        assert_eq!(pool.reader_count("main"), 1);
        assert_eq!(pool.factory.connects(), 1);
        drop(inner);
        assert_eq!(pool.reader_count("main"), 1);
        drop(outer);
        assert_eq!(pool.reader_count("main"), 0);
    }

    #[test]
    fn read_inside_write_reuses_writer() {
        let pool = ConnectionPool::new(CountingFactory::new());
        let write = pool.write("main").unwrap();
        let read = pool.read("main").unwrap();
        assert_eq!(&*read, "main:ReadWrite");
        drop(read);
        assert!(pool.writer_held("main"));
        drop(write);
        assert!(!pool.writer_held("main"));
    }

    #[test]
    fn write_is_reentrant_for_owner() {
        let pool = ConnectionPool::new(CountingFactory::new());
        let outer = pool.write("main").unwrap();
        let inner = pool.write("main").unwrap();
        drop(inner);
        assert!(pool.writer_held("main"));
        drop(outer);
        assert!(!pool.writer_held("main"));
    }

    #[test]
    fn upgrade_from_read_is_rejected() {
        let pool = ConnectionPool::new(CountingFactory::new());
        let _read = pool.read("main").unwrap();
        assert!(matches!(
            pool.write("main"),
            Err(PoolError::UpgradeDeadlock { .. })
        ));
    }

    #[test]
    fn sources_are_independent() {
        let pool = ConnectionPool::new(CountingFactory::new());
        let _w1 = pool.write("a").unwrap();
        // A writer on "a" does not close the gate on "b"
        let _r2 = pool.read("b").unwrap();
        assert_eq!(pool.reader_count("b"), 1);
    }

    #[test]
    fn writer_blocks_new_readers_until_released() {
        let pool = Arc::new(ConnectionPool::new(CountingFactory::new()));
        let write = pool.write("main").unwrap();

        let (tx, rx) = mpsc::channel();
        let pool2 = Arc::clone(&pool);
        let handle = thread::spawn(move || {
            let _guard = pool2.read("main").unwrap();
            tx.send(()).unwrap();
        });

        // Reader must be gated while the writer is held
        assert!(rx.recv_timeout(Duration::from_millis(100)).is_err());

        drop(write);
        rx.recv_timeout(Duration::from_secs(2))
            .expect("reader admitted after writer release");
        handle.join().unwrap();
    }

    #[test]
    fn writer_waits_for_reader_drain() {
        let pool = Arc::new(ConnectionPool::new(CountingFactory::new()));
        let (tx, rx) = mpsc::channel();

        let pool2 = Arc::clone(&pool);
        let (release_tx, release_rx) = mpsc::channel::<()>();
        let reader = thread::spawn(move || {
            let _guard = pool2.read("main").unwrap();
            release_rx.recv().unwrap();
        });

        // Wait for the reader to be inside
        while pool.reader_count("main") == 0 {
            thread::yield_now();
        }

        let pool3 = Arc::clone(&pool);
        let writer = thread::spawn(move || {
            let _guard = pool3.write("main").unwrap();
            tx.send(()).unwrap();
        });

        assert!(rx.recv_timeout(Duration::from_millis(100)).is_err());

        release_tx.send(()).unwrap();
        rx.recv_timeout(Duration::from_secs(2))
            .expect("writer entered after reader drain");
        reader.join().unwrap();
        writer.join().unwrap();
    }

    #[test]
    fn try_write_refuses_while_readers_live() {
        let pool = Arc::new(ConnectionPool::new(CountingFactory::new()));
        let (release_tx, release_rx) = mpsc::channel::<()>();
        let pool2 = Arc::clone(&pool);
        let reader = thread::spawn(move || {
            let _guard = pool2.read("main").unwrap();
            release_rx.recv().unwrap();
        });
        while pool.reader_count("main") == 0 {
            thread::yield_now();
        }

        assert!(pool.try_write("main").unwrap().is_none());

        release_tx.send(()).unwrap();
        reader.join().unwrap();
        assert!(pool.try_write("main").unwrap().is_some());
    }

    #[test]
    fn factory_failure_reopens_gate() {
        let pool = ConnectionPool::new(FailingFactory);
        assert!(pool.write("main").is_err());
        // A failed write acquisition must not leave the gate closed
        assert!(!pool.writer_held("main"));
        assert!(pool.write("main").is_err());
    }

    #[test]
    fn maintenance_waits_for_quiescence_and_blocks_admissions() {
        let pool = Arc::new(ConnectionPool::new(CountingFactory::new()));
        let (release_tx, release_rx) = mpsc::channel::<()>();
        let pool2 = Arc::clone(&pool);
        let reader = thread::spawn(move || {
            let _guard = pool2.read("main").unwrap();
            release_rx.recv().unwrap();
        });
        while pool.reader_count("main") == 0 {
            thread::yield_now();
        }

        let (maint_tx, maint_rx) = mpsc::channel();
        let pool3 = Arc::clone(&pool);
        let maint = thread::spawn(move || {
            pool3
                .with_exclusive("main", || {
                    maint_tx.send(()).unwrap();
                })
                .unwrap();
        });

        // Maintenance must wait for the in-flight reader
        assert!(maint_rx.recv_timeout(Duration::from_millis(100)).is_err());

        release_tx.send(()).unwrap();
        maint_rx
            .recv_timeout(Duration::from_secs(2))
            .expect("maintenance ran after reader drain");
        reader.join().unwrap();
        maint.join().unwrap();

        // Cached handles were dropped; the next read reconnects
        assert_eq!(pool.idle_count("main"), 0);
        let _guard = pool.read("main").unwrap();
    }

    #[test]
    fn maintenance_reentry_is_rejected() {
        let pool = ConnectionPool::new(CountingFactory::new());
        let _read = pool.read("main").unwrap();
        assert!(matches!(
            pool.with_exclusive("main", || ()),
            Err(PoolError::MaintenanceReentry { .. })
        ));
    }

    #[test]
    fn shutdown_removes_source() {
        let pool = ConnectionPool::new(CountingFactory::new());
        drop(pool.read("main").unwrap());
        assert_eq!(pool.idle_count("main"), 1);
        pool.shutdown("main").unwrap();
        assert!(pool.sources.read().get("main").is_none());
    }

    /// Randomized interleaving: the writer is never entered while any
    /// reader is entered, and at most one writer is ever entered.
    #[test]
    fn reader_writer_exclusion_under_contention() {
        let pool = Arc::new(ConnectionPool::new(CountingFactory::new()));
        let readers_active = Arc::new(AtomicI32::new(0));
        let writers_active = Arc::new(AtomicI32::new(0));
        let violations = Arc::new(AtomicUsize::new(0));

        let mut handles = Vec::new();
        for worker in 0..10 {
            let pool = Arc::clone(&pool);
            let readers_active = Arc::clone(&readers_active);
            let writers_active = Arc::clone(&writers_active);
            let violations = Arc::clone(&violations);
            let is_writer = worker < 2;

            handles.push(thread::spawn(move || {
                for _ in 0..200 {
                    if is_writer {
                        let _guard = pool.write("shared").unwrap();
                        let w = writers_active.fetch_add(1, Ordering::SeqCst);
                        let r = readers_active.load(Ordering::SeqCst);
                        if w != 0 || r != 0 {
                            violations.fetch_add(1, Ordering::SeqCst);
                        }
                        writers_active.fetch_sub(1, Ordering::SeqCst);
                    } else {
                        let _guard = pool.read("shared").unwrap();
                        readers_active.fetch_add(1, Ordering::SeqCst);
                        if writers_active.load(Ordering::SeqCst) != 0 {
                            violations.fetch_add(1, Ordering::SeqCst);
                        }
                        readers_active.fetch_sub(1, Ordering::SeqCst);
                    }
                }
            }));
        }
        for handle in handles {
            handle.join().unwrap();
        }

        assert_eq!(violations.load(Ordering::SeqCst), 0);
        assert_eq!(pool.reader_count("shared"), 0);
        assert!(!pool.writer_held("shared"));
    }
}
