//! The OSD's backing store for chunk data.
//!
//! Chunks are plain files under the store directory, named by chunk id:
//! `root/xx/yyyyyyyyyyyyyy` with `xx = cid & 0xff` and `y... = cid >> 16`.
//! Open/close are expensive, so descriptors for recently used chunks stay
//! cached, bounded by `max_open`; a dedicated LRU thread closes
//! descriptors that have been idle past `timeo_secs`, or sooner when
//! someone is waiting for the budget.
//!
//! All bookkeeping lives behind one mutex. Blocking work — open, close,
//! read, write, unlink — always happens with the mutex released; while a
//! thread is using a chunk it holds only the chunk's refcount. A chunk
//! with `refcnt == -1` is mid-create or mid-destroy and is not touchable;
//! writers ride out that window with a short busy-wait, which only racing
//! create/destroy pairs ever hit.

use fishconfig::OstorConf;
use std::collections::{BTreeMap, BTreeSet};
use std::fs::{self, File, OpenOptions};
use std::io::Write as _;
use std::os::unix::fs::FileExt;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Condvar, Mutex};
use std::time::{Duration, Instant};
use thiserror::Error;
use tracing::{debug, info, warn};
use wire::Ferr;

/// Reserved, never a valid chunk id.
pub const INVAL_CID: u64 = 0;

const LRU_PERIOD: Duration = Duration::from_secs(60);
const CREATE_RACE_SLEEP: Duration = Duration::from_millis(1);
const PROBE_DIR: &str = "test.tmp";

#[derive(Debug, Error)]
pub enum OstorError {
    #[error("{0}")]
    Errno(Ferr),

    #[error("chunk store i/o error: {0}")]
    Io(#[from] std::io::Error),
}

impl From<Ferr> for OstorError {
    fn from(e: Ferr) -> OstorError {
        OstorError::Errno(e)
    }
}

impl OstorError {
    pub fn errno(&self) -> Ferr {
        match self {
            OstorError::Errno(e) => *e,
            OstorError::Io(e) => Ferr::from_io(e),
        }
    }
}

struct Chunk {
    file: Option<Arc<File>>,
    atime: Instant,
    /// -1 while being created or destroyed; otherwise the number of
    /// threads currently using the chunk.
    refcnt: i32,
}

struct OstorState {
    shutdown: bool,
    num_open: usize,
    /// How many waiters need a descriptor closed before they can open.
    need_lru: usize,
    by_cid: BTreeMap<u64, Chunk>,
    /// Exactly the chunks with `refcnt == 0`, ordered oldest first.
    by_atime: BTreeSet<(Instant, u64)>,
}

struct OstorInner {
    dir: PathBuf,
    max_open: usize,
    atime_timeo: Duration,
    state: Mutex<OstorState>,
    lru_cond: Condvar,
    alloc_cond: Condvar,
}

/// An acquired chunk: a refcount on the record plus a handle to its file.
struct ChunkRef {
    cid: u64,
    file: Arc<File>,
}

pub struct Ostor {
    inner: Arc<OstorInner>,
    lru_thread: Mutex<Option<std::thread::JoinHandle<()>>>,
}

fn chunk_dir(dir: &Path, cid: u64) -> PathBuf {
    dir.join(format!("{:02x}", cid & 0xff))
}

fn chunk_path(dir: &Path, cid: u64) -> PathBuf {
    chunk_dir(dir, cid).join(format!("{:014x}", cid >> 16))
}

/// Open the backing file; on create, make the fan-out directory on
/// demand. Called with the store mutex released.
fn open_chunk_file(dir: &Path, cid: u64, create: bool) -> Result<File, OstorError> {
    let path = chunk_path(dir, cid);
    let mut opts = OpenOptions::new();
    opts.read(true).append(true).create(create);
    match opts.open(&path) {
        Ok(f) => Ok(f),
        Err(e) if e.kind() == std::io::ErrorKind::NotFound && create => {
            if let Err(mkdir_err) = fs::create_dir(chunk_dir(dir, cid)) {
                if mkdir_err.kind() != std::io::ErrorKind::AlreadyExists {
                    return Err(mkdir_err.into());
                }
            }
            Ok(opts.open(&path)?)
        }
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => Err(Ferr::NoEnt.into()),
        Err(e) => Err(e.into()),
    }
}

fn read_fully(file: &File, off: u64, len: usize) -> std::io::Result<Vec<u8>> {
    let mut buf = vec![0u8; len];
    let mut done = 0;
    while done < len {
        match file.read_at(&mut buf[done..], off + done as u64) {
            Ok(0) => break,
            Ok(n) => done += n,
            Err(e) if e.kind() == std::io::ErrorKind::Interrupted => continue,
            Err(e) => return Err(e),
        }
    }
    buf.truncate(done);
    Ok(buf)
}

impl Ostor {
    pub fn open(conf: &OstorConf) -> Result<Ostor, OstorError> {
        if let Err(e) = fs::create_dir(&conf.path) {
            if e.kind() != std::io::ErrorKind::AlreadyExists {
                return Err(e.into());
            }
        }
        // Fail now, not on the first write, if the directory is unusable.
        let probe = conf.path.join(PROBE_DIR);
        fs::create_dir(&probe)?;
        fs::remove_dir(&probe)?;

        let inner = Arc::new(OstorInner {
            dir: conf.path.clone(),
            max_open: conf.max_open,
            atime_timeo: Duration::from_secs(conf.timeo_secs),
            state: Mutex::new(OstorState {
                shutdown: false,
                num_open: 0,
                need_lru: 0,
                by_cid: BTreeMap::new(),
                by_atime: BTreeSet::new(),
            }),
            lru_cond: Condvar::new(),
            alloc_cond: Condvar::new(),
        });
        let lru_inner = inner.clone();
        let handle = std::thread::Builder::new()
            .name("ostor-lru".to_string())
            .spawn(move || lru_loop(lru_inner))?;
        info!(dir = %conf.path.display(), max_open = conf.max_open, "chunk store ready");
        Ok(Ostor {
            inner,
            lru_thread: Mutex::new(Some(handle)),
        })
    }

    /// Currently open descriptors, for monitoring. Never exceeds
    /// `max_open`.
    pub fn open_count(&self) -> usize {
        self.inner.state.lock().unwrap().num_open
    }

    /// Append `data` to the chunk and commit it, creating the chunk if it
    /// does not exist yet.
    pub fn write(&self, cid: u64, data: &[u8]) -> Result<(), OstorError> {
        let chunk = self.acquire(cid, true)?;
        let mut file: &File = &chunk.file;
        let res = file.write_all(data).and_then(|_| file.sync_data());
        self.release(chunk);
        res.map_err(OstorError::from)
    }

    /// Read up to `len` bytes at `off`; short at end of chunk.
    pub fn read(&self, cid: u64, off: u64, len: usize) -> Result<Vec<u8>, OstorError> {
        let chunk = self.acquire(cid, false)?;
        let res = read_fully(&chunk.file, off, len);
        self.release(chunk);
        res.map_err(OstorError::from)
    }

    /// Delete the chunk. Waits for current users to finish, then removes
    /// the backing file before letting anyone re-create the id.
    pub fn unlink(&self, cid: u64) -> Result<(), OstorError> {
        if cid == INVAL_CID {
            return Err(Ferr::Inval.into());
        }
        let inner = &self.inner;
        let mut st = inner.state.lock().unwrap();
        loop {
            if st.shutdown {
                return Err(Ferr::Shutdown.into());
            }
            match st.by_cid.get(&cid).map(|ch| ch.refcnt) {
                Some(-1) => return Err(Ferr::NoEnt.into()),
                Some(0) => break,
                Some(_) => {
                    // Readers drain quickly; ride them out.
                    drop(st);
                    std::thread::sleep(CREATE_RACE_SLEEP);
                    st = inner.state.lock().unwrap();
                }
                None => {
                    st = self.load_chunk(st, cid, false)?;
                }
            }
        }
        {
            let state = &mut *st;
            if let Some(ch) = state.by_cid.get_mut(&cid) {
                ch.refcnt = -1;
                state.by_atime.remove(&(ch.atime, cid));
            }
        }
        drop(st);

        let path = chunk_path(&inner.dir, cid);
        if let Err(e) = fs::remove_file(&path) {
            warn!(cid, path = %path.display(), error = %e, "failed to unlink chunk file");
        }

        // Only now that the file is gone may the record leave memory;
        // dropping it earlier would let a re-create race our unlink.
        let mut st = inner.state.lock().unwrap();
        let file = match st.by_cid.remove(&cid) {
            Some(mut ch) => {
                if st.need_lru > 0 {
                    st.need_lru -= 1;
                }
                st.num_open -= 1;
                inner.alloc_cond.notify_one();
                ch.file.take()
            }
            None => None,
        };
        drop(st);
        drop(file);
        Ok(())
    }

    /// Stop the LRU thread and fail every future operation with
    /// `ESHUTDOWN`.
    pub fn shutdown(&self) {
        {
            let mut st = self.inner.state.lock().unwrap();
            if st.shutdown {
                return;
            }
            st.shutdown = true;
            self.inner.lru_cond.notify_all();
            self.inner.alloc_cond.notify_all();
        }
        let handle = self.lru_thread.lock().unwrap().take();
        if let Some(handle) = handle {
            if handle.join().is_err() {
                warn!("ostor lru thread panicked");
            }
        }
    }

    /// Bring a chunk into memory with `refcnt == -1`, open its file with
    /// the mutex released, then publish it at `refcnt == 0`. The caller's
    /// loop re-examines the map afterwards.
    fn load_chunk<'a>(
        &'a self,
        mut st: std::sync::MutexGuard<'a, OstorState>,
        cid: u64,
        create: bool,
    ) -> Result<std::sync::MutexGuard<'a, OstorState>, OstorError> {
        let inner = &self.inner;
        if st.num_open < inner.max_open {
            st.by_cid.insert(
                cid,
                Chunk {
                    file: None,
                    atime: Instant::now(),
                    refcnt: -1,
                },
            );
            st.num_open += 1;
            drop(st);
            let opened = open_chunk_file(&inner.dir, cid, create);
            st = inner.state.lock().unwrap();
            match opened {
                Ok(file) => {
                    if let Some(ch) = st.by_cid.get_mut(&cid) {
                        ch.file = Some(Arc::new(file));
                        ch.refcnt = 0;
                    }
                    Ok(st)
                }
                Err(e) => {
                    st.by_cid.remove(&cid);
                    if st.need_lru > 0 {
                        st.need_lru -= 1;
                    }
                    st.num_open -= 1;
                    inner.alloc_cond.notify_one();
                    Err(e)
                }
            }
        } else {
            // Descriptor budget exhausted: ask the LRU thread for room.
            st.need_lru += 1;
            inner.lru_cond.notify_one();
            Ok(inner.alloc_cond.wait(st).unwrap())
        }
    }

    fn acquire(&self, cid: u64, create: bool) -> Result<ChunkRef, OstorError> {
        if cid == INVAL_CID {
            return Err(Ferr::Inval.into());
        }
        let inner = &self.inner;
        let mut st = inner.state.lock().unwrap();
        loop {
            if st.shutdown {
                return Err(Ferr::Shutdown.into());
            }
            match st.by_cid.get(&cid).map(|ch| ch.refcnt) {
                Some(-1) => {
                    if !create {
                        // Mid-create or mid-destroy; a reader sees neither.
                        return Err(Ferr::NoEnt.into());
                    }
                    drop(st);
                    std::thread::sleep(CREATE_RACE_SLEEP);
                    st = inner.state.lock().unwrap();
                }
                Some(_) => break,
                None => {
                    st = self.load_chunk(st, cid, create)?;
                }
            }
        }
        let state = &mut *st;
        let Some(ch) = state.by_cid.get_mut(&cid) else {
            return Err(Ferr::NoEnt.into());
        };
        state.by_atime.remove(&(ch.atime, cid));
        ch.refcnt += 1;
        match &ch.file {
            Some(file) => Ok(ChunkRef {
                cid,
                file: file.clone(),
            }),
            None => {
                ch.refcnt -= 1;
                Err(Ferr::Io.into())
            }
        }
    }

    fn release(&self, chunk: ChunkRef) {
        let mut st = self.inner.state.lock().unwrap();
        let state = &mut *st;
        if let Some(ch) = state.by_cid.get_mut(&chunk.cid) {
            ch.atime = Instant::now();
            ch.refcnt -= 1;
            if ch.refcnt == 0 {
                state.by_atime.insert((ch.atime, chunk.cid));
                if state.need_lru > 0 {
                    self.inner.lru_cond.notify_one();
                }
            }
        }
    }
}

impl Drop for Ostor {
    fn drop(&mut self) {
        self.shutdown();
    }
}

fn lru_loop(inner: Arc<OstorInner>) {
    let mut st = inner.state.lock().unwrap();
    loop {
        if st.shutdown {
            return;
        }
        let now = Instant::now();
        let victim = match st.by_atime.iter().next().copied() {
            Some((atime, cid))
                if st.need_lru > 0 || now.duration_since(atime) >= inner.atime_timeo =>
            {
                Some((atime, cid))
            }
            _ => None,
        };
        let Some((atime, cid)) = victim else {
            let (guard, _) = inner.lru_cond.wait_timeout(st, LRU_PERIOD).unwrap();
            st = guard;
            continue;
        };
        st.by_atime.remove(&(atime, cid));
        let file = match st.by_cid.get_mut(&cid) {
            Some(ch) => {
                ch.refcnt = -1;
                ch.file.take()
            }
            None => None,
        };
        debug!(cid, "evicting idle chunk");
        drop(st);
        drop(file); // the close happens with the lock released
        st = inner.state.lock().unwrap();
        st.by_cid.remove(&cid);
        if st.need_lru > 0 {
            st.need_lru -= 1;
        }
        st.num_open -= 1;
        inner.alloc_cond.notify_one();
    }
}
