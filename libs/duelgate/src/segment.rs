//! Named shared-memory segment used as the transport between host and
//! peer process.
//!
//! The segment is an arena: a header holding a process-shared pthread
//! mutex + condition variable and the active action tag, followed by a
//! fixed-capacity byte buffer. The host creates it before the peer
//! starts and unlinks it only after the peer has terminated. All access
//! goes through the typed views below; raw pointer arithmetic never
//! leaves this module.
//!
//! The condition variable is used purely for wake-up notification.
//! Mutual exclusion of the byte buffer is structural: the current action
//! value decides which side is expected to touch it next.

use std::ffi::CString;
use std::mem;
use std::ptr::{self, NonNull};
use std::sync::atomic::{AtomicU32, Ordering};
use std::time::Duration;

use uuid::Uuid;

use crate::error::{BridgeError, Result};
use crate::protocol::Action;

/// Default byte-buffer capacity of a segment.
pub const DEFAULT_CAPACITY: usize = 256 * 1024;

/// Outcome of one bounded wait for the action tag to turn over.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum WaitOutcome {
    /// The action changed away from the value we were holding.
    Changed(Action),
    /// The full timeout elapsed with no change.
    TimedOut,
}

/// Process-wide-unique segment name, from an explicit allocator rather
/// than any object address, so two live bridges can never alias.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SegmentName(String);

impl SegmentName {
    pub fn allocate() -> Self {
        Self(format!(
            "dg-{}-{}",
            std::process::id(),
            Uuid::new_v4().simple()
        ))
    }

    pub fn from_string(name: impl Into<String>) -> Self {
        Self(name.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// POSIX shm object names carry a leading slash.
    fn to_cstring(&self) -> Result<CString> {
        CString::new(format!("/{}", self.0))
            .map_err(|_| BridgeError::Transport("segment name contains NUL".into()))
    }
}

impl std::fmt::Display for SegmentName {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.0)
    }
}

#[repr(C)]
struct SegmentHeader {
    mutex: libc::pthread_mutex_t,
    cond: libc::pthread_cond_t,
    action: AtomicU32,
}

const HEADER_SIZE: usize = mem::size_of::<SegmentHeader>();

#[cfg(any(target_os = "linux", target_os = "android"))]
const WAIT_CLOCK: libc::clockid_t = libc::CLOCK_MONOTONIC;
#[cfg(not(any(target_os = "linux", target_os = "android")))]
const WAIT_CLOCK: libc::clockid_t = libc::CLOCK_REALTIME;

fn os_error(op: &str) -> BridgeError {
    BridgeError::Transport(format!("{op}: {}", std::io::Error::last_os_error()))
}

fn rc_error(op: &str, rc: libc::c_int) -> BridgeError {
    BridgeError::Transport(format!("{op}: {}", std::io::Error::from_raw_os_error(rc)))
}

/// Mapped view of a segment. Shared by the host (creator) and peer
/// (attacher) wrappers; never constructed any other way. Public only as
/// the deref target of those wrappers.
pub struct RawSegment {
    base: NonNull<u8>,
    total: usize,
    capacity: usize,
}

// The mapping itself is shared with the peer process by design; on the
// Rust side a RawSegment is owned by exactly one bridge or serve loop.
unsafe impl Send for RawSegment {}

impl RawSegment {
    fn header(&self) -> *mut SegmentHeader {
        self.base.as_ptr().cast::<SegmentHeader>()
    }

    fn action_atom(&self) -> &AtomicU32 {
        // The header outlives every borrow of self; the atomic is valid
        // for shared access from both processes.
        unsafe { &(*self.header()).action }
    }

    pub(crate) fn capacity(&self) -> usize {
        self.capacity
    }

    /// Currently active action tag.
    pub(crate) fn action(&self) -> Result<Action> {
        let raw = self.action_atom().load(Ordering::SeqCst);
        Action::from_u32(raw)
            .ok_or_else(|| BridgeError::Protocol(format!("unknown action tag {raw}")))
    }

    /// The staged byte window. Only valid to read while the protocol
    /// says the other side is not writing it.
    pub(crate) fn buffer(&self) -> &[u8] {
        unsafe { std::slice::from_raw_parts(self.base.as_ptr().add(HEADER_SIZE), self.capacity) }
    }

    /// Mutable staged byte window. Only valid while this side holds the
    /// protocol turn.
    pub(crate) fn buffer_mut(&mut self) -> &mut [u8] {
        unsafe {
            std::slice::from_raw_parts_mut(self.base.as_ptr().add(HEADER_SIZE), self.capacity)
        }
    }

    /// Set the active action and wake the other side.
    pub(crate) fn post(&self, action: Action) -> Result<()> {
        unsafe {
            let hdr = self.header();
            let mtx = ptr::addr_of_mut!((*hdr).mutex);
            let rc = libc::pthread_mutex_lock(mtx);
            if rc != 0 {
                return Err(rc_error("pthread_mutex_lock", rc));
            }
            self.action_atom().store(action as u32, Ordering::SeqCst);
            libc::pthread_cond_signal(ptr::addr_of_mut!((*hdr).cond));
            libc::pthread_mutex_unlock(mtx);
        }
        Ok(())
    }

    /// Wait, bounded by `timeout`, for the action to change away from
    /// `current`. Spurious wakeups stay inside the same window.
    pub(crate) fn wait_while(&self, current: Action, timeout: Duration) -> Result<WaitOutcome> {
        let deadline = deadline_after(timeout);
        unsafe {
            let hdr = self.header();
            let mtx = ptr::addr_of_mut!((*hdr).mutex);
            let cond = ptr::addr_of_mut!((*hdr).cond);
            let rc = libc::pthread_mutex_lock(mtx);
            if rc != 0 {
                return Err(rc_error("pthread_mutex_lock", rc));
            }
            let outcome = loop {
                let raw = self.action_atom().load(Ordering::SeqCst);
                if raw != current as u32 {
                    break match Action::from_u32(raw) {
                        Some(a) => Ok(WaitOutcome::Changed(a)),
                        None => Err(BridgeError::Protocol(format!("unknown action tag {raw}"))),
                    };
                }
                let rc = libc::pthread_cond_timedwait(cond, mtx, &deadline);
                if rc == libc::ETIMEDOUT {
                    let raw = self.action_atom().load(Ordering::SeqCst);
                    break match raw {
                        r if r == current as u32 => Ok(WaitOutcome::TimedOut),
                        r => match Action::from_u32(r) {
                            Some(a) => Ok(WaitOutcome::Changed(a)),
                            None => Err(BridgeError::Protocol(format!("unknown action tag {r}"))),
                        },
                    };
                }
                if rc != 0 {
                    break Err(rc_error("pthread_cond_timedwait", rc));
                }
            };
            libc::pthread_mutex_unlock(mtx);
            outcome
        }
    }

    fn unmap(&mut self) {
        unsafe {
            libc::munmap(self.base.as_ptr().cast(), self.total);
        }
    }
}

fn deadline_after(timeout: Duration) -> libc::timespec {
    let mut now = libc::timespec {
        tv_sec: 0,
        tv_nsec: 0,
    };
    unsafe {
        libc::clock_gettime(WAIT_CLOCK, &mut now);
    }
    let nanos = now.tv_nsec as i64 + i64::from(timeout.subsec_nanos());
    libc::timespec {
        tv_sec: now.tv_sec + timeout.as_secs() as libc::time_t + (nanos / 1_000_000_000) as libc::time_t,
        tv_nsec: (nanos % 1_000_000_000) as _,
    }
}

/// Host-side segment: creates the OS resource, initializes the embedded
/// primitives, and unlinks the name on drop.
pub struct HostSegment {
    raw: RawSegment,
    name: SegmentName,
}

impl HostSegment {
    /// Create a fresh segment with `capacity` buffer bytes. Any stale
    /// resource of the same name (left by a prior crash) is removed
    /// first.
    pub fn create(name: &SegmentName, capacity: usize) -> Result<Self> {
        let cname = name.to_cstring()?;
        let total = HEADER_SIZE + capacity;
        unsafe {
            libc::shm_unlink(cname.as_ptr());
            let fd = libc::shm_open(
                cname.as_ptr(),
                libc::O_CREAT | libc::O_EXCL | libc::O_RDWR,
                0o600 as libc::mode_t,
            );
            if fd < 0 {
                return Err(os_error("shm_open"));
            }
            if libc::ftruncate(fd, total as libc::off_t) != 0 {
                let err = os_error("ftruncate");
                libc::close(fd);
                libc::shm_unlink(cname.as_ptr());
                return Err(err);
            }
            let base = libc::mmap(
                ptr::null_mut(),
                total,
                libc::PROT_READ | libc::PROT_WRITE,
                libc::MAP_SHARED,
                fd,
                0,
            );
            libc::close(fd);
            if base == libc::MAP_FAILED {
                let err = os_error("mmap");
                libc::shm_unlink(cname.as_ptr());
                return Err(err);
            }
            let raw = RawSegment {
                base: NonNull::new_unchecked(base.cast()),
                total,
                capacity,
            };
            if let Err(e) = init_header(raw.header()) {
                libc::munmap(base, total);
                libc::shm_unlink(cname.as_ptr());
                return Err(e);
            }
            tracing::debug!(name = %name, capacity, "created shared segment");
            Ok(Self {
                raw,
                name: name.clone(),
            })
        }
    }

    pub fn name(&self) -> &SegmentName {
        &self.name
    }
}

impl std::ops::Deref for HostSegment {
    type Target = RawSegment;

    fn deref(&self) -> &RawSegment {
        &self.raw
    }
}

impl std::ops::DerefMut for HostSegment {
    fn deref_mut(&mut self) -> &mut RawSegment {
        &mut self.raw
    }
}

impl Drop for HostSegment {
    fn drop(&mut self) {
        unsafe {
            let hdr = self.raw.header();
            // Best effort; a peer that died holding the mutex makes these
            // fail and that is fine, the mapping goes away regardless.
            libc::pthread_cond_destroy(ptr::addr_of_mut!((*hdr).cond));
            libc::pthread_mutex_destroy(ptr::addr_of_mut!((*hdr).mutex));
        }
        self.raw.unmap();
        if let Ok(cname) = self.name.to_cstring() {
            unsafe {
                libc::shm_unlink(cname.as_ptr());
            }
        }
        tracing::debug!(name = %self.name, "destroyed shared segment");
    }
}

fn init_header(hdr: *mut SegmentHeader) -> Result<()> {
    unsafe {
        let mut mattr: libc::pthread_mutexattr_t = mem::zeroed();
        let rc = libc::pthread_mutexattr_init(&mut mattr);
        if rc != 0 {
            return Err(rc_error("pthread_mutexattr_init", rc));
        }
        libc::pthread_mutexattr_setpshared(&mut mattr, libc::PTHREAD_PROCESS_SHARED);
        let rc = libc::pthread_mutex_init(ptr::addr_of_mut!((*hdr).mutex), &mattr);
        libc::pthread_mutexattr_destroy(&mut mattr);
        if rc != 0 {
            return Err(rc_error("pthread_mutex_init", rc));
        }

        let mut cattr: libc::pthread_condattr_t = mem::zeroed();
        let rc = libc::pthread_condattr_init(&mut cattr);
        if rc != 0 {
            return Err(rc_error("pthread_condattr_init", rc));
        }
        libc::pthread_condattr_setpshared(&mut cattr, libc::PTHREAD_PROCESS_SHARED);
        #[cfg(any(target_os = "linux", target_os = "android"))]
        libc::pthread_condattr_setclock(&mut cattr, libc::CLOCK_MONOTONIC);
        let rc = libc::pthread_cond_init(ptr::addr_of_mut!((*hdr).cond), &cattr);
        libc::pthread_condattr_destroy(&mut cattr);
        if rc != 0 {
            return Err(rc_error("pthread_cond_init", rc));
        }

        (*hdr).action.store(Action::NoWork as u32, Ordering::SeqCst);
    }
    Ok(())
}

/// Peer-side segment: attaches to an existing resource by name. Unmaps
/// on drop but never unlinks; the host owns the name.
pub struct PeerSegment {
    raw: RawSegment,
    name: SegmentName,
}

impl PeerSegment {
    pub fn attach(name: &SegmentName, capacity: usize) -> Result<Self> {
        let cname = name.to_cstring()?;
        let total = HEADER_SIZE + capacity;
        unsafe {
            let fd = libc::shm_open(cname.as_ptr(), libc::O_RDWR, 0 as libc::mode_t);
            if fd < 0 {
                return Err(os_error("shm_open"));
            }
            let mut st: libc::stat = mem::zeroed();
            if libc::fstat(fd, &mut st) != 0 {
                let err = os_error("fstat");
                libc::close(fd);
                return Err(err);
            }
            if (st.st_size as usize) < total {
                libc::close(fd);
                return Err(BridgeError::Transport(format!(
                    "segment {} is {} bytes, expected at least {}",
                    name, st.st_size, total
                )));
            }
            let base = libc::mmap(
                ptr::null_mut(),
                total,
                libc::PROT_READ | libc::PROT_WRITE,
                libc::MAP_SHARED,
                fd,
                0,
            );
            libc::close(fd);
            if base == libc::MAP_FAILED {
                return Err(os_error("mmap"));
            }
            tracing::debug!(name = %name, capacity, "attached shared segment");
            Ok(Self {
                raw: RawSegment {
                    base: NonNull::new_unchecked(base.cast()),
                    total,
                    capacity,
                },
                name: name.clone(),
            })
        }
    }

    pub fn name(&self) -> &SegmentName {
        &self.name
    }
}

impl std::ops::Deref for PeerSegment {
    type Target = RawSegment;

    fn deref(&self) -> &RawSegment {
        &self.raw
    }
}

impl std::ops::DerefMut for PeerSegment {
    fn deref_mut(&mut self) -> &mut RawSegment {
        &mut self.raw
    }
}

impl Drop for PeerSegment {
    fn drop(&mut self) {
        self.raw.unmap();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::thread;

    #[test]
    fn test_name_allocator_is_unique() {
        let a = SegmentName::allocate();
        let b = SegmentName::allocate();
        assert_ne!(a, b);
        assert!(a.as_str().starts_with("dg-"));
    }

    #[test]
    fn test_create_attach_and_stage_bytes() {
        let name = SegmentName::allocate();
        let mut host = HostSegment::create(&name, 4096).unwrap();
        let peer = PeerSegment::attach(&name, 4096).unwrap();

        host.buffer_mut()[..4].copy_from_slice(&[1, 2, 3, 4]);
        assert_eq!(&peer.buffer()[..4], &[1, 2, 3, 4]);
        assert_eq!(host.action().unwrap(), Action::NoWork);
        assert_eq!(peer.capacity(), 4096);
    }

    #[test]
    fn test_post_wakes_waiter() {
        let name = SegmentName::allocate();
        let host = HostSegment::create(&name, 1024).unwrap();

        let peer_name = name.clone();
        let t = thread::spawn(move || {
            let peer = PeerSegment::attach(&peer_name, 1024).unwrap();
            loop {
                match peer
                    .wait_while(Action::NoWork, Duration::from_secs(5))
                    .unwrap()
                {
                    WaitOutcome::Changed(a) => return a,
                    WaitOutcome::TimedOut => continue,
                }
            }
        });
        thread::sleep(Duration::from_millis(20));
        host.post(Action::Heartbeat).unwrap();
        assert_eq!(t.join().unwrap(), Action::Heartbeat);
    }

    #[test]
    fn test_wait_times_out_without_change() {
        let name = SegmentName::allocate();
        let host = HostSegment::create(&name, 1024).unwrap();
        let outcome = host
            .wait_while(Action::NoWork, Duration::from_millis(20))
            .unwrap();
        assert_eq!(outcome, WaitOutcome::TimedOut);
    }

    #[test]
    fn test_host_drop_unlinks_resource() {
        let name = SegmentName::allocate();
        let host = HostSegment::create(&name, 1024).unwrap();
        drop(host);
        assert!(PeerSegment::attach(&name, 1024).is_err());
    }

    #[test]
    fn test_create_recovers_stale_resource() {
        let name = SegmentName::allocate();
        // Simulate a crashed predecessor by leaking the first mapping
        // without unlinking.
        let first = HostSegment::create(&name, 1024).unwrap();
        std::mem::forget(first);
        let second = HostSegment::create(&name, 1024);
        assert!(second.is_ok());
    }
}
