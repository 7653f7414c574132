//! Cooperative async reader/writer lock.
//!
//! Admission-control primitive: it does not wrap the protected data, it hands
//! out RAII guards that callers hold across their critical section. Multiple
//! readers are admitted while no writer holds the lock; a writer excludes all
//! readers and other writers. Waiting writers gate new reader admission, so
//! continuous reader load cannot starve a writer.
//!
//! Cancellation: acquisition suspends cooperatively, so callers race it
//! against a `CancellationToken` (`tokio::select!`); dropping the acquisition
//! future abandons the wait without acquiring or leaking intent.

use std::pin::pin;

use parking_lot::Mutex;
use tokio::sync::Notify;

#[derive(Debug, Default)]
struct LockState {
    readers: usize,
    writer: bool,
    waiting_writers: usize,
}

/// Async reader/writer admission lock with writer preference.
#[derive(Debug, Default)]
pub struct SharedLock {
    state: Mutex<LockState>,
    /// Woken (all waiters) on every release and on abandoned writer intent.
    wake: Notify,
}

impl SharedLock {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Acquires shared read access, suspending while a writer holds or
    /// awaits the lock.
    pub async fn read(&self) -> ReadGuard<'_> {
        loop {
            let mut notified = pin!(self.wake.notified());
            {
                let mut state = self.state.lock();
                if !state.writer && state.waiting_writers == 0 {
                    state.readers += 1;
                    return ReadGuard { lock: self };
                }
                // Register for the wakeup before releasing the state lock so
                // a release between unlock and await cannot be missed.
                notified.as_mut().enable();
            }
            notified.await;
        }
    }

    /// Acquires exclusive write access, suspending until all readers drain.
    pub async fn write(&self) -> WriteGuard<'_> {
        let intent = WriterIntent::register(self);
        loop {
            let mut notified = pin!(self.wake.notified());
            {
                let mut state = self.state.lock();
                if !state.writer && state.readers == 0 {
                    state.writer = true;
                    state.waiting_writers -= 1;
                    intent.commit();
                    return WriteGuard { lock: self };
                }
                notified.as_mut().enable();
            }
            notified.await;
        }
    }

    /// Number of readers currently holding the lock.
    #[must_use]
    pub fn reader_count(&self) -> usize {
        self.state.lock().readers
    }

    /// Whether a writer currently holds the lock.
    #[must_use]
    pub fn is_write_locked(&self) -> bool {
        self.state.lock().writer
    }

    fn release_read(&self) {
        let mut state = self.state.lock();
        state.readers -= 1;
        drop(state);
        self.wake.notify_waiters();
    }

    fn release_write(&self) {
        let mut state = self.state.lock();
        state.writer = false;
        drop(state);
        self.wake.notify_waiters();
    }
}

/// Tracks a writer's declared intent so an abandoned (cancelled) `write()`
/// future un-gates the readers it was holding back.
struct WriterIntent<'a> {
    lock: &'a SharedLock,
    armed: bool,
}

impl<'a> WriterIntent<'a> {
    fn register(lock: &'a SharedLock) -> Self {
        lock.state.lock().waiting_writers += 1;
        Self { lock, armed: true }
    }

    fn commit(mut self) {
        self.armed = false;
    }
}

impl Drop for WriterIntent<'_> {
    fn drop(&mut self) {
        if self.armed {
            self.lock.state.lock().waiting_writers -= 1;
            self.lock.wake.notify_waiters();
        }
    }
}

/// RAII guard for shared read access. Releases on drop, on every exit path.
#[must_use]
pub struct ReadGuard<'a> {
    lock: &'a SharedLock,
}

impl Drop for ReadGuard<'_> {
    fn drop(&mut self) {
        self.lock.release_read();
    }
}

/// RAII guard for exclusive write access. Releases on drop, on every exit path.
#[must_use]
pub struct WriteGuard<'a> {
    lock: &'a SharedLock,
}

impl Drop for WriteGuard<'_> {
    fn drop(&mut self) {
        self.lock.release_write();
    }
}
