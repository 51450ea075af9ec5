//! Pool of reusable commit frames.
//!
//! The dispatcher acquires a frame per resource operation and hands it back
//! once the operation has been applied. The queue is lock-free, so frames may
//! be released from outside the apply path as well.

use crossbeam::queue::SegQueue;

use trellis_core::resource::Commit;

const DEFAULT_CAPACITY: usize = 64;

#[derive(Debug)]
pub struct CommitPool {
    frames: SegQueue<Commit>,
    capacity: usize,
}

impl Default for CommitPool {
    fn default() -> Self {
        Self::new(DEFAULT_CAPACITY)
    }
}

impl CommitPool {
    pub fn new(capacity: usize) -> Self {
        Self {
            frames: SegQueue::new(),
            capacity,
        }
    }

    pub fn acquire(&self) -> Commit {
        self.frames.pop().unwrap_or_default()
    }

    /// Reset `commit` and keep it for reuse, unless the pool is full.
    pub fn release(&self, mut commit: Commit) {
        commit.reset();
        if self.frames.len() < self.capacity {
            self.frames.push(commit);
        }
    }

    pub fn idle(&self) -> usize {
        self.frames.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn released_frames_are_reset_and_reused() {
        let pool = CommitPool::new(1);
        let mut frame = pool.acquire();
        frame.index = 7;
        frame.args = json!({"k": 1});
        pool.release(frame);
        assert_eq!(pool.idle(), 1);

        let reused = pool.acquire();
        assert_eq!(reused.index, 0);
        assert!(reused.args.is_null());
        assert_eq!(pool.idle(), 0);

        pool.release(reused);
        pool.release(Commit::default());
        assert_eq!(pool.idle(), 1);
    }
}
