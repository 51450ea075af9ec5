//! Replicated exclusive lock with a FIFO wait queue.
//!
//! Every lock attempt carries a client-chosen attempt id. A successful
//! acquisition bumps the lock version and publishes a `lock` event to the
//! acquiring session; a failed or timed-out attempt publishes `fail` with
//! version `0`. Waiter timeouts run on log time through the scheduler.
//! Unlocking an attempt that is still queued withdraws it.

use std::collections::VecDeque;
use std::sync::atomic::{AtomicI32, Ordering};
use std::sync::Arc;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use serde_json::Value;
use trellis_core::descriptor::{HttpVerb, OperationDescriptor, ParamType};
use trellis_core::invoker::{decode, ResourceFacade};
use trellis_core::resource::{Clock, Context, NoArgs, Operations, ResourceState};
use trellis_core::scheduler::TimerId;
use trellis_core::{
    CompactionMode, Error, Invoker, ResourceHandle, ResourceId, Result, SessionEvent, SessionId,
};

pub mod ops {
    use trellis_core::OperationId;

    pub const LOCK: OperationId = -143;
    pub const UNLOCK: OperationId = -144;
    pub const IS_LOCKED: OperationId = -145;
}

pub const LOCK_EVENT: &str = "lock";
pub const FAIL_EVENT: &str = "fail";

/// Outcome of a lock attempt. A version of `0` means the attempt failed.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct LockEvent {
    pub id: i32,
    pub version: u64,
}

impl LockEvent {
    pub fn acquired(&self) -> bool {
        self.version > 0
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
struct Holder {
    session: SessionId,
    id: i32,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
struct Waiter {
    session: SessionId,
    id: i32,
    deadline: Option<u64>,
    timer: Option<TimerId>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LockTimeout {
    session: SessionId,
    id: i32,
}

#[derive(Debug, Default, Serialize, Deserialize)]
pub struct LockState {
    holder: Option<Holder>,
    version: u64,
    waiters: VecDeque<Waiter>,
}

#[derive(Debug, Serialize, Deserialize)]
pub struct LockArgs {
    pub id: i32,
    /// Milliseconds to wait; `0` tries once, negative waits forever.
    #[serde(default = "wait_forever")]
    pub timeout: i64,
}

fn wait_forever() -> i64 {
    -1
}

#[derive(Debug, Serialize, Deserialize)]
pub struct UnlockArgs {
    pub id: i32,
}

impl LockState {
    fn lock(&mut self, ctx: &mut Context<'_, LockTimeout>, args: LockArgs) -> Result<Option<LockEvent>> {
        let session = ctx.session();
        if self.holder.is_none() {
            return Ok(Some(self.grant(ctx, session, args.id)));
        }

        if args.timeout == 0 {
            let failed = LockEvent {
                id: args.id,
                version: 0,
            };
            ctx.publish(session, FAIL_EVENT, failed);
            return Ok(Some(failed));
        }

        let (deadline, timer) = if args.timeout > 0 {
            let delay = args.timeout as u64;
            let timer = ctx.schedule(delay, LockTimeout { session, id: args.id });
            (Some(ctx.time().saturating_add(delay)), Some(timer))
        } else {
            (None, None)
        };
        self.waiters.push_back(Waiter {
            session,
            id: args.id,
            deadline,
            timer,
        });
        Ok(None)
    }

    fn unlock(&mut self, ctx: &mut Context<'_, LockTimeout>, args: UnlockArgs) -> Result<()> {
        let caller = Holder {
            session: ctx.session(),
            id: args.id,
        };
        if self.holder == Some(caller) {
            self.release(ctx);
            return Ok(());
        }

        let queued = self
            .waiters
            .iter()
            .position(|w| w.session == caller.session && w.id == caller.id);
        match queued.and_then(|pos| self.waiters.remove(pos)) {
            Some(waiter) => {
                if let Some(t) = waiter.timer {
                    ctx.cancel(t);
                }
                Ok(())
            }
            None => Err(Error::IllegalUnlock(format!(
                "session {} does not hold the lock with attempt {}",
                caller.session, caller.id
            ))),
        }
    }

    fn grant(&mut self, ctx: &mut Context<'_, LockTimeout>, session: SessionId, id: i32) -> LockEvent {
        self.holder = Some(Holder { session, id });
        self.version += 1;
        let event = LockEvent {
            id,
            version: self.version,
        };
        ctx.publish(session, LOCK_EVENT, event);
        event
    }

    /// Drop the holder and hand the lock to the first live waiter.
    fn release(&mut self, ctx: &mut Context<'_, LockTimeout>) {
        self.holder = None;
        while let Some(w) = self.waiters.pop_front() {
            if let Some(t) = w.timer {
                ctx.cancel(t);
            }
            if !ctx.is_alive(w.session) {
                continue;
            }
            if w.deadline.map_or(false, |d| d <= ctx.time()) {
                ctx.publish(w.session, FAIL_EVENT, LockEvent { id: w.id, version: 0 });
                continue;
            }
            self.grant(ctx, w.session, w.id);
            return;
        }
    }

    fn is_locked(&self, _clock: Clock, _: NoArgs) -> Result<bool> {
        Ok(self.holder.is_some())
    }
}

impl ResourceState for LockState {
    type Timer = LockTimeout;
    type Facade = DistributedLock;

    const TYPE_ID: i32 = 7;
    const TYPE_NAME: &'static str = "lock";

    fn create(_config: &Value) -> Result<Self> {
        Ok(Self::default())
    }

    fn operations() -> Operations<Self> {
        Operations::new()
            .command(
                OperationDescriptor::command(ops::LOCK, "lock")
                    .verbs(&[HttpVerb::Post, HttpVerb::Put])
                    .arg("id", ParamType::Integer)
                    .query_param("timeout", ParamType::Integer)
                    .compaction_if_positive(
                        "timeout",
                        CompactionMode::Sequential,
                        CompactionMode::Quorum,
                    ),
                Self::lock,
            )
            .command(
                OperationDescriptor::command(ops::UNLOCK, "unlock")
                    .verbs(&[HttpVerb::Post, HttpVerb::Delete])
                    .arg("id", ParamType::Integer)
                    .compaction(CompactionMode::Sequential),
                Self::unlock,
            )
            .query(
                OperationDescriptor::query(ops::IS_LOCKED, "is_locked"),
                Self::is_locked,
            )
    }

    fn on_timer(&mut self, ctx: &mut Context<'_, LockTimeout>, timer: LockTimeout) {
        let pos = self
            .waiters
            .iter()
            .position(|w| w.session == timer.session && w.id == timer.id);
        if let Some(pos) = pos {
            self.waiters.remove(pos);
            ctx.publish(
                timer.session,
                FAIL_EVENT,
                LockEvent {
                    id: timer.id,
                    version: 0,
                },
            );
        }
    }

    fn on_session_lost(&mut self, ctx: &mut Context<'_, LockTimeout>, session: SessionId) {
        let mut kept = VecDeque::with_capacity(self.waiters.len());
        for w in self.waiters.drain(..) {
            if w.session == session {
                if let Some(t) = w.timer {
                    ctx.cancel(t);
                }
            } else {
                kept.push_back(w);
            }
        }
        self.waiters = kept;

        if self.holder.map(|h| h.session) == Some(session) {
            self.release(ctx);
        }
    }
}

/// Typed client facade for a lock resource.
///
/// Attempt ids are allocated per facade, so one facade should be used per
/// logical lock owner.
pub struct DistributedLock {
    handle: ResourceHandle,
    attempts: AtomicI32,
    /// Attempt id currently holding the lock, `0` when none.
    held: AtomicI32,
}

impl DistributedLock {
    pub async fn create(invoker: Arc<dyn Invoker>, name: &str) -> Result<Self> {
        let handle =
            ResourceHandle::create(invoker, name, LockState::TYPE_NAME, Value::Null).await?;
        Ok(Self::from_handle(handle))
    }

    pub fn attach(invoker: Arc<dyn Invoker>, id: ResourceId) -> Self {
        Self::from_handle(ResourceHandle::attach(invoker, id))
    }

    fn from_handle(handle: ResourceHandle) -> Self {
        Self {
            handle,
            attempts: AtomicI32::new(0),
            held: AtomicI32::new(0),
        }
    }

    pub fn id(&self) -> ResourceId {
        self.handle.id()
    }

    /// Acquire the lock, waiting without bound.
    pub async fn lock(&self) -> Result<LockEvent> {
        self.attempt(-1, None).await
    }

    /// Try once without queueing.
    pub async fn try_lock(&self) -> Result<LockEvent> {
        self.attempt(0, None).await
    }

    /// Queue for at most `timeout`, measured in log time on the cluster.
    pub async fn try_lock_for(&self, timeout: Duration) -> Result<LockEvent> {
        let ms = i64::try_from(timeout.as_millis()).unwrap_or(i64::MAX);
        // Allow for log time lagging behind the local clock.
        self.attempt(ms.max(1), Some(timeout * 2)).await
    }

    async fn attempt(&self, timeout: i64, wait: Option<Duration>) -> Result<LockEvent> {
        let id = self.attempts.fetch_add(1, Ordering::SeqCst) + 1;
        let resp = self
            .handle
            .command_raw(ops::LOCK, LockArgs { id, timeout })
            .await?;

        let event = match decode::<Option<LockEvent>>(resp.result)? {
            Some(event) => event,
            None => {
                let resource = self.handle.id();
                let filter = move |e: &SessionEvent| {
                    e.resource == resource
                        && (e.name == LOCK_EVENT || e.name == FAIL_EVENT)
                        && e.payload.get("id").and_then(Value::as_i64) == Some(id as i64)
                };
                match self
                    .handle
                    .invoker()
                    .wait_event(resp.event_index, wait, &filter)
                    .await?
                {
                    Some(e) => decode(e.payload)?,
                    None => {
                        self.withdraw(id).await?;
                        return Err(Error::Timeout);
                    }
                }
            }
        };

        if event.acquired() {
            self.held.store(event.id, Ordering::SeqCst);
        }
        Ok(event)
    }

    /// Withdraw attempt `id` after giving up on it locally. Releases the lock
    /// if the grant landed in the meantime.
    async fn withdraw(&self, id: i32) -> Result<()> {
        match self.handle.command(ops::UNLOCK, UnlockArgs { id }).await {
            // The attempt already failed on the cluster.
            Err(Error::IllegalUnlock(_)) => Ok(()),
            other => other,
        }
    }

    /// Release the lock acquired through this facade.
    pub async fn unlock(&self) -> Result<()> {
        let id = match self.held.swap(0, Ordering::SeqCst) {
            0 => return Err(Error::IllegalUnlock("lock not held by this handle".to_string())),
            id => id,
        };
        self.handle.command(ops::UNLOCK, UnlockArgs { id }).await
    }

    pub async fn is_locked(&self) -> Result<bool> {
        self.handle.query(ops::IS_LOCKED, serde_json::json!({})).await
    }
}

impl ResourceFacade for DistributedLock {
    fn attach(invoker: Arc<dyn Invoker>, id: ResourceId) -> Self {
        DistributedLock::attach(invoker, id)
    }
}
