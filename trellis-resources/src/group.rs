//! Replicated process group: membership, leader election and messaging.
//!
//! Members are bound to the session that joined them. Persistent members
//! survive the loss of their session as tombstones and can be revived by a
//! later `join` with the same id; they keep their original join index and
//! so their place in the election order.
//!
//! The leader is the alive member with the lowest join index. Every change
//! of leader increments the term and publishes a `status` event to the
//! group's listeners.
//!
//! Messages are published as `message` events to the target member's
//! session. Unless sent with `async` execution, each delivery stays pending
//! until the member answers with `reply` or `ack`, or is lost; either way
//! the producer's session receives exactly one `ack` event per delivery.

use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use trellis_core::descriptor::{HttpVerb, OperationDescriptor, ParamType};
use trellis_core::invoker::{decode, ResourceFacade};
use trellis_core::resource::{Clock, Context, NoArgs, Operations, ResourceState};
use trellis_core::{
    CompactionMode, Error, Invoker, ResourceHandle, ResourceId, Result, SessionEvent, SessionId,
};

use crate::listeners::Listeners;

pub mod ops {
    use trellis_core::OperationId;

    pub const JOIN: OperationId = -130;
    pub const LEAVE: OperationId = -131;
    pub const LISTEN: OperationId = -132;
    pub const MEMBERS: OperationId = -133;
    pub const STATUS: OperationId = -134;
    pub const MESSAGE: OperationId = -137;
    pub const REPLY: OperationId = -138;
    pub const ACK: OperationId = -139;
}

pub const JOIN_EVENT: &str = "join";
pub const LEAVE_EVENT: &str = "leave";
pub const STATUS_EVENT: &str = "status";
pub const MESSAGE_EVENT: &str = "message";
pub const ACK_EVENT: &str = "ack";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Delivery {
    #[default]
    Direct,
    Random,
    Broadcast,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Execution {
    #[default]
    Sync,
    Async,
    RequestReply,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct GroupMemberInfo {
    pub id: String,
    /// Log index of the member's first join.
    pub index: u64,
    pub persistent: bool,
    #[serde(default)]
    pub metadata: Value,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct GroupStatus {
    pub term: u64,
    pub leader: Option<String>,
    pub members: Vec<GroupMemberInfo>,
}

/// Payload of a `message` event.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct GroupMessage {
    pub member: String,
    pub producer: i32,
    pub queue: String,
    pub id: u64,
    pub message: Value,
    pub execution: Execution,
}

/// Payload of an `ack` event.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct GroupAck {
    pub member: Option<String>,
    pub producer: i32,
    pub queue: String,
    pub id: u64,
    pub succeeded: bool,
    pub message: Value,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
struct Member {
    info: GroupMemberInfo,
    session: SessionId,
    alive: bool,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
struct Pending {
    member: String,
    queue: String,
    id: u64,
    session: SessionId,
    producer: i32,
}

impl Pending {
    fn matches(&self, member: &str, queue: &str, id: u64) -> bool {
        self.member == member && self.queue == queue && self.id == id
    }
}

#[derive(Debug, Default, Serialize, Deserialize)]
pub struct GroupState {
    term: u64,
    leader: Option<String>,
    members: BTreeMap<String, Member>,
    listeners: Listeners,
    /// Outstanding deliveries in send order.
    pending: Vec<Pending>,
}

#[derive(Debug, Serialize, Deserialize)]
pub struct JoinArgs {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub member: Option<String>,
    #[serde(default)]
    pub persist: bool,
    #[serde(default)]
    pub metadata: Value,
}

#[derive(Debug, Serialize, Deserialize)]
pub struct LeaveArgs {
    pub member: String,
}

#[derive(Debug, Serialize, Deserialize)]
pub struct MessageArgs {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub member: Option<String>,
    #[serde(default)]
    pub producer: i32,
    #[serde(default)]
    pub queue: String,
    pub id: u64,
    #[serde(default)]
    pub message: Value,
    #[serde(default)]
    pub delivery: Delivery,
    #[serde(default)]
    pub execution: Execution,
}

#[derive(Debug, Serialize, Deserialize)]
pub struct ReplyArgs {
    /// Defaults to the member of the calling session the message went to.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub member: Option<String>,
    #[serde(default)]
    pub queue: String,
    pub id: u64,
    #[serde(default = "succeeded")]
    pub succeeded: bool,
    #[serde(default)]
    pub message: Value,
}

#[derive(Debug, Serialize, Deserialize)]
pub struct AckArgs {
    pub member: String,
    pub producer: i32,
    #[serde(default)]
    pub queue: String,
    pub id: u64,
    #[serde(default = "succeeded")]
    pub succeeded: bool,
    #[serde(default)]
    pub message: Value,
}

fn succeeded() -> bool {
    true
}

impl GroupState {
    fn alive(&self) -> impl Iterator<Item = &Member> {
        self.members.values().filter(|m| m.alive)
    }

    fn status(&self) -> GroupStatus {
        let mut members: Vec<GroupMemberInfo> = self.alive().map(|m| m.info.clone()).collect();
        members.sort_by_key(|m| m.index);
        GroupStatus {
            term: self.term,
            leader: self.leader.clone(),
            members,
        }
    }

    /// Re-run the election; publishes `status` if the leader changed.
    fn elect(&mut self, ctx: &mut Context<'_, ()>) {
        let leader_alive = self
            .leader
            .as_ref()
            .and_then(|l| self.members.get(l))
            .map_or(false, |m| m.alive);
        if leader_alive {
            return;
        }

        let candidate = self
            .alive()
            .min_by(|a, b| a.info.index.cmp(&b.info.index).then(a.info.id.cmp(&b.info.id)))
            .map(|m| m.info.id.clone());
        if candidate == self.leader {
            return;
        }
        self.leader = candidate;
        self.term += 1;
        let status = self.status();
        self.listeners.notify(ctx, STATUS_EVENT, &status);
    }

    fn join(&mut self, ctx: &mut Context<'_, ()>, args: JoinArgs) -> Result<GroupMemberInfo> {
        let id = args.member.unwrap_or_else(|| ctx.index().to_string());
        let session = ctx.session();

        let info = match self.members.get_mut(&id) {
            Some(m) if m.alive => return Err(Error::DuplicateMember(id)),
            Some(m) => {
                m.alive = true;
                m.session = session;
                m.info.persistent = args.persist;
                m.info.metadata = args.metadata;
                m.info.clone()
            }
            None => {
                let info = GroupMemberInfo {
                    id: id.clone(),
                    index: ctx.index(),
                    persistent: args.persist,
                    metadata: args.metadata,
                };
                self.members.insert(
                    id,
                    Member {
                        info: info.clone(),
                        session,
                        alive: true,
                    },
                );
                info
            }
        };

        self.listeners.notify(ctx, JOIN_EVENT, &info);
        self.elect(ctx);
        Ok(info)
    }

    fn leave(&mut self, ctx: &mut Context<'_, ()>, args: LeaveArgs) -> Result<bool> {
        match self.members.remove(&args.member) {
            Some(m) => {
                if m.alive {
                    self.member_lost(ctx, &args.member);
                }
                self.elect(ctx);
                Ok(true)
            }
            None => Ok(false),
        }
    }

    fn listen(&mut self, ctx: &mut Context<'_, ()>, _: NoArgs) -> Result<GroupStatus> {
        self.listeners.register(ctx.session());
        Ok(self.status())
    }

    /// Announce a member's departure and fail its outstanding deliveries.
    fn member_lost(&mut self, ctx: &mut Context<'_, ()>, member: &str) {
        self.listeners
            .notify(ctx, LEAVE_EVENT, &json!({ "member": member }));

        let (lost, kept): (Vec<Pending>, Vec<Pending>) = std::mem::take(&mut self.pending)
            .into_iter()
            .partition(|p| p.member == member);
        self.pending = kept;
        for p in lost {
            ctx.publish(
                p.session,
                ACK_EVENT,
                GroupAck {
                    member: Some(p.member),
                    producer: p.producer,
                    queue: p.queue,
                    id: p.id,
                    succeeded: false,
                    message: Value::Null,
                },
            );
        }
    }

    fn message(&mut self, ctx: &mut Context<'_, ()>, args: MessageArgs) -> Result<usize> {
        let producer_session = ctx.session();
        let targets: Vec<(String, SessionId)> = match args.delivery {
            Delivery::Direct => {
                let member = args
                    .member
                    .as_deref()
                    .ok_or_else(|| Error::bad_request("direct delivery requires a member"))?;
                self.members
                    .get(member)
                    .filter(|m| m.alive)
                    .map(|m| (m.info.id.clone(), m.session))
                    .into_iter()
                    .collect()
            }
            Delivery::Random => {
                let alive: Vec<&Member> = self.alive().collect();
                if alive.is_empty() {
                    Vec::new()
                } else {
                    let m = alive[(ctx.index() % alive.len() as u64) as usize];
                    vec![(m.info.id.clone(), m.session)]
                }
            }
            Delivery::Broadcast => self
                .alive()
                .map(|m| (m.info.id.clone(), m.session))
                .collect(),
        };

        if targets.is_empty() {
            ctx.publish(
                producer_session,
                ACK_EVENT,
                GroupAck {
                    member: args.member,
                    producer: args.producer,
                    queue: args.queue,
                    id: args.id,
                    succeeded: false,
                    message: Value::Null,
                },
            );
            return Ok(0);
        }

        for (member, session) in &targets {
            ctx.publish(
                *session,
                MESSAGE_EVENT,
                GroupMessage {
                    member: member.clone(),
                    producer: args.producer,
                    queue: args.queue.clone(),
                    id: args.id,
                    message: args.message.clone(),
                    execution: args.execution,
                },
            );
            if args.execution == Execution::Async {
                ctx.publish(
                    producer_session,
                    ACK_EVENT,
                    GroupAck {
                        member: Some(member.clone()),
                        producer: args.producer,
                        queue: args.queue.clone(),
                        id: args.id,
                        succeeded: true,
                        message: Value::Null,
                    },
                );
            } else {
                self.pending
                    .retain(|p| !p.matches(member, &args.queue, args.id));
                self.pending.push(Pending {
                    member: member.clone(),
                    queue: args.queue.clone(),
                    id: args.id,
                    session: producer_session,
                    producer: args.producer,
                });
            }
        }
        Ok(targets.len())
    }

    fn resolve(
        &mut self,
        ctx: &mut Context<'_, ()>,
        member: String,
        queue: String,
        id: u64,
        succeeded: bool,
        message: Value,
    ) -> bool {
        let Some(pos) = self.pending.iter().position(|p| p.matches(&member, &queue, id)) else {
            return false;
        };
        let p = self.pending.remove(pos);
        ctx.publish(
            p.session,
            ACK_EVENT,
            GroupAck {
                member: Some(member),
                producer: p.producer,
                queue,
                id,
                succeeded,
                message,
            },
        );
        true
    }

    fn reply(&mut self, ctx: &mut Context<'_, ()>, args: ReplyArgs) -> Result<bool> {
        let member = match args.member {
            Some(member) => member,
            None => {
                let session = ctx.session();
                let addressed = self.pending.iter().find(|p| {
                    p.queue == args.queue
                        && p.id == args.id
                        && self
                            .members
                            .get(&p.member)
                            .map_or(false, |m| m.alive && m.session == session)
                });
                match addressed {
                    Some(p) => p.member.clone(),
                    None => return Ok(false),
                }
            }
        };
        Ok(self.resolve(ctx, member, args.queue, args.id, args.succeeded, args.message))
    }

    fn ack(&mut self, ctx: &mut Context<'_, ()>, args: AckArgs) -> Result<bool> {
        let producer = self
            .pending
            .iter()
            .find(|p| p.matches(&args.member, &args.queue, args.id))
            .map(|p| p.producer);
        if producer != Some(args.producer) {
            return Ok(false);
        }
        Ok(self.resolve(ctx, args.member, args.queue, args.id, args.succeeded, args.message))
    }

    fn members(&self, _clock: Clock, _: NoArgs) -> Result<Vec<GroupMemberInfo>> {
        Ok(self.status().members)
    }

    fn current_status(&self, _clock: Clock, _: NoArgs) -> Result<GroupStatus> {
        Ok(self.status())
    }
}

impl ResourceState for GroupState {
    type Timer = ();
    type Facade = DistributedGroup;

    const TYPE_ID: i32 = 8;
    const TYPE_NAME: &'static str = "group";

    fn create(_config: &Value) -> Result<Self> {
        Ok(Self::default())
    }

    fn operations() -> Operations<Self> {
        Operations::new()
            .command(
                OperationDescriptor::command(ops::JOIN, "join")
                    .verbs(&[HttpVerb::Post, HttpVerb::Put])
                    .opt("member", ParamType::String)
                    .opt("persist", ParamType::Boolean)
                    .opt("metadata", ParamType::Json),
                Self::join,
            )
            .command(
                OperationDescriptor::command(ops::LEAVE, "leave")
                    .verbs(&[HttpVerb::Post, HttpVerb::Delete])
                    .arg("member", ParamType::String)
                    .compaction(CompactionMode::Sequential),
                Self::leave,
            )
            .command(OperationDescriptor::command(ops::LISTEN, "listen"), Self::listen)
            .command(
                OperationDescriptor::command(ops::MESSAGE, "message")
                    .opt("member", ParamType::String)
                    .opt("producer", ParamType::Integer)
                    .opt("queue", ParamType::String)
                    .arg("id", ParamType::Integer)
                    .opt("message", ParamType::Json)
                    .opt("delivery", ParamType::String)
                    .opt("execution", ParamType::String),
                Self::message,
            )
            .command(
                OperationDescriptor::command(ops::REPLY, "reply")
                    .opt("member", ParamType::String)
                    .opt("queue", ParamType::String)
                    .arg("id", ParamType::Integer)
                    .opt("succeeded", ParamType::Boolean)
                    .opt("message", ParamType::Json),
                Self::reply,
            )
            .command(
                OperationDescriptor::command(ops::ACK, "ack")
                    .arg("member", ParamType::String)
                    .arg("producer", ParamType::Integer)
                    .opt("queue", ParamType::String)
                    .arg("id", ParamType::Integer)
                    .opt("succeeded", ParamType::Boolean)
                    .opt("message", ParamType::Json),
                Self::ack,
            )
            .query(OperationDescriptor::query(ops::MEMBERS, "members"), Self::members)
            .query(
                OperationDescriptor::query(ops::STATUS, "status"),
                Self::current_status,
            )
    }

    fn on_session_lost(&mut self, ctx: &mut Context<'_, ()>, session: SessionId) {
        self.listeners.unregister(session);
        // Nobody is left to receive these acknowledgements.
        self.pending.retain(|p| p.session != session);

        let owned: Vec<(String, bool)> = self
            .members
            .values()
            .filter(|m| m.alive && m.session == session)
            .map(|m| (m.info.id.clone(), m.info.persistent))
            .collect();
        if owned.is_empty() {
            return;
        }
        for (id, persistent) in owned {
            if persistent {
                if let Some(m) = self.members.get_mut(&id) {
                    m.alive = false;
                }
            } else {
                self.members.remove(&id);
            }
            self.member_lost(ctx, &id);
        }
        self.elect(ctx);
    }
}

/// Typed client facade for a group resource.
#[derive(Clone)]
pub struct DistributedGroup {
    handle: ResourceHandle,
}

impl DistributedGroup {
    pub async fn create(invoker: Arc<dyn Invoker>, name: &str) -> Result<Self> {
        let handle =
            ResourceHandle::create(invoker, name, GroupState::TYPE_NAME, Value::Null).await?;
        Ok(Self { handle })
    }

    pub fn attach(invoker: Arc<dyn Invoker>, id: ResourceId) -> Self {
        Self {
            handle: ResourceHandle::attach(invoker, id),
        }
    }

    pub fn id(&self) -> ResourceId {
        self.handle.id()
    }

    pub async fn join(
        &self,
        member: Option<&str>,
        persist: bool,
        metadata: Value,
    ) -> Result<GroupMemberInfo> {
        self.handle
            .command(
                ops::JOIN,
                JoinArgs {
                    member: member.map(str::to_string),
                    persist,
                    metadata,
                },
            )
            .await
    }

    pub async fn leave(&self, member: &str) -> Result<bool> {
        self.handle
            .command(
                ops::LEAVE,
                LeaveArgs {
                    member: member.to_string(),
                },
            )
            .await
    }

    /// Subscribe to membership events. Returns the current view and the
    /// event index to wait from.
    pub async fn listen(&self) -> Result<(GroupStatus, u64)> {
        let resp = self.handle.command_raw(ops::LISTEN, json!({})).await?;
        Ok((decode(resp.result)?, resp.event_index))
    }

    pub async fn members(&self) -> Result<Vec<GroupMemberInfo>> {
        self.handle.query(ops::MEMBERS, json!({})).await
    }

    pub async fn status(&self) -> Result<GroupStatus> {
        self.handle.query(ops::STATUS, json!({})).await
    }

    /// Send a message and return the event index acknowledgements follow.
    pub async fn send(&self, args: MessageArgs) -> Result<u64> {
        let resp = self.handle.command_raw(ops::MESSAGE, args).await?;
        Ok(resp.event_index)
    }

    pub async fn reply(&self, args: ReplyArgs) -> Result<bool> {
        self.handle.command(ops::REPLY, args).await
    }

    pub async fn ack(&self, args: AckArgs) -> Result<bool> {
        self.handle.command(ops::ACK, args).await
    }

    /// Wait for the next `message` delivered to this session.
    pub async fn next_message(
        &self,
        after: u64,
        wait: Option<Duration>,
    ) -> Result<Option<(u64, GroupMessage)>> {
        self.next(MESSAGE_EVENT, after, wait).await
    }

    /// Wait for the acknowledgement of message `id` on `queue`.
    pub async fn next_ack(
        &self,
        queue: &str,
        id: u64,
        after: u64,
        wait: Option<Duration>,
    ) -> Result<Option<(u64, GroupAck)>> {
        let resource = self.handle.id();
        let filter = move |e: &SessionEvent| {
            e.resource == resource
                && e.name == ACK_EVENT
                && e.payload.get("queue").and_then(Value::as_str) == Some(queue)
                && e.payload.get("id").and_then(Value::as_u64) == Some(id)
        };
        match self.handle.invoker().wait_event(after, wait, &filter).await? {
            Some(e) => Ok(Some((e.index, decode(e.payload)?))),
            None => Ok(None),
        }
    }

    async fn next<T: serde::de::DeserializeOwned>(
        &self,
        event: &str,
        after: u64,
        wait: Option<Duration>,
    ) -> Result<Option<(u64, T)>> {
        match self.handle.wait_event(event, after, wait).await? {
            Some(e) => Ok(Some((e.index, decode(e.payload)?))),
            None => Ok(None),
        }
    }
}

impl ResourceFacade for DistributedGroup {
    fn attach(invoker: Arc<dyn Invoker>, id: ResourceId) -> Self {
        DistributedGroup::attach(invoker, id)
    }
}
