use std::net::SocketAddr;
use std::sync::Arc;
use bytes::Bytes;
use rustc_hash::FxHashMap;
use tracing::{debug, info};
use crate::communicator::Communicator;
use crate::config::Pt2PtConfig;
use crate::context::ProgressContext;
use crate::descriptor::datatype::Datatype;
use crate::descriptor::pool::{DescriptorPool, SlotGuard};
use crate::descriptor::recv::{RecvDescriptor, SourceMatch, TagMatch};
use crate::descriptor::send::{QueueMembership, SendDescriptor, SendMode};
use crate::descriptor::{Completion, Request, RequestStatus, Status};
use crate::error::{ErrorCode, Pt2PtResult};
use crate::path::udp::UdpPath;
use crate::path::{Path, PathId};
use crate::progress::{push_frags_into_network, Progress};
use crate::{ContextId, Rank, Tag};

/// The application-facing side: starting, completing and releasing point-to-point requests.
///
/// Nothing here waits for a peer except `wait`, which spins on `test`. All protocol work
///  happens in progress calls, which `test`, `wait` and `iprobe` make implicitly.
pub struct Pt2PtEngine {
    ctx: ProgressContext,
    progress: Progress,
}

impl Pt2PtEngine {
    pub fn new(config: Pt2PtConfig, self_rank: Rank) -> anyhow::Result<Pt2PtEngine> {
        config.validate()?;
        info!("initializing point-to-point engine for rank {}", self_rank);

        Ok(Pt2PtEngine {
            ctx: ProgressContext::new(Arc::new(config), self_rank),
            progress: Progress::default(),
        })
    }

    pub fn self_rank(&self) -> Rank {
        self.ctx.self_rank
    }

    pub fn context(&self) -> &ProgressContext {
        &self.ctx
    }

    pub fn register_path(&self, path: Arc<dyn Path>) -> anyhow::Result<()> {
        self.ctx.paths.register(path)
    }

    /// Binds a UDP socket to this process's address in `peers`, and registers it as a path
    pub async fn bind_udp(&self, id: PathId, peers: FxHashMap<Rank, SocketAddr>) -> anyhow::Result<()> {
        let path = UdpPath::bind(id, self.ctx.self_rank, &self.ctx.config, peers).await?;
        self.register_path(Arc::new(path))
    }

    /// `group` maps ranks in the communicator to global ranks, and must contain this process
    pub fn add_communicator(&self, context_id: ContextId, group: Vec<Rank>) -> anyhow::Result<()> {
        let communicator = Communicator::new(context_id, self.ctx.self_rank, group)?;
        self.ctx.add_communicator(communicator)?;
        Ok(())
    }

    pub async fn isend_start(&self, context_id: ContextId, dest: u32, tag: Tag, data: &[u8], datatype: &Datatype, mode: SendMode) -> Pt2PtResult<Request> {
        self.create_send(context_id, dest, tag, data, datatype, mode, false).await
    }

    /// Creates an inactive persistent send, see `start`. The data is captured here, and every
    ///  activation sends it again.
    pub async fn send_init(&self, context_id: ContextId, dest: u32, tag: Tag, data: &[u8], datatype: &Datatype, mode: SendMode) -> Pt2PtResult<Request> {
        self.create_send(context_id, dest, tag, data, datatype, mode, true).await
    }

    /// Posts a receive into `buffer`. The buffer is handed back with the completion.
    pub async fn irecv_post(&self, context_id: ContextId, source: SourceMatch, tag: TagMatch, buffer: Vec<u8>, datatype: Datatype) -> Pt2PtResult<Request> {
        self.create_recv(context_id, source, tag, buffer, datatype, false).await
    }

    pub async fn recv_init(&self, context_id: ContextId, source: SourceMatch, tag: TagMatch, buffer: Vec<u8>, datatype: Datatype) -> Pt2PtResult<Request> {
        self.create_recv(context_id, source, tag, buffer, datatype, true).await
    }

    /// Activates an inactive persistent request
    pub async fn start(&self, request: Request) -> Pt2PtResult<()> {
        match request {
            Request::Send(handle) => {
                let slot = self.ctx.send_pool.lock(handle).await?;
                if !slot.desc.base.persistent || slot.desc.base.status != RequestStatus::Inactive {
                    return Err(ErrorCode::BadParam);
                }
                let communicator = self.communicator(slot.desc.base.context_id)?;
                self.activate_send(slot, &communicator).await
            }
            Request::Recv(handle) => {
                let communicator = {
                    let mut slot = self.ctx.recv_pool.lock(handle).await?;
                    if !slot.desc.base.persistent || slot.desc.base.status != RequestStatus::Inactive {
                        return Err(ErrorCode::BadParam);
                    }
                    slot.desc.reset_reception();
                    slot.desc.base.reactivate();
                    self.communicator(slot.desc.base.context_id)?
                };
                communicator.post_receive(handle, &self.ctx).await
            }
        }
    }

    /// Makes one progress call and checks whether the request is complete. Consuming the
    ///  completion of a non-persistent request releases it, i.e. its handle becomes invalid.
    pub async fn test(&self, request: Request) -> Pt2PtResult<Option<Completion>> {
        self.progress().await?;

        match request {
            Request::Send(handle) => {
                let mut slot = self.ctx.send_pool.lock(handle).await?;
                if slot.desc.base.free_called {
                    return Err(ErrorCode::BadParam);
                }
                if slot.desc.base.status == RequestStatus::Inactive {
                    return Ok(Some(Completion { status: Status::empty(), data: None }));
                }
                if !slot.desc.base.message_done {
                    return Ok(None);
                }

                let status = slot.desc.status();
                if slot.desc.base.persistent {
                    slot.desc.base.status = RequestStatus::Inactive;
                }
                else if slot.desc.send_done() || slot.desc.error.is_some() {
                    self.ctx.send_pool.release(&mut slot);
                }
                else {
                    // acks are still outstanding, the descriptor goes when they are in
                    slot.desc.base.free_called = true;
                    self.ctx.send_pool.mark_pending_free(&mut slot);
                }
                Ok(Some(Completion { status, data: None }))
            }
            Request::Recv(handle) => {
                let mut slot = self.ctx.recv_pool.lock(handle).await?;
                if slot.desc.base.free_called {
                    return Err(ErrorCode::BadParam);
                }
                if slot.desc.base.status == RequestStatus::Inactive {
                    return Ok(Some(Completion { status: Status::empty(), data: None }));
                }
                if !slot.desc.base.message_done {
                    return Ok(None);
                }

                let status = slot.desc.status();
                let data = if slot.desc.base.persistent {
                    slot.desc.base.status = RequestStatus::Inactive;
                    slot.desc.buffer.clone()
                }
                else {
                    let data = std::mem::take(&mut slot.desc.buffer);
                    self.ctx.recv_pool.release(&mut slot);
                    data
                };
                Ok(Some(Completion { status, data: Some(data) }))
            }
        }
    }

    pub async fn wait(&self, request: Request) -> Pt2PtResult<Completion> {
        loop {
            if let Some(completion) = self.test(request).await? {
                return Ok(completion);
            }
            tokio::task::yield_now().await;
        }
    }

    /// Releases a request. A request that is still in flight is released when it completes, but
    ///  its handle is unusable right away.
    pub async fn request_free(&self, request: Request) -> Pt2PtResult<()> {
        match request {
            Request::Send(handle) => {
                let mut slot = self.ctx.send_pool.lock(handle).await?;
                if slot.desc.base.free_called {
                    return Err(ErrorCode::BadParam);
                }
                let desc = &slot.desc;
                let finished = desc.base.message_done && (desc.send_done() || desc.error.is_some());
                if desc.base.status == RequestStatus::Inactive || finished {
                    self.ctx.send_pool.release(&mut slot);
                }
                else {
                    debug!("send {:?} freed while in flight", handle);
                    slot.desc.base.free_called = true;
                    self.ctx.send_pool.mark_pending_free(&mut slot);
                }
            }
            Request::Recv(handle) => {
                let mut slot = self.ctx.recv_pool.lock(handle).await?;
                if slot.desc.base.free_called {
                    return Err(ErrorCode::BadParam);
                }
                if slot.desc.base.status == RequestStatus::Inactive || slot.desc.base.message_done {
                    self.ctx.recv_pool.release(&mut slot);
                }
                else {
                    debug!("receive {:?} freed while in flight", handle);
                    slot.desc.base.free_called = true;
                    self.ctx.recv_pool.mark_pending_free(&mut slot);
                }
            }
        }
        Ok(())
    }

    /// Checks for a message that a receive with this source and tag would match, without
    ///  receiving it
    pub async fn iprobe(&self, context_id: ContextId, source: SourceMatch, tag: TagMatch) -> Pt2PtResult<Option<Status>> {
        let communicator = self.communicator(context_id)?;
        Self::check_source(&communicator, source)?;

        self.progress().await?;
        Ok(communicator.probe(source, tag).await)
    }

    pub async fn progress(&self) -> Pt2PtResult<()> {
        self.progress.step(&self.ctx).await
    }

    fn communicator(&self, context_id: ContextId) -> Pt2PtResult<Arc<Communicator>> {
        self.ctx.communicator(context_id)
            .ok_or(ErrorCode::BadParam)
    }

    fn check_source(communicator: &Communicator, source: SourceMatch) -> Pt2PtResult<()> {
        match source {
            SourceMatch::Rank(r) if r >= communicator.size() => Err(ErrorCode::BadParam),
            _ => Ok(()),
        }
    }

    /// Takes a descriptor from a pool. If the pool is exhausted only because released requests
    ///  are still in flight, one progress call may bring some of them home.
    async fn acquire<'a, T: Default>(&self, pool: &'a DescriptorPool<T>) -> Pt2PtResult<SlotGuard<'a, T>> {
        match pool.acquire().await {
            Err(ErrorCode::TempOutOfResource) => {
                self.progress().await?;
                pool.acquire().await
            }
            result => result,
        }
    }

    #[allow(clippy::too_many_arguments)]
    async fn create_send(&self, context_id: ContextId, dest: u32, tag: Tag, data: &[u8], datatype: &Datatype, mode: SendMode, persistent: bool) -> Pt2PtResult<Request> {
        let communicator = self.communicator(context_id)?;
        let dest_global = communicator.global_of(dest)?;
        let payload = datatype.pack(data)?;

        let mut slot = self.acquire(&self.ctx.send_pool).await?;
        let handle = slot.handle();

        let desc = &mut slot.desc;
        desc.base.context_id = context_id;
        desc.base.datatype = datatype.clone();
        desc.base.persistent = persistent;
        desc.dest = dest_global;
        desc.dest_local = dest;
        desc.tag = tag;
        desc.mode = mode;
        desc.payload = Bytes::from(payload);
        desc.base.status = RequestStatus::Inited;
        self.ctx.send_pool.attach(&mut slot);

        if persistent {
            slot.desc.base.status = RequestStatus::Inactive;
        }
        else {
            self.activate_send(slot, &communicator).await?;
        }
        Ok(Request::Send(handle))
    }

    async fn activate_send(&self, mut slot: SlotGuard<'_, SendDescriptor>, communicator: &Communicator) -> Pt2PtResult<()> {
        let handle = slot.handle();
        slot.desc.reset_transmission();

        if let Err(e) = self.ctx.paths.bind_message(&mut slot.desc) {
            if slot.desc.base.persistent {
                slot.desc.base.status = RequestStatus::Inactive;
            }
            else {
                self.ctx.send_pool.release(&mut slot);
            }
            return Err(e);
        }

        slot.desc.base.reactivate();
        // assigned only once the message is sure to go out: receivers match strictly in order
        slot.desc.isend_seq = communicator.next_isend_seq(slot.desc.dest_local).await;
        self.ctx.queues.move_to(handle, &mut slot.desc, QueueMembership::Incomplete);
        debug!("started send {:?}: message #{} to {}, {} bytes", handle, slot.desc.isend_seq, slot.desc.dest, slot.desc.len());
        drop(slot);

        if let Err(e) = push_frags_into_network(handle, &self.ctx).await {
            // the request completes with the error
            debug!("send {:?} failed right away: {}", handle, e);
        }
        Ok(())
    }

    async fn create_recv(&self, context_id: ContextId, source: SourceMatch, tag: TagMatch, buffer: Vec<u8>, datatype: Datatype, persistent: bool) -> Pt2PtResult<Request> {
        let communicator = self.communicator(context_id)?;
        Self::check_source(&communicator, source)?;
        datatype.check_fits(buffer.len())?;
        let posted_len = datatype.packed_len(buffer.len())?;

        let mut slot = self.acquire(&self.ctx.recv_pool).await?;
        let handle = slot.handle();

        slot.desc = RecvDescriptor {
            source,
            tag,
            posted_len: posted_len as u64,
            buffer,
            ..Default::default()
        };
        slot.desc.base.context_id = context_id;
        slot.desc.base.datatype = datatype;
        slot.desc.base.persistent = persistent;
        slot.desc.base.status = RequestStatus::Inited;
        self.ctx.recv_pool.attach(&mut slot);

        if persistent {
            slot.desc.base.status = RequestStatus::Inactive;
            return Ok(Request::Recv(handle));
        }

        slot.desc.base.reactivate();
        drop(slot);
        communicator.post_receive(handle, &self.ctx).await?;
        Ok(Request::Recv(handle))
    }
}
