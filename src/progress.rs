use std::sync::Mutex;
use tokio::time::Instant;
use tracing::{debug, error, trace};
use crate::context::ProgressContext;
use crate::descriptor::pool::{DescriptorHandle, Slot};
use crate::descriptor::send::{QueueMembership, SendDescriptor};
use crate::error::{ErrorCode, Pt2PtResult};

/// Drives all paths: drains incoming traffic, pushes pending fragments and retransmits
///  overdue ones.
///
/// Progress steps are serialized, so there is a single effective progress thread even if
///  several tasks call `step` concurrently.
#[derive(Default)]
pub struct Progress {
    serializer: tokio::sync::Mutex<()>,
    last_retransmit_scan: Mutex<Option<Instant>>,
}

impl Progress {
    pub async fn step(&self, ctx: &ProgressContext) -> Pt2PtResult<()> {
        let _serialized = self.serializer.lock().await;
        let mut first_fatal = None;

        for path in ctx.paths.active_paths() {
            if let Err(e) = path.receive(ctx.config.receive_timeout, ctx).await {
                debug!("{}: receive failed: {}", path.id(), e);
                if e.is_fatal() {
                    first_fatal.get_or_insert(e);
                }
            }
        }

        for handle in ctx.queues.incomplete_snapshot() {
            if let Err(e) = push_frags_into_network(handle, ctx).await {
                first_fatal.get_or_insert(e);
            }
        }

        let now = Instant::now();
        if self.retransmit_scan_due(ctx, now) {
            // messages waiting for the ack of their first fragment are on the incomplete queue
            for handle in ctx.queues.unacked_snapshot().into_iter().chain(ctx.queues.incomplete_snapshot()) {
                if let Err(e) = check_retransmit(handle, ctx, now).await {
                    first_fatal.get_or_insert(e);
                }
            }
        }

        match first_fatal {
            Some(e) => Err(e),
            None => Ok(()),
        }
    }

    fn retransmit_scan_due(&self, ctx: &ProgressContext, now: Instant) -> bool {
        let mut last = self.last_retransmit_scan.lock().unwrap();
        match *last {
            Some(t) if now.duration_since(t) < ctx.config.reliability.min_retransmit_scan_interval => false,
            _ => {
                *last = Some(now);
                true
            }
        }
    }
}

/// Sends as many of a message's pending fragments as its path's flow control allows, failing
///  over to a different path if the current one breaks. Returns `Err` only for fatal errors.
pub async fn push_frags_into_network(handle: DescriptorHandle, ctx: &ProgressContext) -> Pt2PtResult<()> {
    let Ok(mut slot) = ctx.send_pool.lock(handle).await else {
        trace!("send descriptor {:?} was released meanwhile", handle);
        return Ok(());
    };
    if slot.desc.queue != QueueMembership::Incomplete {
        return Ok(());
    }

    loop {
        let path = match slot.desc.path.and_then(|id| ctx.paths.get(id)) {
            Some(path) => path,
            None => match ctx.paths.bind_message(&mut slot.desc) {
                Ok(path) => path,
                Err(e) => return fail_send(&mut slot, e, ctx),
            },
        };

        match path.send(handle, &mut slot.desc, ctx).await {
            Ok(progress) => {
                let desc = &mut slot.desc;
                if !desc.is_synchronous() && !desc.base.persistent && !desc.base.message_done && desc.num_sent >= desc.num_frags {
                    // the data is safe in the descriptor, so a standard send is done from the
                    //  application's point of view
                    desc.base.mark_done();
                }

                if path.send_done(&slot.desc) {
                    ctx.complete_send(&mut slot);
                }
                else if !progress.incomplete {
                    ctx.queues.move_to(handle, &mut slot.desc, QueueMembership::Unacked);
                }
                return Ok(());
            }
            Err(ErrorCode::BadPath) => {
                if let Err(e) = ctx.paths.failover(&mut slot.desc) {
                    return fail_send(&mut slot, e, ctx);
                }
            }
            Err(e) => return fail_send(&mut slot, e, ctx),
        }
    }
}

async fn check_retransmit(handle: DescriptorHandle, ctx: &ProgressContext, now: Instant) -> Pt2PtResult<()> {
    let Ok(mut slot) = ctx.send_pool.lock(handle).await else {
        return Ok(());
    };
    if ctx.apply_peer_in_order(&mut slot) {
        return Ok(());
    }
    let Some(path) = slot.desc.path.and_then(|id| ctx.paths.get(id)) else {
        return Ok(());
    };
    if !path.retransmit_p(&slot.desc, now) {
        return Ok(());
    }

    match path.resend(&mut slot.desc, now) {
        Ok(true) => {
            ctx.queues.move_to(handle, &mut slot.desc, QueueMembership::Incomplete);
            Ok(())
        }
        Ok(false) => Ok(()),
        Err(ErrorCode::BadPath) => match ctx.paths.failover(&mut slot.desc) {
            Ok(_) => {
                ctx.queues.move_to(handle, &mut slot.desc, QueueMembership::Incomplete);
                Ok(())
            }
            Err(e) => fail_send(&mut slot, e, ctx),
        },
        Err(e) => fail_send(&mut slot, e, ctx),
    }
}

/// Gives up on a message: it is taken off the queues and completes with the error
fn fail_send(slot: &mut Slot<SendDescriptor>, error: ErrorCode, ctx: &ProgressContext) -> Pt2PtResult<()> {
    error!("send {:?} to {} failed: {}", slot.handle(), slot.desc.dest, error);
    slot.desc.error = Some(error);
    ctx.queues.remove(slot.handle(), &mut slot.desc);
    slot.desc.base.mark_done();
    if slot.desc.base.free_called {
        ctx.send_pool.release(slot);
    }
    Err(error)
}
