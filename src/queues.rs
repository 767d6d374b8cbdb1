use std::collections::VecDeque;
use std::sync::Mutex;
use tracing::trace;
use crate::descriptor::pool::DescriptorHandle;
use crate::descriptor::send::{QueueMembership, SendDescriptor};

/// The two lists of send descriptors that progress works on: messages with fragments waiting
///  to be sent, and messages that are fully sent but not fully acknowledged.
///
/// Each list has its own lock which is held only for the splice itself. A descriptor's queue
///  membership is changed only by a caller holding that descriptor's lock, which keeps the
///  descriptor's `queue` field and the lists consistent.
#[derive(Default)]
pub struct SendQueues {
    incomplete: Mutex<VecDeque<DescriptorHandle>>,
    unacked: Mutex<VecDeque<DescriptorHandle>>,
}

impl SendQueues {
    pub fn move_to(&self, handle: DescriptorHandle, desc: &mut SendDescriptor, target: QueueMembership) {
        if desc.queue == target {
            return;
        }
        trace!("moving send descriptor {:?} from {:?} to {:?}", handle, desc.queue, target);

        if let Some(list) = self.list(desc.queue) {
            list.lock().unwrap()
                .retain(|h| *h != handle);
        }
        if let Some(list) = self.list(target) {
            list.lock().unwrap()
                .push_back(handle);
        }
        desc.queue = target;
    }

    /// takes a descriptor off whatever queue it is on
    pub fn remove(&self, handle: DescriptorHandle, desc: &mut SendDescriptor) {
        self.move_to(handle, desc, QueueMembership::Building);
    }

    pub fn incomplete_snapshot(&self) -> Vec<DescriptorHandle> {
        self.incomplete.lock().unwrap().iter().copied().collect()
    }

    pub fn unacked_snapshot(&self) -> Vec<DescriptorHandle> {
        self.unacked.lock().unwrap().iter().copied().collect()
    }

    pub fn num_incomplete(&self) -> usize {
        self.incomplete.lock().unwrap().len()
    }

    pub fn num_unacked(&self) -> usize {
        self.unacked.lock().unwrap().len()
    }

    fn list(&self, queue: QueueMembership) -> Option<&Mutex<VecDeque<DescriptorHandle>>> {
        match queue {
            QueueMembership::Building => None,
            QueueMembership::Incomplete => Some(&self.incomplete),
            QueueMembership::Unacked => Some(&self.unacked),
        }
    }
}
