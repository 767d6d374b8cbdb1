//! Point-to-point message transmission between the processes of a parallel job.
//!
//! Messages are split into fragments and moved by one of several registered paths (UDP being
//!  the built-in one). Every fragment is acknowledged by the receiver and retransmitted with
//!  exponential backoff until it is; a path that keeps losing fragments is abandoned and the
//!  message fails over to the next path. Messages from one sender match receives in the order
//!  they were sent.
//!
//! A fragment is acknowledged as soon as the receiver takes responsibility for it, i.e. when it
//!  is copied into a matched receive or buffered as unexpected. Fragments of synchronous sends
//!  are not acknowledged before their message matched a receive.

pub mod config;
pub mod error;
pub mod safe_converter;
pub mod frag_seq;
pub mod seq_tracking_list;
pub mod reliability;
pub mod descriptor;
pub mod queues;
pub mod path;
pub mod context;
pub mod communicator;
pub mod progress;
pub mod engine;

#[cfg(test)] mod test_util;

/// a process's global rank in the job
pub type Rank = u32;
pub type ContextId = u32;
pub type Tag = i32;


#[cfg(test)]
mod test {
    use tracing::Level;

    #[ctor::ctor]
    fn init_test_logging() {
        tracing_subscriber::fmt()
            .with_test_writer()
            .with_max_level(Level::TRACE)
            .try_init()
            .ok();
    }
}
