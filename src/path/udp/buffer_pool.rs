use std::sync::Mutex;
use bytes::BytesMut;
use tracing::{debug, trace};

/// Reusable buffers for assembling outgoing datagrams
pub struct DatagramBufferPool {
    buf_size: usize,
    buffers: Mutex<Vec<BytesMut>>,
}

impl DatagramBufferPool {
    pub fn new(buf_size: usize, max_pool_size: usize) -> Self {
        DatagramBufferPool {
            buf_size,
            buffers: Mutex::new(Vec::with_capacity(max_pool_size)),
        }
    }

    pub fn get_from_pool(&self) -> BytesMut {
        {
            let mut buffers = self.buffers.lock().unwrap();
            if let Some(buffer) = buffers.pop() {
                trace!("returning buffer from pool");
                return buffer;
            }
        }

        debug!("no buffer in pool: creating new buffer");
        BytesMut::with_capacity(self.buf_size)
    }

    pub fn return_to_pool(&self, mut buffer: BytesMut) {
        if buffer.capacity() < self.buf_size {
            debug!("returned buffer shrank to {} bytes: discarding it", buffer.capacity());
            return;
        }

        buffer.clear();

        let mut buffers = self.buffers.lock().unwrap();
        if buffers.capacity() > buffers.len() {
            trace!("returning buffer to pool");
            buffers.push(buffer);
        }
        else {
            debug!("pool is full: discarding returned buffer");
        }
    }

    #[cfg(test)]
    pub fn num_pooled(&self) -> usize {
        self.buffers.lock().unwrap().len()
    }
}

#[cfg(test)]
mod tests {
    use bytes::BufMut;
    use super::*;

    #[test]
    fn test_clear() {
        let pool = DatagramBufferPool::new(10, 10);

        let mut buf = pool.get_from_pool();
        buf.put_u8(1);
        buf.put_u8(2);
        pool.return_to_pool(buf);

        let buf = pool.get_from_pool();
        assert!(buf.is_empty());
        assert!(buf.capacity() >= 10);
    }

    #[test]
    fn test_pool_size_is_bounded() {
        let pool = DatagramBufferPool::new(10, 2);
        for _ in 0..3 {
            pool.return_to_pool(BytesMut::with_capacity(10));
        }
        assert_eq!(pool.num_pooled(), 2);
    }

    #[test]
    fn test_shrunk_buffer_is_discarded() {
        let pool = DatagramBufferPool::new(10, 2);
        pool.return_to_pool(BytesMut::with_capacity(4));
        assert_eq!(pool.num_pooled(), 0);
    }
}
