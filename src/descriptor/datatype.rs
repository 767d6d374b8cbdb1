use crate::error::{ErrorCode, Pt2PtResult};

/// Memory layout of the user buffer of a send or receive.
///
/// Data travels on the wire as a 'packed' byte stream. For a contiguous layout, that stream is
///  the user buffer itself; a typemap describes which parts of the user buffer make up the
///  stream, and in which order.
#[derive(Debug, Clone, Eq, PartialEq, Default)]
pub enum Datatype {
    #[default]
    Contiguous,
    Typemap(Typemap),
}

/// `count` repetitions of a list of blocks, the n-th repetition shifted by `n * extent` bytes
#[derive(Debug, Clone, Eq, PartialEq)]
pub struct Typemap {
    pub blocks: Vec<Block>,
    pub extent: usize,
    pub count: usize,
}

#[derive(Debug, Copy, Clone, Eq, PartialEq)]
pub struct Block {
    pub offset: usize,
    pub len: usize,
}

impl Datatype {
    /// Number of packed bytes that a user buffer of `buf_len` bytes holds with this layout
    pub fn packed_len(&self, buf_len: usize) -> Pt2PtResult<usize> {
        match self {
            Datatype::Contiguous => Ok(buf_len),
            Datatype::Typemap(typemap) => typemap.packed_len().ok_or(ErrorCode::BadParam),
        }
    }

    /// Ensures that the layout does not reach beyond the end of a user buffer
    pub fn check_fits(&self, buf_len: usize) -> Pt2PtResult<()> {
        match self {
            Datatype::Contiguous => Ok(()),
            Datatype::Typemap(typemap) => typemap.check_fits(buf_len),
        }
    }

    pub fn pack(&self, buf: &[u8]) -> Pt2PtResult<Vec<u8>> {
        self.check_fits(buf.len())?;
        match self {
            Datatype::Contiguous => Ok(buf.to_vec()),
            Datatype::Typemap(typemap) => {
                let mut result = Vec::with_capacity(self.packed_len(buf.len())?);
                for (offset, len) in typemap.segments() {
                    result.extend_from_slice(&buf[offset..offset + len]);
                }
                Ok(result)
            }
        }
    }

    /// Scatters a slice of the packed stream, starting at `packed_offset`, into the user buffer.
    ///  The caller is responsible for passing only data that fits into the packed length.
    pub fn unpack_into(&self, buf: &mut [u8], packed_offset: usize, data: &[u8]) {
        match self {
            Datatype::Contiguous => {
                buf[packed_offset..packed_offset + data.len()].copy_from_slice(data);
            }
            Datatype::Typemap(typemap) => {
                let mut stream_pos = 0;
                let mut remaining = data;
                for (offset, len) in typemap.segments() {
                    if remaining.is_empty() {
                        break;
                    }
                    let segment_end = stream_pos + len;
                    if segment_end > packed_offset {
                        let skip = packed_offset.saturating_sub(stream_pos);
                        let n = (len - skip).min(remaining.len());
                        buf[offset + skip..offset + skip + n].copy_from_slice(&remaining[..n]);
                        remaining = &remaining[n..];
                    }
                    stream_pos = segment_end;
                }
            }
        }
    }
}

impl Typemap {
    /// `None` if the packed length does not fit into a `usize`
    pub fn packed_len(&self) -> Option<usize> {
        self.blocks.iter()
            .try_fold(0usize, |sum, b| sum.checked_add(b.len))
            .and_then(|per_repetition| per_repetition.checked_mul(self.count))
    }

    /// Every block of the last repetition must end within the buffer, computed without
    ///  overflow. That bounds all other segment arithmetic as well.
    fn check_fits(&self, buf_len: usize) -> Pt2PtResult<()> {
        if self.packed_len().is_none() {
            return Err(ErrorCode::BadParam);
        }
        let Some(last) = self.count.checked_sub(1) else {
            return Ok(());
        };
        let last_start = last.checked_mul(self.extent);

        let fits = self.blocks.iter()
            .filter(|b| b.len > 0)
            .all(|b| last_start
                .and_then(|start| start.checked_add(b.offset))
                .and_then(|offset| offset.checked_add(b.len))
                .is_some_and(|end| end <= buf_len));
        if !fits {
            return Err(ErrorCode::BadParam);
        }
        Ok(())
    }

    /// (offset, len) of every block in packing order
    fn segments(&self) -> impl Iterator<Item = (usize, usize)> + '_ {
        (0..self.count).flat_map(move |n| {
            self.blocks.iter()
                .filter(|b| b.len > 0)
                .map(move |b| (n * self.extent + b.offset, b.len))
        })
    }
}
