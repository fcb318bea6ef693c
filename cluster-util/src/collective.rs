use crate::endpoint::Endpoint;
use crate::frame::{Frame, FrameKind};
use std::io;

/// Collective operations over the whole process group.
///
/// Every rank must call the same collectives in the same order.
/// Reductions combine contributions in rank order, so every rank ends
/// up with an identical result.
pub trait ClusterSync {
    fn rank(&self) -> usize;

    fn size(&self) -> usize;

    /// Each rank contributes `data`; returns all contributions by rank
    fn all_gather(&self, data: &[u8]) -> io::Result<Vec<Vec<u8>>>;

    /// Returns once every rank has entered the barrier
    fn barrier(&self) -> io::Result<()> {
        self.all_gather(&[]).map(|_| ())
    }

    /// Elementwise sum of `data` across ranks, in place
    fn all_reduce_sum(&self, data: &mut [u64]) -> io::Result<()> {
        let gathered = self.all_gather(bytemuck::cast_slice::<u64, u8>(&*data))?;
        data.fill(0);
        for (r, bytes) in gathered.iter().enumerate() {
            let theirs = decode_u64s(bytes)?;
            if theirs.len() != data.len() {
                return Err(io::Error::new(
                    io::ErrorKind::InvalidData,
                    format!(
                        "rank {} reduced {} values, expected {}",
                        r,
                        theirs.len(),
                        data.len()
                    ),
                ));
            }
            for (x, y) in data.iter_mut().zip(theirs) {
                *x += y;
            }
        }
        Ok(())
    }

    /// Maximum of `value` across ranks
    fn all_reduce_max(&self, value: u64) -> io::Result<u64> {
        let gathered = self.all_gather(&value.to_ne_bytes())?;
        let mut ret = 0;
        for bytes in gathered {
            ret = decode_u64s(&bytes)?.into_iter().fold(ret, u64::max);
        }
        Ok(ret)
    }
}

/// Decode native-endian `u64`s from a possibly unaligned byte buffer
pub fn decode_u64s(bytes: &[u8]) -> io::Result<Vec<u64>> {
    if bytes.len() % 8 != 0 {
        return Err(io::Error::new(
            io::ErrorKind::InvalidData,
            format!("{} bytes is not a whole number of u64", bytes.len()),
        ));
    }
    Ok(bytes
        .chunks_exact(8)
        .map(|c| u64::from_ne_bytes([c[0], c[1], c[2], c[3], c[4], c[5], c[6], c[7]]))
        .collect())
}

impl ClusterSync for Endpoint {
    fn rank(&self) -> usize {
        Endpoint::rank(self)
    }

    fn size(&self) -> usize {
        Endpoint::size(self)
    }

    fn all_gather(&self, data: &[u8]) -> io::Result<Vec<Vec<u8>>> {
        let tag = self.next_collective_tag();
        let frame = Frame::new(FrameKind::Collective, 0, tag, data.to_vec());

        for peer in self.peers() {
            self.send(peer, frame.clone())?;
        }

        let mut ret = Vec::with_capacity(Endpoint::size(self));
        for r in 0..Endpoint::size(self) {
            if r == Endpoint::rank(self) {
                ret.push(data.to_vec());
                continue;
            }
            let got = self.recv_collective(r)?;
            if got.tag != tag {
                return Err(io::Error::new(
                    io::ErrorKind::InvalidData,
                    format!(
                        "collective #{} from rank {} arrived while expecting #{}",
                        got.tag, r, tag
                    ),
                ));
            }
            ret.push(got.payload);
        }
        Ok(ret)
    }
}
