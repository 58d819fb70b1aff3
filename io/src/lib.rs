use thiserror::Error;

#[derive(Error, Debug)]
pub enum Error {
    #[error("premature end of stream (expected to read {expected} bytes, got {got} instead)")]
    UnexpectedEof { expected: usize, got: usize },

    #[error(transparent)]
    Io(#[from] std::io::Error),
}

/// A pull-based byte provider.
///
/// One call returns between 0 and `buf.len()` bytes, with 0 signalling
/// end-of-stream.  Short reads are expected; the [`Fill`] layer retries them.
pub trait Source {
    fn pull(&mut self, buf: &mut [u8]) -> Result<usize, Error>;
}

impl<R: std::io::Read> Source for R {
    fn pull(&mut self, buf: &mut [u8]) -> Result<usize, Error> {
        loop {
            match self.read(buf) {
                Ok(n) => return Ok(n),
                Err(e) if e.kind() == std::io::ErrorKind::Interrupted => {}
                Err(e) => return Err(e.into()),
            }
        }
    }
}

/// The exact-read contract: fill the whole buffer or fail.
pub trait Fill {
    fn fill(&mut self, buf: &mut [u8]) -> Result<(), Error>;

    fn fill_array<const N: usize>(&mut self) -> Result<[u8; N], Error> {
        let mut buf = [0u8; N];
        self.fill(&mut buf)?;
        Ok(buf)
    }
}

/// Byte-exact sub-reads off the front of an in-memory slice.
impl Fill for &[u8] {
    fn fill(&mut self, buf: &mut [u8]) -> Result<(), Error> {
        if self.len() < buf.len() {
            return Err(Error::UnexpectedEof {
                expected: buf.len(),
                got: self.len(),
            });
        }
        let (head, tail) = self.split_at(buf.len());
        buf.copy_from_slice(head);
        *self = tail;
        Ok(())
    }
}

/// A fixed-capacity readahead buffer that batches small reads against a
/// [`Source`].
///
/// Bytes in `[pos, len)` are valid and not yet consumed.  Requests at least
/// as large as the capacity bypass the buffer entirely, so a capacity of 0
/// maps every fill directly onto source reads.
pub struct Readahead<S> {
    src: S,
    buf: Box<[u8]>,
    pos: usize,
    len: usize,
}

impl<S: Source> Readahead<S> {
    pub fn new(src: S, capacity: usize) -> Self {
        Self {
            src,
            buf: vec![0; capacity].into_boxed_slice(),
            pos: 0,
            len: 0,
        }
    }

    fn pull_exact(&mut self, buf: &mut [u8], expected: usize) -> Result<(), Error> {
        let mut filled = 0;
        while filled < buf.len() {
            let n = self.src.pull(&mut buf[filled..])?;
            if n == 0 {
                return Err(Error::UnexpectedEof {
                    expected,
                    got: expected - buf.len() + filled,
                });
            }
            filled += n;
        }
        Ok(())
    }
}

impl<S: Source> Fill for Readahead<S> {
    fn fill(&mut self, buf: &mut [u8]) -> Result<(), Error> {
        debug_assert!(self.pos <= self.len && self.len <= self.buf.len());

        let want = buf.len();
        let have = self.len - self.pos;
        if have >= want {
            buf.copy_from_slice(&self.buf[self.pos..self.pos + want]);
            self.pos += want;
            return Ok(());
        }

        // Drain the buffered tail, then go to the source for the rest
        buf[..have].copy_from_slice(&self.buf[self.pos..self.len]);
        self.pos = 0;
        self.len = 0;

        let rest = &mut buf[have..];
        if rest.len() >= self.buf.len() {
            // Oversized request: read straight into the destination
            return self.pull_exact(rest, want);
        }

        while self.len < rest.len() {
            let n = self.src.pull(&mut self.buf[self.len..])?;
            if n == 0 {
                return Err(Error::UnexpectedEof {
                    expected: want,
                    got: have + self.len,
                });
            }
            self.len += n;
        }
        rest.copy_from_slice(&self.buf[..rest.len()]);
        self.pos = rest.len();
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    // Yields at most `step` bytes per read
    struct Trickle<'a> {
        data: &'a [u8],
        step: usize,
    }

    impl std::io::Read for Trickle<'_> {
        fn read(&mut self, buf: &mut [u8]) -> std::io::Result<usize> {
            let n = self.data.len().min(self.step).min(buf.len());
            let (head, tail) = self.data.split_at(n);
            buf[..n].copy_from_slice(head);
            self.data = tail;
            Ok(n)
        }
    }

    #[test]
    fn slice_fill() {
        let mut data: &[u8] = &[1, 2, 3, 4, 5];
        assert_eq!(data.fill_array().unwrap(), [1, 2]);
        assert_eq!(data.fill_array().unwrap(), [3]);

        let mut buf = [0u8; 3];
        assert!(matches!(
            data.fill(&mut buf),
            Err(Error::UnexpectedEof {
                expected: 3,
                got: 2
            })
        ));
    }

    #[test]
    fn buffered_boundaries() {
        let data: Vec<u8> = (0..64).collect();
        for step in [1, 3, 64] {
            // Requests smaller than, equal to, and larger than capacity
            let mut r = Readahead::new(
                Trickle {
                    data: &data,
                    step,
                },
                8,
            );
            let mut out = Vec::new();
            for want in [3, 5, 8, 17, 16, 15] {
                let mut buf = vec![0; want];
                r.fill(&mut buf).unwrap();
                out.extend_from_slice(&buf);
            }
            assert_eq!(out, data);
        }
    }

    #[test]
    fn unbuffered_mode() {
        let data: Vec<u8> = (0..16).collect();
        let mut r = Readahead::new(
            Trickle {
                data: &data,
                step: 2,
            },
            0,
        );
        assert_eq!(r.fill_array().unwrap(), [0, 1, 2, 3, 4]);
        assert_eq!(r.fill_array().unwrap(), [5]);

        let mut buf = [0u8; 16];
        assert!(matches!(
            r.fill(&mut buf),
            Err(Error::UnexpectedEof {
                expected: 16,
                got: 10
            })
        ));
    }

    #[test]
    fn eof_reports_partial_read() {
        let mut r = Readahead::new(Trickle { data: &[1, 2], step: 1 }, 8);
        let mut buf = [0u8; 5];
        assert!(matches!(
            r.fill(&mut buf),
            Err(Error::UnexpectedEof {
                expected: 5,
                got: 2
            })
        ));
    }

    #[test]
    fn std_read_sources() {
        let mut r = Readahead::new(std::io::Cursor::new(vec![1u8, 2, 3]), 2);
        assert_eq!(r.fill_array().unwrap(), [1, 2, 3]);
    }
}
