use std::io::{self, Read};

/// A buffered window over a connection's byte stream, sized for message
/// heads.
///
/// While a head is parsed, [`fill`](Buffered::fill) appends stream bytes
/// to the window without discarding anything already there, so the parser
/// can retry over [`pending`](Buffered::pending) until the head is
/// complete and then [`advance`](Buffered::advance) past exactly the
/// parsed length. Whatever bytes were pulled in beyond the head stay
/// pending and are drained first by the [`Read`] impl, which the body
/// framing layers sit on top of.
pub struct Buffered<R> {
    stream: R,
    window: Vec<u8>,
    consumed: usize,
}

/// How much to pull from the stream per [`fill`](Buffered::fill) call.
const FILL_CHUNK: usize = 4096;

/// The window never grows past this; a head that does not fit is
/// rejected by the caller rather than buffered forever.
const MAX_WINDOW: usize = 64 * 1024;

impl<R: Read> Buffered<R> {
    pub fn new(stream: R) -> Buffered<R> {
        Buffered {
            stream,
            window: Vec::with_capacity(FILL_CHUNK),
            consumed: 0,
        }
    }

    /// Appends up to [`FILL_CHUNK`] stream bytes to the window, returning
    /// how many arrived. `Ok(0)` means the stream reached EOF, or the
    /// window is at capacity (see [`is_full`](Buffered::is_full)).
    pub fn fill(&mut self) -> io::Result<usize> {
        if self.is_full() {
            return Ok(0);
        }
        let mut chunk = [0u8; FILL_CHUNK];
        let want = chunk.len().min(MAX_WINDOW - self.window.len());
        let got = self.stream.read(&mut chunk[..want])?;
        self.window.extend_from_slice(&chunk[..got]);
        Ok(got)
    }

    /// The bytes read from the stream but not yet consumed.
    pub fn pending(&self) -> &[u8] {
        &self.window[self.consumed..]
    }

    /// The number of pending bytes.
    pub fn pending_len(&self) -> usize {
        self.window.len() - self.consumed
    }

    /// Marks `n` pending bytes as handled. Once everything pending is
    /// consumed the window memory is released for reuse.
    pub fn advance(&mut self, n: usize) {
        self.consumed = (self.consumed + n).min(self.window.len());
        if self.consumed == self.window.len() {
            self.window.clear();
            self.consumed = 0;
        }
    }

    /// Whether the window reached its size cap without being consumed.
    pub fn is_full(&self) -> bool {
        self.window.len() >= MAX_WINDOW
    }

    /// The underlying stream.
    pub fn stream(&self) -> &R {
        &self.stream
    }

    /// Discards the window and returns the stream. Callers check
    /// [`pending_len`](Buffered::pending_len) first when leftovers
    /// matter.
    pub fn into_stream(self) -> R {
        self.stream
    }
}

impl<R: Read> Read for Buffered<R> {
    fn read(&mut self, out: &mut [u8]) -> io::Result<usize> {
        if self.consumed < self.window.len() {
            let pending = &self.window[self.consumed..];
            let n = pending.len().min(out.len());
            out[..n].copy_from_slice(&pending[..n]);
            self.advance(n);
            return Ok(n);
        }
        self.stream.read(out)
    }
}

#[cfg(test)]
mod tests {
    use std::io::{self, Read};

    use super::Buffered;

    /// Delivers a response in fragments, the way a socket does.
    struct Fragments(Vec<&'static [u8]>);

    impl Read for Fragments {
        fn read(&mut self, out: &mut [u8]) -> io::Result<usize> {
            if self.0.is_empty() {
                return Ok(0);
            }
            let fragment = self.0.remove(0);
            out[..fragment.len()].copy_from_slice(fragment);
            Ok(fragment.len())
        }
    }

    #[test]
    fn window_accumulates_across_fills_for_head_retries() {
        let mut buffered = Buffered::new(Fragments(vec![
            b"HTTP/1.1 200 OK\r\nContent-",
            b"Length: 2\r\n\r\nok",
        ]));

        buffered.fill().unwrap();
        assert_eq!(buffered.pending(), b"HTTP/1.1 200 OK\r\nContent-");

        // A retry after more bytes arrive still sees the earlier ones.
        buffered.fill().unwrap();
        assert_eq!(
            buffered.pending(),
            &b"HTTP/1.1 200 OK\r\nContent-Length: 2\r\n\r\nok"[..]
        );

        // Consume the head; the over-read body bytes stay pending.
        buffered.advance(b"HTTP/1.1 200 OK\r\nContent-Length: 2\r\n\r\n".len());
        assert_eq!(buffered.pending(), b"ok");
    }

    #[test]
    fn reads_drain_pending_bytes_before_the_stream() {
        let mut buffered = Buffered::new(Fragments(vec![b"headbody", b"more"]));
        buffered.fill().unwrap();
        buffered.advance(4);

        let mut out = [0u8; 16];
        let n = buffered.read(&mut out).unwrap();
        assert_eq!(&out[..n], b"body");
        let n = buffered.read(&mut out).unwrap();
        assert_eq!(&out[..n], b"more");
        assert_eq!(buffered.read(&mut out).unwrap(), 0);
    }

    #[test]
    fn fill_reports_eof_as_zero() {
        let mut buffered = Buffered::new(Fragments(vec![b"HTTP/1.1 2"]));
        assert_eq!(buffered.fill().unwrap(), 10);
        assert_eq!(buffered.fill().unwrap(), 0);
        assert_eq!(buffered.pending(), b"HTTP/1.1 2");
    }

    #[test]
    fn window_stops_growing_at_its_cap() {
        let mut buffered = Buffered::new(io::repeat(b'h'));
        while !buffered.is_full() {
            assert!(buffered.fill().unwrap() > 0);
        }
        assert_eq!(buffered.fill().unwrap(), 0);
        assert_eq!(buffered.pending_len(), super::MAX_WINDOW);
    }

    #[test]
    fn consuming_everything_resets_the_window() {
        let mut buffered = Buffered::new(Fragments(vec![b"abc"]));
        buffered.fill().unwrap();
        buffered.advance(3);
        assert_eq!(buffered.pending_len(), 0);
        assert!(buffered.pending().is_empty());
    }
}
