//! In-memory streams and connectors for tests.

use std::collections::{HashMap, VecDeque};
use std::io::{self, Read, Write};
use std::net::{Shutdown, SocketAddr};
use std::sync::{Arc, Condvar, Mutex};
use std::time::Duration;

use log::trace;

use crate::client::route::Route;
use crate::net::{NetworkConnector, NetworkStream};

/// A gate that keeps a `MockStream` read blocked until opened.
#[derive(Default)]
pub struct Gate {
    open: Mutex<bool>,
    cond: Condvar,
}

impl Gate {
    pub fn new() -> Arc<Gate> {
        Arc::new(Gate::default())
    }

    pub fn open(&self) {
        *self.open.lock().unwrap() = true;
        self.cond.notify_all();
    }
}

struct MockInner {
    read: io::Cursor<Vec<u8>>,
    write: Vec<u8>,
    closed: bool,
    fresh: bool,
    read_error: Option<io::ErrorKind>,
    gate: Option<Arc<Gate>>,
}

/// A scripted bidirectional stream. Cloning shares the underlying state,
/// which is how tests keep a handle for inspecting written bytes, and how
/// `duplicate` hands a cancel handle to another thread.
#[derive(Clone)]
pub struct MockStream {
    inner: Arc<Mutex<MockInner>>,
}

impl MockStream {
    pub fn new() -> MockStream {
        MockStream::with_input(b"")
    }

    pub fn with_input(input: &[u8]) -> MockStream {
        MockStream {
            inner: Arc::new(Mutex::new(MockInner {
                read: io::Cursor::new(input.to_vec()),
                write: Vec::new(),
                closed: false,
                fresh: true,
                read_error: None,
                gate: None,
            })),
        }
    }

    /// The next read fails with `kind` instead of yielding bytes.
    pub fn error_next_read(&self, kind: io::ErrorKind) {
        self.inner.lock().unwrap().read_error = Some(kind);
    }

    /// Marks the idle stream stale so the pool's probe rejects it.
    pub fn set_stale(&self) {
        self.inner.lock().unwrap().fresh = false;
    }

    /// Blocks reads behind `gate` until it is opened.
    pub fn gate_reads(&self, gate: Arc<Gate>) {
        self.inner.lock().unwrap().gate = Some(gate);
    }

    pub fn written(&self) -> Vec<u8> {
        self.inner.lock().unwrap().write.clone()
    }

    pub fn is_closed(&self) -> bool {
        self.inner.lock().unwrap().closed
    }
}

impl Read for MockStream {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        let gate = self.inner.lock().unwrap().gate.clone();
        if let Some(gate) = gate {
            let mut open = gate.open.lock().unwrap();
            while !*open {
                if self.inner.lock().unwrap().closed {
                    return Ok(0);
                }
                let (next, timeout) = gate
                    .cond
                    .wait_timeout(open, Duration::from_millis(20))
                    .unwrap();
                open = next;
                if timeout.timed_out() {
                    continue;
                }
            }
        }
        let mut inner = self.inner.lock().unwrap();
        if let Some(kind) = inner.read_error.take() {
            return Err(io::Error::new(kind, "scripted read error"));
        }
        if inner.closed {
            return Ok(0);
        }
        inner.read.read(buf)
    }
}

impl Write for MockStream {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        let mut inner = self.inner.lock().unwrap();
        if inner.closed {
            return Err(io::Error::new(io::ErrorKind::BrokenPipe, "stream closed"));
        }
        inner.write.extend_from_slice(buf);
        Ok(buf.len())
    }

    fn flush(&mut self) -> io::Result<()> {
        Ok(())
    }
}

impl NetworkStream for MockStream {
    fn peer_addr(&mut self) -> io::Result<SocketAddr> {
        Ok("127.0.0.1:1234".parse().unwrap())
    }

    fn set_read_timeout(&self, _dur: Option<Duration>) -> io::Result<()> {
        Ok(())
    }

    fn set_write_timeout(&self, _dur: Option<Duration>) -> io::Result<()> {
        Ok(())
    }

    fn close(&self, _how: Shutdown) -> io::Result<()> {
        self.inner.lock().unwrap().closed = true;
        Ok(())
    }

    fn duplicate(&self) -> io::Result<Box<dyn NetworkStream + Send>> {
        Ok(Box::new(self.clone()))
    }

    fn is_fresh(&mut self) -> bool {
        let inner = self.inner.lock().unwrap();
        inner.fresh && !inner.closed
    }
}

/// Hands out scripted streams keyed by `host:port`.
#[derive(Default)]
pub struct MockConnector {
    streams: Mutex<HashMap<String, VecDeque<MockStream>>>,
    connects: Mutex<Vec<String>>,
}

impl MockConnector {
    pub fn new() -> MockConnector {
        MockConnector::default()
    }

    /// Scripts the next stream for `key` (`"host:port"`). Returns a handle
    /// sharing the stream's state for later inspection.
    pub fn mock(&self, key: &str, stream: MockStream) -> MockStream {
        let handle = stream.clone();
        self.streams
            .lock()
            .unwrap()
            .entry(key.to_owned())
            .or_default()
            .push_back(stream);
        handle
    }

    /// The `host:port` keys connected so far, in order.
    pub fn connect_log(&self) -> Vec<String> {
        self.connects.lock().unwrap().clone()
    }
}

impl NetworkConnector for MockConnector {
    fn connect(
        &self,
        route: &Route,
        _connect_timeout: Option<Duration>,
    ) -> crate::Result<Box<dyn NetworkStream + Send>> {
        let key = format!("{}:{}", route.address().host(), route.address().port());
        trace!("mock connect: {}", key);
        self.connects.lock().unwrap().push(key.clone());
        let mut streams = self.streams.lock().unwrap();
        let queue = streams
            .get_mut(&key)
            .unwrap_or_else(|| panic!("no mocked streams for {}", key));
        let stream = queue
            .pop_front()
            .unwrap_or_else(|| panic!("no additional mocked streams for {}", key));
        Ok(Box::new(stream))
    }
}
