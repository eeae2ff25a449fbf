//! Shared helpers for integration tests.

#![allow(dead_code)]

pub mod fake_device;

use std::io;
use std::sync::{Arc, Mutex};

use tracing::{Dispatch, Level};
use tracing_subscriber::fmt::MakeWriter;

/// In-memory log sink for a test-local dispatcher.
#[derive(Clone, Default)]
pub struct CapturedLogs {
    buf: Arc<Mutex<Vec<u8>>>,
}

impl CapturedLogs {
    pub fn new() -> Self {
        Self::default()
    }

    /// A dispatcher that writes plain-text events into this buffer.
    pub fn dispatch(&self) -> Dispatch {
        let subscriber = tracing_subscriber::fmt()
            .with_writer(self.clone())
            .with_ansi(false)
            .with_max_level(Level::DEBUG)
            .finish();
        Dispatch::new(subscriber)
    }

    pub fn contents(&self) -> String {
        let buf = self.buf.lock().unwrap();
        String::from_utf8_lossy(&buf).into_owned()
    }

    /// Lines logged at WARN level.
    pub fn warnings(&self) -> Vec<String> {
        self.contents()
            .lines()
            .filter(|line| line.contains(" WARN "))
            .map(str::to_string)
            .collect()
    }
}

impl io::Write for CapturedLogs {
    fn write(&mut self, data: &[u8]) -> io::Result<usize> {
        self.buf.lock().unwrap().extend_from_slice(data);
        Ok(data.len())
    }

    fn flush(&mut self) -> io::Result<()> {
        Ok(())
    }
}

impl<'a> MakeWriter<'a> for CapturedLogs {
    type Writer = CapturedLogs;

    fn make_writer(&'a self) -> Self::Writer {
        self.clone()
    }
}
