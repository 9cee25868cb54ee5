//! Byte sinks for builder output: a durable log file, a live progress
//! channel, and a fan-out that feeds both.

use std::fs::File;
use std::io::{self, Write};
use std::path::Path;

use super::ProgressSender;

pub trait LogSink: Send {
    fn append(&mut self, bytes: &[u8]) -> io::Result<()>;
}

/// Appends to a file on disk.
pub struct FileSink {
    file: File,
}

impl FileSink {
    /// Create the file, truncating any previous contents.
    pub fn create(path: &Path) -> io::Result<Self> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        Ok(Self {
            file: File::create(path)?,
        })
    }
}

impl LogSink for FileSink {
    fn append(&mut self, bytes: &[u8]) -> io::Result<()> {
        self.file.write_all(bytes)
    }
}

/// Forwards non-blank chunks as progress messages. Never blocks.
pub struct ChannelSink {
    sender: ProgressSender,
}

impl ChannelSink {
    pub fn new(sender: ProgressSender) -> Self {
        Self { sender }
    }
}

impl LogSink for ChannelSink {
    fn append(&mut self, bytes: &[u8]) -> io::Result<()> {
        let text = String::from_utf8_lossy(bytes);
        if !text.trim().is_empty() {
            self.sender.message(text.into_owned());
        }
        Ok(())
    }
}

/// Writes every chunk to each inner sink. A failing sink does not stop the
/// others; the first error is returned after all have been tried.
pub struct FanOut {
    sinks: Vec<Box<dyn LogSink>>,
}

impl FanOut {
    pub fn new(sinks: Vec<Box<dyn LogSink>>) -> Self {
        Self { sinks }
    }
}

impl LogSink for FanOut {
    fn append(&mut self, bytes: &[u8]) -> io::Result<()> {
        let mut first_err = None;
        for sink in &mut self.sinks {
            if let Err(e) = sink.append(bytes) {
                first_err.get_or_insert(e);
            }
        }
        match first_err {
            Some(e) => Err(e),
            None => Ok(()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::engine::{ProgressEvent, ProgressHub};
    use std::sync::Arc;
    use parking_lot::Mutex;

    struct Failing;

    impl LogSink for Failing {
        fn append(&mut self, _bytes: &[u8]) -> io::Result<()> {
            Err(io::Error::new(io::ErrorKind::Other, "disk full"))
        }
    }

    #[derive(Clone, Default)]
    struct Shared(Arc<Mutex<Vec<u8>>>);

    impl LogSink for Shared {
        fn append(&mut self, bytes: &[u8]) -> io::Result<()> {
            self.0.lock().extend_from_slice(bytes);
            Ok(())
        }
    }

    #[test]
    fn test_file_sink_truncates_previous_log() {
        let dir = tempfile::TempDir::new().unwrap();
        let path = dir.path().join("logs/build-a.log");

        let mut sink = FileSink::create(&path).unwrap();
        sink.append(b"old").unwrap();
        drop(sink);

        let mut sink = FileSink::create(&path).unwrap();
        sink.append(b"one ").unwrap();
        sink.append(b"two").unwrap();
        drop(sink);
        assert_eq!(std::fs::read_to_string(&path).unwrap(), "one two");
    }

    #[tokio::test]
    async fn test_channel_sink_skips_blank_chunks() {
        let hub = ProgressHub::new(8);
        let mut rx = hub.subscribe("a");
        let mut sink = ChannelSink::new(hub.sender("a"));

        sink.append(b"\n  \n").unwrap();
        sink.append(b"Step 1/3 : FROM alpine\n").unwrap();

        let event = rx.recv().await.unwrap();
        assert_eq!(
            event.event,
            ProgressEvent::Message {
                text: "Step 1/3 : FROM alpine\n".into()
            }
        );
        assert!(rx.try_recv().is_err());
    }

    #[test]
    fn test_fan_out_keeps_writing_after_failure() {
        let good = Shared::default();
        let mut fan = FanOut::new(vec![Box::new(Failing), Box::new(good.clone())]);

        assert!(fan.append(b"hello").is_err());
        assert_eq!(good.0.lock().as_slice(), b"hello");
    }
}
