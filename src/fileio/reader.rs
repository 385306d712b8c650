//! Framed log replay.
//!
//! Reads the legacy on-disk layout of repeating `[u32 header][payload]`
//! records, header = `(channel << 28) | size`, and replays each record
//! as one frame through the connected sink. A path ending in `.1`
//! auto-advances through `.2`, `.3`, … on EOF until a file is missing.

use std::fs::File;
use std::io::Read;
use std::path::Path;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Condvar, Mutex};
use std::thread::JoinHandle;
use std::time::Duration;

use crate::error::{DaqError, Result};
use crate::stream::frame::error_bits;
use crate::stream::{Master, Slave};

/// Record header width.
const HEADER_BYTES: usize = 4;

struct ReaderShared {
    master: Master,
    active: AtomicBool,
    stop: AtomicBool,
    done_mtx: Mutex<()>,
    done_cv: Condvar,
}

/// Replays a framed on-disk log as a stream Master.
pub struct FileReader {
    shared: Arc<ReaderShared>,
    thread: Mutex<Option<JoinHandle<()>>>,
}

impl FileReader {
    pub fn new() -> Arc<Self> {
        Arc::new(Self {
            shared: Arc::new(ReaderShared {
                master: Master::new(),
                active: AtomicBool::new(false),
                stop: AtomicBool::new(false),
                done_mtx: Mutex::new(()),
                done_cv: Condvar::new(),
            }),
            thread: Mutex::new(None),
        })
    }

    /// Connect the sink receiving replayed frames.
    pub fn set_slave(&self, slave: Arc<dyn Slave>) {
        self.shared.master.set_slave(slave);
    }

    /// Open a log file and start replaying it.
    ///
    /// A name ending in `.1` selects rotation mode: on EOF the reader
    /// continues with `.2`, `.3`, … until an open fails.
    pub fn open(&self, path: &Path) -> Result<()> {
        self.close();

        let file = File::open(path).map_err(|_| DaqError::Open {
            path: path.display().to_string(),
            mask: 0,
        })?;

        let display = path.display().to_string();
        let rotation = display
            .strip_suffix(".1")
            .map(|base| (base.to_string(), 1u32));

        self.shared.stop.store(false, Ordering::Release);
        self.shared.active.store(true, Ordering::Release);

        let shared = self.shared.clone();
        let handle = std::thread::Builder::new()
            .name("file-reader".to_string())
            .spawn(move || {
                run_reader(&shared, file, rotation);
                let _guard = shared.done_mtx.lock().unwrap();
                shared.active.store(false, Ordering::Release);
                shared.done_cv.notify_all();
            })?;
        *self.thread.lock().unwrap() = Some(handle);
        Ok(())
    }

    /// True while the replay thread is still delivering frames.
    pub fn is_active(&self) -> bool {
        self.shared.active.load(Ordering::Acquire)
    }

    /// Wait for the replay to finish on its own; `false` on timeout.
    pub fn close_wait(&self, timeout: Duration) -> bool {
        {
            let guard = self.shared.done_mtx.lock().unwrap();
            let (_guard, result) = self
                .shared
                .done_cv
                .wait_timeout_while(guard, timeout, |_| {
                    self.shared.active.load(Ordering::Acquire)
                })
                .unwrap();
            if result.timed_out() {
                return false;
            }
        }
        self.close();
        true
    }

    /// Stop the replay thread and wait for it to exit.
    pub fn close(&self) {
        self.shared.stop.store(true, Ordering::Release);
        if let Some(handle) = self.thread.lock().unwrap().take() {
            let _ = handle.join();
        }
    }
}

impl Drop for FileReader {
    fn drop(&mut self) {
        self.close();
    }
}

/// Decode one header word: channel in the top nibble, payload size below.
/// Channel 0 counts the size in 32-bit words (legacy writers).
fn decode_header(header: u32) -> (u8, usize) {
    let channel = (header >> 28) as u8;
    let size = (header & 0x0FFF_FFFF) as usize;
    let bytes = if channel == 0 { size * 4 } else { size };
    (channel, bytes)
}

fn run_reader(shared: &ReaderShared, mut file: File, rotation: Option<(String, u32)>) {
    let mut rotation = rotation;
    loop {
        let clean = replay_file(shared, &mut file);
        if !clean {
            return;
        }
        // Clean EOF: advance through the rotation set, if any.
        let Some((base, idx)) = rotation.as_mut() else {
            return;
        };
        *idx += 1;
        let next = format!("{base}.{idx}");
        match File::open(&next) {
            Ok(f) => {
                tracing::debug!(file = %next, "rotating to next log segment");
                file = f;
            }
            Err(_) => return,
        }
    }
}

/// Replay one file. Returns true on clean EOF (rotation may continue),
/// false when the stream ended (marker, error or stop request).
fn replay_file(shared: &ReaderShared, file: &mut File) -> bool {
    let mut header = [0u8; HEADER_BYTES];
    loop {
        if shared.stop.load(Ordering::Acquire) {
            return false;
        }
        match read_exact_or_eof(file, &mut header) {
            Ok(true) => {}
            // EOF on a record boundary (or a torn header) ends this file.
            Ok(false) => return true,
            Err(e) => {
                tracing::warn!(error = %e, "header read failed");
                return false;
            }
        }

        let (channel, record_bytes) = decode_header(u32::from_le_bytes(header));
        if record_bytes == 0 {
            tracing::debug!("end-of-stream marker");
            return false;
        }
        // Runt records no longer than the header width carry no payload.
        if record_bytes <= HEADER_BYTES {
            continue;
        }
        let payload_len = record_bytes;

        let mut payload = vec![0u8; payload_len];
        let mut filled = 0;
        let mut truncated = false;
        while filled < payload_len {
            match file.read(&mut payload[filled..]) {
                Ok(0) => {
                    truncated = true;
                    break;
                }
                Ok(n) => filled += n,
                Err(e) => {
                    tracing::warn!(error = %e, "payload read failed");
                    truncated = true;
                    break;
                }
            }
        }

        let mut frame = match shared.master.req_frame(filled.max(1), true) {
            Ok(frame) => frame,
            Err(e) => {
                tracing::error!(error = %e, "frame request failed");
                return false;
            }
        };
        frame.set_channel(channel);
        if frame.write_bytes(0, &payload[..filled]).is_err() {
            frame.set_error(error_bits::OVERFLOW);
        }
        if truncated {
            tracing::warn!(
                got = filled,
                wanted = payload_len,
                "short read, ending stream"
            );
            frame.set_error(error_bits::TRUNCATED);
        }
        if let Err(e) = shared.master.send_frame(frame) {
            tracing::warn!(error = %e, "downstream rejected replayed frame");
        }
        if truncated {
            return false;
        }
    }
}

/// Read exactly `buf.len()` bytes; `Ok(false)` on EOF before a full read.
fn read_exact_or_eof(file: &mut File, buf: &mut [u8]) -> std::io::Result<bool> {
    let mut filled = 0;
    while filled < buf.len() {
        match file.read(&mut buf[filled..]) {
            Ok(0) => return Ok(false),
            Ok(n) => filled += n,
            Err(e) => return Err(e),
        }
    }
    Ok(true)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::stream::testutil::Recorder;
    use std::io::Write;
    use std::path::PathBuf;

    /// Unique scratch path: pid plus a time-derived nonce.
    fn scratch_path(tag: &str) -> PathBuf {
        let nanos = std::time::SystemTime::now()
            .duration_since(std::time::UNIX_EPOCH)
            .map(|d| d.as_nanos() as u64)
            .unwrap_or(0);
        std::env::temp_dir().join(format!(
            "daqwire-{}-{}-{:x}",
            tag,
            std::process::id(),
            nanos
        ))
    }

    /// Encode one record. The size field counts payload bytes; channel 0
    /// counts 32-bit words, so its payload must pad to a word boundary.
    fn record(channel: u8, payload: &[u8]) -> Vec<u8> {
        let size = if channel == 0 {
            assert_eq!(payload.len() % 4, 0);
            (payload.len() / 4) as u32
        } else {
            payload.len() as u32
        };
        let header = ((channel as u32) << 28) | size;
        let mut out = header.to_le_bytes().to_vec();
        out.extend_from_slice(payload);
        out
    }

    fn replay(files: &[(PathBuf, Vec<u8>)]) -> (Arc<FileReader>, Arc<Recorder>) {
        for (path, bytes) in files {
            let mut f = File::create(path).unwrap();
            f.write_all(bytes).unwrap();
        }
        let reader = FileReader::new();
        let rec = Recorder::new();
        reader.set_slave(rec.clone());
        reader.open(&files[0].0).unwrap();
        (reader, rec)
    }

    #[test]
    fn test_open_missing_file_fails() {
        let reader = FileReader::new();
        let result = reader.open(&scratch_path("missing"));
        assert!(matches!(result, Err(DaqError::Open { .. })));
    }

    #[test]
    fn test_single_file_replay() {
        let path = scratch_path("single");
        let mut bytes = record(2, &[1, 2, 3, 4, 5, 6]);
        bytes.extend(record(2, &[7, 8, 9, 10, 11]));
        let (reader, rec) = replay(&[(path.clone(), bytes)]);

        assert!(rec.wait_for(2, Duration::from_secs(5)));
        assert!(reader.close_wait(Duration::from_secs(5)));
        assert!(!reader.is_active());

        let frames = rec.frames();
        assert_eq!(frames[0].channel, 2);
        assert_eq!(frames[0].data, vec![1, 2, 3, 4, 5, 6]);
        assert_eq!(frames[1].data, vec![7, 8, 9, 10, 11]);
        let _ = std::fs::remove_file(path);
    }

    #[test]
    fn test_channel_zero_word_sizing() {
        let path = scratch_path("words");
        // 8-byte payload -> size field 2 words.
        let bytes = record(0, &[9, 9, 9, 9, 8, 8, 8, 8]);
        let (reader, rec) = replay(&[(path.clone(), bytes)]);

        assert!(rec.wait_for(1, Duration::from_secs(5)));
        assert!(reader.close_wait(Duration::from_secs(5)));
        let frames = rec.frames();
        assert_eq!(frames[0].channel, 0);
        assert_eq!(frames[0].data.len(), 8);
        let _ = std::fs::remove_file(path);
    }

    #[test]
    fn test_rotation_replays_all_segments() {
        let base = scratch_path("rot");
        let base_str = base.display().to_string();
        let one = PathBuf::from(format!("{base_str}.1"));
        let two = PathBuf::from(format!("{base_str}.2"));

        let mut first = record(1, &[1; 5]);
        first.extend(record(1, &[2; 5]));
        let second = record(1, &[3; 5]);

        let (reader, rec) = replay(&[(one.clone(), first), (two.clone(), second)]);

        assert!(rec.wait_for(3, Duration::from_secs(5)));
        assert!(reader.close_wait(Duration::from_secs(5)));
        assert!(!reader.is_active());

        let data: Vec<u8> = rec.frames().iter().map(|f| f.data[0]).collect();
        assert_eq!(data, vec![1, 2, 3]);

        let _ = std::fs::remove_file(one);
        let _ = std::fs::remove_file(two);
    }

    #[test]
    fn test_truncated_trailing_frame_sets_error() {
        let path = scratch_path("trunc");
        let mut bytes = record(3, &[1, 2, 3, 4, 5]);
        // Second record promises 8 payload bytes but delivers 2.
        bytes.extend(record(3, &[5, 6, 7, 8, 9, 10, 11, 12])[..HEADER_BYTES + 2].to_vec());
        let (reader, rec) = replay(&[(path.clone(), bytes)]);

        assert!(rec.wait_for(2, Duration::from_secs(5)));
        assert!(reader.close_wait(Duration::from_secs(5)));

        let frames = rec.frames();
        assert_eq!(frames[0].error & error_bits::TRUNCATED, 0);
        assert_ne!(frames[1].error & error_bits::TRUNCATED, 0);
        assert_eq!(frames[1].data, vec![5, 6]);
        let _ = std::fs::remove_file(path);
    }

    #[test]
    fn test_end_of_stream_marker_stops_replay() {
        let path = scratch_path("eos");
        let mut bytes = record(1, &[1; 5]);
        bytes.extend(0u32.to_le_bytes());
        bytes.extend(record(1, &[2; 5]));
        let (reader, rec) = replay(&[(path.clone(), bytes)]);

        assert!(reader.close_wait(Duration::from_secs(5)));
        let frames = rec.frames();
        assert_eq!(frames.len(), 1, "records after the marker are ignored");
        let _ = std::fs::remove_file(path);
    }

    #[test]
    fn test_runt_records_are_skipped() {
        let path = scratch_path("runt");
        let mut bytes = Vec::new();
        // Header-only marker record (size 3, no payload follows).
        bytes.extend(((1u32 << 28) | 3).to_le_bytes());
        bytes.extend(record(1, &[42, 43, 44, 45, 46]));
        let (reader, rec) = replay(&[(path.clone(), bytes)]);

        assert!(rec.wait_for(1, Duration::from_secs(5)));
        assert!(reader.close_wait(Duration::from_secs(5)));
        let frames = rec.frames();
        assert_eq!(frames.len(), 1);
        assert_eq!(frames[0].data, vec![42, 43, 44, 45, 46]);
        let _ = std::fs::remove_file(path);
    }
}
