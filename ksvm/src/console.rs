use std::{
    fs::File,
    io::{BufRead, BufReader, Seek, SeekFrom, Write},
    path::{Path, PathBuf},
    sync::{
        Arc,
        atomic::{AtomicBool, Ordering},
    },
    thread::JoinHandle,
    time::Duration,
};
use tracing::{debug, warn};

const POLL_INTERVAL: Duration = Duration::from_millis(250);

/// Follows the VM's serial log and copies new lines to a sink (stdout by
/// default), like `tail -F`.
///
/// Dropping the handle stops the thread.
pub struct ConsoleFollower {
    pub path: PathBuf,
    stop: Arc<AtomicBool>,
    thread: Option<JoinHandle<()>>,
}

impl ConsoleFollower {
    pub fn follow(path: &Path) -> Self {
        Self::follow_into(path, std::io::stdout())
    }

    pub fn follow_into<W>(path: &Path, sink: W) -> Self
    where
        W: Write + Send + 'static,
    {
        let stop = Arc::new(AtomicBool::new(false));
        let thread = {
            let path = path.to_path_buf();
            let stop = stop.clone();
            std::thread::spawn(move || tail(&path, &stop, sink))
        };

        debug!(path = ?path, "Following serial console");
        Self {
            path: path.to_path_buf(),
            stop,
            thread: Some(thread),
        }
    }
}

impl Drop for ConsoleFollower {
    fn drop(&mut self) {
        self.stop.store(true, Ordering::Relaxed);
        if let Some(thread) = self.thread.take() {
            thread.join().ok();
        }
    }
}

fn tail<W: Write>(path: &Path, stop: &AtomicBool, mut sink: W) {
    let mut reader: Option<BufReader<File>> = None;
    let mut line = Vec::new();

    while !stop.load(Ordering::Relaxed) {
        if reader.is_none() {
            // The hypervisor creates the file when the machine powers on
            match File::open(path) {
                Ok(file) => reader = Some(BufReader::new(file)),
                Err(_) => {
                    std::thread::sleep(POLL_INTERVAL);
                    continue;
                }
            }
        }
        let Some(current) = reader.as_mut() else {
            continue;
        };

        // Firmware output is not always UTF-8, pass bytes through untouched
        line.clear();
        match current.read_until(b'\n', &mut line) {
            Ok(0) => {
                // Truncated when the machine restarts
                if let (Ok(position), Ok(metadata)) =
                    (current.stream_position(), std::fs::metadata(path))
                {
                    if metadata.len() < position {
                        current.seek(SeekFrom::Start(0)).ok();
                    }
                }
                std::thread::sleep(POLL_INTERVAL);
            }
            Ok(_) => {
                if sink.write_all(&line).and_then(|_| sink.flush()).is_err() {
                    break;
                }
            }
            Err(error) => {
                warn!(error = ?error, path = ?path, "Failed to read serial console");
                break;
            }
        }
    }
}
