//! Channel I/O backed by the process console and the local file system.

use kestrel_core::BasicError;
use kestrel_vm::{IoChannels, OpenMode};
use std::collections::{HashMap, VecDeque};
use std::fs::{File, OpenOptions};
use std::io::{self, BufRead, Write};

const FILE_NOT_FOUND: u32 = 53;
const FILE_ACCESS: u32 = 75;

enum Channel {
    /// Input files are read whole when opened.
    Reader(VecDeque<char>),
    Writer(File),
}

#[derive(Default)]
pub struct ConsoleIo {
    stdin: VecDeque<char>,
    stdin_done: bool,
    channels: HashMap<i32, Channel>,
    current: i32,
    pending: Option<BasicError>,
}

fn io_error(err: io::Error) -> BasicError {
    let code = match err.kind() {
        io::ErrorKind::NotFound => FILE_NOT_FOUND,
        _ => FILE_ACCESS,
    };
    BasicError::host(code, err.to_string())
}

impl ConsoleIo {
    pub fn new() -> Self {
        Self::default()
    }

    fn fill_stdin(&mut self) {
        if !self.stdin.is_empty() || self.stdin_done {
            return;
        }
        let mut line = String::new();
        match io::stdin().lock().read_line(&mut line) {
            Ok(0) => self.stdin_done = true,
            Ok(_) => self.stdin.extend(line.chars()),
            Err(err) => {
                tracing::warn!(error = %err, "console read failed");
                self.stdin_done = true;
            }
        }
    }
}

impl IoChannels for ConsoleIo {
    fn open(&mut self, path: &str, mode: OpenMode, channel: i32) -> Result<(), BasicError> {
        if channel <= 0 || self.channels.contains_key(&channel) {
            return Err(BasicError::BadChannel);
        }
        let opened = match mode {
            OpenMode::Input => {
                let text = std::fs::read_to_string(path).map_err(io_error)?;
                Channel::Reader(text.chars().collect())
            }
            OpenMode::Output => Channel::Writer(File::create(path).map_err(io_error)?),
            OpenMode::Append => Channel::Writer(
                OpenOptions::new()
                    .create(true)
                    .append(true)
                    .open(path)
                    .map_err(io_error)?,
            ),
            OpenMode::Random | OpenMode::Binary => {
                return Err(BasicError::NotSupported(format!("{mode:?}")));
            }
        };
        tracing::debug!(path, channel, ?mode, "channel opened");
        self.channels.insert(channel, opened);
        Ok(())
    }

    fn close(&mut self, channel: Option<i32>) -> Result<(), BasicError> {
        let closed: Vec<Channel> = match channel {
            None => self.channels.drain().map(|(_, ch)| ch).collect(),
            Some(n) => vec![self.channels.remove(&n).ok_or(BasicError::BadChannel)?],
        };
        for ch in closed {
            if let Channel::Writer(mut file) = ch {
                file.flush().map_err(io_error)?;
            }
        }
        if !self.channels.contains_key(&self.current) {
            self.current = 0;
        }
        Ok(())
    }

    fn read_char(&mut self) -> Result<Option<char>, BasicError> {
        if self.current == 0 {
            self.fill_stdin();
            return Ok(self.stdin.pop_front());
        }
        match self.channels.get_mut(&self.current) {
            Some(Channel::Reader(text)) => Ok(text.pop_front()),
            _ => Err(BasicError::BadChannel),
        }
    }

    fn read_line(&mut self) -> Result<Option<String>, BasicError> {
        let mut line = String::new();
        loop {
            match self.read_char()? {
                None if line.is_empty() => return Ok(None),
                None | Some('\n') => return Ok(Some(line)),
                Some('\r') => {}
                Some(c) => line.push(c),
            }
        }
    }

    fn write(&mut self, text: &str) -> Result<(), BasicError> {
        if self.current == 0 {
            let mut out = io::stdout().lock();
            if let Err(err) = out.write_all(text.as_bytes()).and_then(|_| out.flush()) {
                // A closed stdout surfaces on the next statement.
                self.pending = Some(io_error(err));
            }
            return Ok(());
        }
        match self.channels.get_mut(&self.current) {
            Some(Channel::Writer(file)) => file.write_all(text.as_bytes()).map_err(io_error),
            _ => Err(BasicError::BadChannel),
        }
    }

    fn set_channel(&mut self, channel: i32) -> Result<(), BasicError> {
        if channel != 0 && !self.channels.contains_key(&channel) {
            return Err(BasicError::BadChannel);
        }
        self.current = channel;
        Ok(())
    }

    fn reset_channel(&mut self) {
        self.current = 0;
    }

    fn pending_error(&mut self) -> Option<BasicError> {
        self.pending.take()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn scratch(name: &str) -> String {
        std::env::temp_dir()
            .join(format!("kestrel-console-{}-{name}", std::process::id()))
            .to_string_lossy()
            .into_owned()
    }

    #[test]
    fn file_channels_round_trip() {
        let path = scratch("round-trip.txt");
        let mut io = ConsoleIo::new();
        io.open(&path, OpenMode::Output, 1).expect("open output");
        io.set_channel(1).expect("select");
        io.write("first\r\nsecond\n").expect("write");
        io.reset_channel();
        io.close(Some(1)).expect("close");

        io.open(&path, OpenMode::Input, 2).expect("open input");
        io.set_channel(2).expect("select");
        assert_eq!(io.read_line().expect("read"), Some("first".into()));
        assert_eq!(io.read_line().expect("read"), Some("second".into()));
        assert_eq!(io.read_line().expect("read"), None);
        io.close(None).expect("close all");
        let _ = std::fs::remove_file(&path);
    }

    #[test]
    fn missing_input_file_is_file_not_found() {
        let mut io = ConsoleIo::new();
        let err = io
            .open(&scratch("absent.txt"), OpenMode::Input, 1)
            .expect_err("missing file");
        assert_eq!(err.code(), FILE_NOT_FOUND);
    }

    #[test]
    fn channels_are_validated() {
        let mut io = ConsoleIo::new();
        assert_eq!(io.set_channel(4), Err(BasicError::BadChannel));
        assert_eq!(io.close(Some(4)), Err(BasicError::BadChannel));
        assert_eq!(
            io.open("x", OpenMode::Binary, 1).map_err(|e| e.code()),
            Err(438)
        );
    }
}
