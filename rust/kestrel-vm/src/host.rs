//! Collaborator interfaces the interpreter consumes: channel I/O, foreign
//! calls, debugger notifications and the host symbol space.

use kestrel_core::image::CallConv;
use kestrel_core::{ArgVec, BasicError, NativeFunction, ObjectRef, Value, VarRef, VarType};
use std::cell::RefCell;
use std::collections::{HashMap, VecDeque};
use std::rc::Rc;

/// `OPEN ... FOR <mode>`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OpenMode {
    Input,
    Output,
    Append,
    Random,
    Binary,
}

impl OpenMode {
    pub fn from_operand(n: u32) -> Option<Self> {
        Some(match n {
            1 => OpenMode::Input,
            2 => OpenMode::Output,
            8 => OpenMode::Append,
            4 => OpenMode::Random,
            32 => OpenMode::Binary,
            _ => return None,
        })
    }
}

/// File and console channels. Channel 0 is the console; `set_channel`
/// redirects subsequent reads and writes until `reset_channel`.
pub trait IoChannels {
    fn open(&mut self, path: &str, mode: OpenMode, channel: i32) -> Result<(), BasicError>;
    /// Close one channel, or all of them.
    fn close(&mut self, channel: Option<i32>) -> Result<(), BasicError>;
    fn read_char(&mut self) -> Result<Option<char>, BasicError>;
    fn read_line(&mut self) -> Result<Option<String>, BasicError>;
    fn write(&mut self, text: &str) -> Result<(), BasicError>;
    fn set_channel(&mut self, channel: i32) -> Result<(), BasicError>;
    fn reset_channel(&mut self);
    /// A deferred failure from an earlier operation, if any.
    fn pending_error(&mut self) -> Option<BasicError> {
        None
    }
}

#[derive(Debug, Default)]
struct BufferState {
    console_out: String,
    console_in: VecDeque<char>,
    channels: HashMap<i32, (OpenMode, String)>,
    current: i32,
}

/// In-memory channels: console output is captured, console input is fed
/// from a queue, opened channels are string buffers. Clones share state.
#[derive(Debug, Clone, Default)]
pub struct BufferIo {
    state: Rc<RefCell<BufferState>>,
}

impl BufferIo {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn feed(&self, input: &str) {
        self.state.borrow_mut().console_in.extend(input.chars());
    }

    pub fn output(&self) -> String {
        self.state.borrow().console_out.clone()
    }

    /// Contents written to an open channel.
    pub fn channel_contents(&self, channel: i32) -> Option<String> {
        self.state
            .borrow()
            .channels
            .get(&channel)
            .map(|(_, text)| text.clone())
    }
}

impl IoChannels for BufferIo {
    fn open(&mut self, _path: &str, mode: OpenMode, channel: i32) -> Result<(), BasicError> {
        let mut st = self.state.borrow_mut();
        if channel <= 0 || st.channels.contains_key(&channel) {
            return Err(BasicError::BadChannel);
        }
        st.channels.insert(channel, (mode, String::new()));
        Ok(())
    }

    fn close(&mut self, channel: Option<i32>) -> Result<(), BasicError> {
        let mut st = self.state.borrow_mut();
        match channel {
            None => st.channels.clear(),
            Some(n) => {
                st.channels.remove(&n).ok_or(BasicError::BadChannel)?;
            }
        }
        if !st.channels.contains_key(&st.current) {
            st.current = 0;
        }
        Ok(())
    }

    fn read_char(&mut self) -> Result<Option<char>, BasicError> {
        let mut st = self.state.borrow_mut();
        if st.current != 0 {
            let ch = st.current;
            let (_, text) = st.channels.get_mut(&ch).ok_or(BasicError::BadChannel)?;
            if text.is_empty() {
                return Ok(None);
            }
            return Ok(Some(text.remove(0)));
        }
        Ok(st.console_in.pop_front())
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
        let mut st = self.state.borrow_mut();
        if st.current == 0 {
            st.console_out.push_str(text);
            return Ok(());
        }
        let ch = st.current;
        match st.channels.get_mut(&ch) {
            Some((OpenMode::Input, _)) | None => Err(BasicError::BadChannel),
            Some((_, buf)) => {
                buf.push_str(text);
                Ok(())
            }
        }
    }

    fn set_channel(&mut self, channel: i32) -> Result<(), BasicError> {
        let mut st = self.state.borrow_mut();
        if channel != 0 && !st.channels.contains_key(&channel) {
            return Err(BasicError::BadChannel);
        }
        st.current = channel;
        Ok(())
    }

    fn reset_channel(&mut self) {
        self.state.borrow_mut().current = 0;
    }
}

/// Bridge for `DECLARE ... LIB` procedures. The result is written to the
/// argument vector's return slot; the returned code is 0 on success or a
/// BASIC error number.
pub trait ForeignCall {
    fn call(
        &mut self,
        function: &str,
        library: &str,
        args: &mut ArgVec,
        ret: VarType,
        convention: CallConv,
    ) -> u32;
}

/// Reply of a debugger to a statement notification.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DebugMode {
    /// Run until the next breakpoint.
    Continue,
    StepInto,
    /// Stop at the next statement at this call level or above.
    StepOver,
    /// Stop once the current procedure has returned.
    StepOut,
}

pub trait DebugHook {
    fn on_statement(&mut self, line: u32, start_col: u16, end_col: u16) -> DebugMode;
}

/// A global name supplied by the host.
#[derive(Clone)]
pub enum HostSymbol {
    Constant(Value),
    Variable(VarRef),
    Function(Rc<dyn NativeFunction>),
    Object(ObjectRef),
}

/// Fallback lookup for unqualified names not found in script scopes.
pub trait ExtendedSearch {
    fn lookup(&self, name: &str) -> Option<HostSymbol>;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn console_round_trip() {
        let mut io = BufferIo::new();
        let shared = io.clone();
        io.feed("first\r\nsecond");
        assert_eq!(io.read_line().unwrap().as_deref(), Some("first"));
        assert_eq!(io.read_line().unwrap().as_deref(), Some("second"));
        assert_eq!(io.read_line().unwrap(), None);
        io.write("hello").unwrap();
        assert_eq!(shared.output(), "hello");
    }

    #[test]
    fn channels_redirect_writes() {
        let mut io = BufferIo::new();
        io.open("log.txt", OpenMode::Output, 1).unwrap();
        assert_eq!(io.open("x", OpenMode::Output, 1), Err(BasicError::BadChannel));
        io.set_channel(1).unwrap();
        io.write("to file").unwrap();
        io.reset_channel();
        io.write("to console").unwrap();
        assert_eq!(io.channel_contents(1).as_deref(), Some("to file"));
        assert_eq!(io.output(), "to console");
        io.close(Some(1)).unwrap();
        assert_eq!(io.set_channel(1), Err(BasicError::BadChannel));
    }
}
