//! Console and file channel opcodes, forwarded to the host's
//! [`IoChannels`](crate::host::IoChannels).

use super::{Flow, Vm, VmError};
use crate::host::OpenMode;
use kestrel_core::{BasicError, Value};

impl Vm {
    /// Surface a failure the channel layer deferred.
    fn io_checked(&mut self) -> Result<(), Flow> {
        match self.io.pending_error() {
            Some(err) => Err(err.into()),
            None => Ok(()),
        }
    }

    fn write_out(&mut self, text: &str) -> Result<(), Flow> {
        self.io.write(text)?;
        self.io_checked()
    }
}

fn channel_number(value: &Value) -> Result<i32, BasicError> {
    let n = value.to_i32()?;
    if n < 0 {
        return Err(BasicError::BadChannel);
    }
    Ok(n)
}

/// `#n,` prefix: redirect the rest of the statement to channel `n`.
pub(super) fn op_channel(vm: &mut Vm) -> Result<(), Flow> {
    let channel = channel_number(&vm.pop_value()?)?;
    vm.io.set_channel(channel)?;
    vm.io_checked()
}

pub(super) fn op_chan0(vm: &mut Vm) -> Result<(), Flow> {
    vm.io.reset_channel();
    Ok(())
}

pub(super) fn op_print(vm: &mut Vm) -> Result<(), Flow> {
    let text = vm.pop_value()?.to_basic_string()?;
    vm.write_out(&text)
}

/// `PRINT` of a numeric item pads it with a sign position and a trailing
/// space.
pub(super) fn op_printf(vm: &mut Vm) -> Result<(), Flow> {
    let value = vm.pop_value()?;
    let text = value.to_basic_string()?;
    let formatted = if value.is_numeric() {
        let sign = if value.to_f64()? < 0.0 { "" } else { " " };
        format!("{sign}{text} ")
    } else {
        text
    };
    vm.write_out(&formatted)
}

/// `WRITE` item: strings are quoted, booleans delimited by `#`.
pub(super) fn op_write(vm: &mut Vm) -> Result<(), Flow> {
    let value = vm.pop_value()?;
    let text = match &value {
        Value::String(s) => format!("\"{s}\""),
        Value::Bool(b) => {
            if *b {
                "#TRUE#".to_string()
            } else {
                "#FALSE#".to_string()
            }
        }
        Value::Empty => String::new(),
        other => other.to_basic_string()?,
    };
    vm.write_out(&text)
}

/// `PRCHAR c`: separators and line breaks between items.
pub(super) fn op_prchar(vm: &mut Vm, code: u32) -> Result<(), Flow> {
    let c = char::from_u32(code).ok_or(VmError::BadOperand(code))?;
    let mut buf = [0u8; 4];
    vm.write_out(c.encode_utf8(&mut buf))
}

pub(super) fn op_lineinput(vm: &mut Vm) -> Result<(), Flow> {
    let target = vm.top_mut()?.pop()?;
    let line = vm.io.read_line()?;
    vm.io_checked()?;
    let line = line.ok_or(BasicError::InputPastEnd)?;
    target.assign(Value::string(line))?;
    Ok(())
}

/// `INPUT var`: one comma or newline delimited field. A field starting with
/// a double quote runs to the closing quote.
pub(super) fn op_input(vm: &mut Vm) -> Result<(), Flow> {
    let target = vm.top_mut()?.pop()?;
    let field = read_field(vm)?;
    vm.io_checked()?;
    target.assign(Value::string(field))?;
    Ok(())
}

fn read_field(vm: &mut Vm) -> Result<String, Flow> {
    let mut c = vm.io.read_char()?;
    while c == Some(' ') {
        c = vm.io.read_char()?;
    }
    let Some(first) = c else {
        return Err(BasicError::InputPastEnd.into());
    };
    let mut field = String::new();
    if first == '"' {
        while let Some(ch) = vm.io.read_char()? {
            if ch == '"' {
                break;
            }
            field.push(ch);
        }
        // Drop the delimiter following the closing quote.
        while let Some(ch) = vm.io.read_char()? {
            if ch == ',' || ch == '\n' {
                break;
            }
        }
        return Ok(field);
    }
    let mut next = Some(first);
    while let Some(ch) = next {
        if ch == ',' || ch == '\n' {
            break;
        }
        if ch != '\r' {
            field.push(ch);
        }
        next = vm.io.read_char()?;
    }
    Ok(field.trim_end().to_string())
}

/// `OPEN path FOR mode AS #n`: pops the channel, then the path. The second
/// operand is reserved.
pub(super) fn op_open(vm: &mut Vm, mode: u32, _: u32) -> Result<(), Flow> {
    let mode = OpenMode::from_operand(mode).ok_or(VmError::BadOperand(mode))?;
    let channel = channel_number(&vm.pop_value()?)?;
    let path = vm.pop_value()?.to_basic_string()?;
    vm.io.open(&path, mode, channel)?;
    vm.io_checked()
}

/// `CLOSE #a, #b`: pops `count` channel numbers; zero closes everything.
pub(super) fn op_close(vm: &mut Vm, count: u32) -> Result<(), Flow> {
    if count == 0 {
        vm.io.close(None)?;
        return vm.io_checked();
    }
    for _ in 0..count {
        let channel = channel_number(&vm.pop_value()?)?;
        vm.io.close(Some(channel))?;
    }
    vm.io_checked()
}
