//! Console output for boot and driver diagnostics.
//!
//! The byte sink is the startup code's UART (or whatever it hands over). Until
//! a sink is installed everything printed is dropped, so early code can log
//! unconditionally. Never print from interrupt context: the console is behind
//! a spin lock the interrupted code may hold.
use core::fmt;
use spin::Mutex;

pub static CONSOLE: Mutex<Console> = Mutex::new(Console::new());

/// Destination for console bytes.
pub trait ByteSink: Send {
    fn put(&mut self, bytes: &[u8]);
}

impl<W: embedded_io::Write + Send> ByteSink for W {
    fn put(&mut self, bytes: &[u8]) {
        let _ = self.write_all(bytes);
    }
}

pub struct Console {
    sink: Option<&'static mut dyn ByteSink>,
}

impl Console {
    pub const fn new() -> Self {
        Self { sink: None }
    }

    pub fn set_sink(&mut self, sink: &'static mut dyn ByteSink) {
        self.sink = Some(sink);
    }

    /// Detach the current sink, if any. Output is dropped afterwards.
    pub fn take_sink(&mut self) -> Option<&'static mut dyn ByteSink> {
        self.sink.take()
    }

    pub fn has_sink(&self) -> bool {
        self.sink.is_some()
    }

    /// Write a string, expanding `\n` to `\r\n` for serial terminals.
    pub fn write_str_raw(&mut self, s: &str) {
        let Some(sink) = self.sink.as_mut() else {
            return;
        };
        let mut rest = s.as_bytes();
        while let Some(pos) = rest.iter().position(|&b| b == b'\n') {
            sink.put(&rest[..pos]);
            sink.put(b"\r\n");
            rest = &rest[pos + 1..];
        }
        if !rest.is_empty() {
            sink.put(rest);
        }
    }
}

impl fmt::Write for Console {
    fn write_str(&mut self, s: &str) -> fmt::Result {
        self.write_str_raw(s);
        Ok(())
    }
}

/// Install the global console sink.
pub fn init(sink: &'static mut dyn ByteSink) {
    CONSOLE.lock().set_sink(sink);
}

/// Print to the console.
#[macro_export]
macro_rules! console_print {
    ($($arg:tt)*) => {
        {
            use core::fmt::Write;
            let mut console = $crate::console::CONSOLE.lock();
            let _ = write!(console, $($arg)*);
        }
    };
}

/// Print to the console with a newline.
#[macro_export]
macro_rules! console_println {
    () => ($crate::console_print!("\n"));
    ($($arg:tt)*) => {
        $crate::console_print!("{}\n", format_args!($($arg)*))
    };
}
