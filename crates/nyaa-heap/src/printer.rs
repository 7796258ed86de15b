//! Destinations for collector progress lines.
//!
//! The collector formats one summary line per cycle and hands it to the
//! heap's [`GcPrinter`]. What happens to the line is the embedder's choice.

use std::fmt;
use std::sync::Arc;

use parking_lot::Mutex;

/// Sink for collector progress lines.
pub trait GcPrinter: Send + Sync {
    /// Receive one line, without the trailing newline.
    fn println(&self, args: fmt::Arguments<'_>);
}

/// Drops every line.
#[derive(Debug, Default, Clone, Copy)]
pub struct NullPrinter;

impl GcPrinter for NullPrinter {
    fn println(&self, _args: fmt::Arguments<'_>) {}
}

/// Forwards lines to `tracing` at info level.
#[cfg(feature = "tracing")]
#[derive(Debug, Default, Clone, Copy)]
pub struct TracingPrinter;

#[cfg(feature = "tracing")]
impl GcPrinter for TracingPrinter {
    fn println(&self, args: fmt::Arguments<'_>) {
        tracing::info!(target: "nyaa_heap::gc", "{}", args);
    }
}

/// Keeps every line in memory. Clones share the same buffer.
#[derive(Debug, Default, Clone)]
pub struct BufferPrinter {
    lines: Arc<Mutex<Vec<String>>>,
}

impl BufferPrinter {
    /// Empty buffer.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Copy of the lines received so far.
    #[must_use]
    pub fn lines(&self) -> Vec<String> {
        self.lines.lock().clone()
    }

    /// Take the lines received so far, leaving the buffer empty.
    pub fn take(&self) -> Vec<String> {
        std::mem::take(&mut *self.lines.lock())
    }
}

impl GcPrinter for BufferPrinter {
    fn println(&self, args: fmt::Arguments<'_>) {
        self.lines.lock().push(args.to_string());
    }
}

impl<P: GcPrinter + ?Sized> GcPrinter for Arc<P> {
    fn println(&self, args: fmt::Arguments<'_>) {
        (**self).println(args);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_buffer_printer_shares_lines() {
        let printer = BufferPrinter::new();
        let boxed: Box<dyn GcPrinter> = Box::new(printer.clone());
        boxed.println(format_args!("minor {} bytes", 64));
        assert_eq!(printer.lines(), vec!["minor 64 bytes".to_owned()]);
        assert_eq!(printer.take().len(), 1);
        assert!(printer.lines().is_empty());
    }

    #[test]
    fn test_null_printer() {
        NullPrinter.println(format_args!("ignored"));
    }
}
