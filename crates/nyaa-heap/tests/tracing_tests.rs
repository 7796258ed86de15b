//! Integration tests for the `tracing` feature.
//!
//! Every test installs a thread-local fmt subscriber writing into a shared
//! buffer and checks the spans and events a collection leaves behind.

#![cfg(feature = "tracing")]

use std::io;
use std::sync::Arc;

use nyaa_heap::{
    AllocFlags, CollectionKind, HandleScope, Heap, HeapConfig, NullPrinter, ObjectFactory,
    TracingPrinter,
};
use parking_lot::Mutex;
use tracing::Level;

#[derive(Clone, Default)]
struct SharedBuf(Arc<Mutex<Vec<u8>>>);

impl SharedBuf {
    fn contents(&self) -> String {
        String::from_utf8_lossy(&self.0.lock()).into_owned()
    }
}

impl io::Write for SharedBuf {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        self.0.lock().extend_from_slice(buf);
        Ok(buf.len())
    }

    fn flush(&mut self) -> io::Result<()> {
        Ok(())
    }
}

fn captured(f: impl FnOnce()) -> String {
    let buf = SharedBuf::default();
    let writer = buf.clone();
    let subscriber = tracing_subscriber::fmt()
        .with_max_level(Level::DEBUG)
        .with_ansi(false)
        .with_writer(move || writer.clone())
        .finish();
    tracing::subscriber::with_default(subscriber, f);
    buf.contents()
}

#[test]
fn test_minor_collection_spans() {
    let output = captured(|| {
        let heap = Heap::new(HeapConfig::default(), Box::new(NullPrinter)).expect("heap");
        let thread = heap.attach_thread();
        let scope = HandleScope::new(&thread);
        ObjectFactory::new(&heap)
            .new_string(&scope, "traced", AllocFlags::empty())
            .expect("string");
        heap.collect(CollectionKind::Minor).expect("minor");
    });

    assert!(output.contains("gc_collect"), "{output}");
    assert!(output.contains("minor"), "{output}");
    assert!(output.contains("Scavenge"), "{output}");
    assert!(output.contains("phase_start"), "{output}");
    assert!(output.contains("phase_end"), "{output}");
}

#[test]
fn test_major_collection_phases() {
    let output = captured(|| {
        let heap = Heap::new(HeapConfig::default(), Box::new(NullPrinter)).expect("heap");
        heap.collect(CollectionKind::MarkSweep).expect("sweep");
        heap.collect(CollectionKind::MarkCompact).expect("compact");
    });

    for phase in ["Mark", "Sweep", "Compact"] {
        assert!(output.contains(phase), "missing {phase}: {output}");
    }
    assert!(output.contains("mark_sweep"), "{output}");
    assert!(output.contains("mark_compact"), "{output}");
}

#[test]
fn test_tracing_printer_reports_each_cycle() {
    let output = captured(|| {
        let heap = Heap::new(HeapConfig::default(), Box::new(TracingPrinter)).expect("heap");
        heap.collect(CollectionKind::Minor).expect("minor");
        heap.collect(CollectionKind::Full).expect("full");
    });

    assert!(output.contains("nyaa_heap::gc"), "{output}");
    assert!(output.contains("[gc #1] minor"), "{output}");
    assert!(output.contains("[gc #2] full"), "{output}");
}

#[test]
fn test_clamped_config_warns() {
    let output = captured(|| {
        let config = HeapConfig {
            new_space_size: 1,
            ..HeapConfig::default()
        }
        .clamped();
        assert_eq!(config.validate(), Ok(()));
    });

    assert!(output.contains("WARN"), "{output}");
    assert!(output.contains("heap option out of range"), "{output}");
    assert!(output.contains("new_space_size"), "{output}");
}

#[test]
fn test_no_output_below_subscriber_level() {
    let buf = SharedBuf::default();
    let writer = buf.clone();
    let subscriber = tracing_subscriber::fmt()
        .with_max_level(Level::INFO)
        .with_writer(move || writer.clone())
        .finish();
    tracing::subscriber::with_default(subscriber, || {
        let heap = Heap::new(HeapConfig::default(), Box::new(NullPrinter)).expect("heap");
        heap.collect(CollectionKind::Minor).expect("minor");
    });
    assert!(buf.contents().is_empty());
}
