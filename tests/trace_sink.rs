use llvm_ir_taint_trace::trace_sink::{self, render, SLOT_SIZE};
use llvm_ir_taint_trace::*;
use parking_lot::Mutex;
use std::io::{self, Write};
use std::sync::Arc;
use std::thread;

fn init_logging() {
    // capture log messages with test harness
    let _ = env_logger::builder().is_test(true).try_init();
}

/// A `Write` that keeps everything written to it, shareable with the test
#[derive(Clone, Default)]
struct SharedOutput(Arc<Mutex<Vec<u8>>>);

impl SharedOutput {
    fn lines(&self) -> Vec<String> {
        String::from_utf8_lossy(&self.0.lock()).lines().map(String::from).collect()
    }
}

impl Write for SharedOutput {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        self.0.lock().extend_from_slice(buf);
        Ok(buf.len())
    }

    fn flush(&mut self) -> io::Result<()> {
        Ok(())
    }
}

#[test]
fn full_after_capacity() {
    init_logging();
    let out = SharedOutput::default();
    let mut sink = TraceSink::with_output(2, SLOT_SIZE, out.clone());
    assert_eq!(sink.capacity(), 2);
    sink.push("{[0]Val1:%u=}", &[TraceArg::Int(1)]).unwrap();
    sink.push("{[1]Val1:%u=}", &[TraceArg::Int(2)]).unwrap();
    assert!(sink.is_full());
    match sink.push("{[2]Val1:%u=}", &[TraceArg::Int(3)]) {
        Err(Error::Capacity { capacity }) => assert_eq!(capacity, 2),
        other => panic!("expected a capacity error, got {:?}", other),
    }
    // the failed push wrote nothing
    assert_eq!(out.lines(), vec!["{[0]Val1:1=}", "{[1]Val1:2=}"]);
}

#[test]
fn acquire_then_format() {
    let out = SharedOutput::default();
    let mut sink = TraceSink::with_output(4, SLOT_SIZE, out.clone());
    let first = sink.acquire_slot().unwrap();
    let second = sink.acquire_slot().unwrap();
    assert_ne!(first.index(), second.index());
    assert_eq!(sink.len(), 2);
    // slots may be filled in any order
    sink.format(second, "{[5]Ret=Val1:%p,}", &[TraceArg::Ptr(0x10)]).unwrap();
    sink.format(first, "{[4]x:%u=}", &[TraceArg::Int(9)]).unwrap();
    assert_eq!(out.lines(), vec!["{[5]Ret=Val1:0x10,}", "{[4]x:9=}"]);
    // but are drained in acquisition order
    assert_eq!(sink.drain(), vec!["{[4]x:9=}", "{[5]Ret=Val1:0x10,}"]);
}

#[test]
fn drained_slots_are_reused() {
    let mut sink = TraceSink::with_output(2, SLOT_SIZE, io::sink());
    for round in 0 .. 5u64 {
        sink.push("a:%u", &[round.into()]).unwrap();
        sink.push("b:%u", &[round.into()]).unwrap();
        assert!(sink.push("c", &[]).is_err());
        assert_eq!(sink.pop_record(), Some(format!("a:{}", round)));
        sink.push("c:%u", &[round.into()]).unwrap();
        assert_eq!(sink.drain(), vec![format!("b:{}", round), format!("c:{}", round)]);
        assert!(sink.is_empty());
    }
    assert_eq!(sink.pop_record(), None);
}

#[test]
fn records_are_truncated_to_the_slot() {
    let out = SharedOutput::default();
    let mut sink = TraceSink::with_output(1, 8, out.clone());
    sink.push("{[12345]Val1:%u=}", &[TraceArg::Int(77)]).unwrap();
    assert_eq!(sink.drain(), vec!["{[12345"]);
    assert_eq!(out.lines(), vec!["{[12345"]);
}

#[test]
fn conversions() {
    let x = 5u8;
    assert_eq!(render("%u %u %u", &[7u32.into(), (-1i32).into(), 3i64.into()], SLOT_SIZE), "7 4294967295 3");
    assert_eq!(render("%p", &[TraceArg::from(std::ptr::null::<u8>())], SLOT_SIZE), "(nil)");
    let addr = &x as *const u8 as usize;
    assert_eq!(render("%p", &[(&x as *const u8).into()], SLOT_SIZE), format!("{:#x}", addr));
}

#[test]
fn concurrent_pushes() {
    const THREADS: u64 = 8;
    const PER_THREAD: u64 = 50;
    let out = SharedOutput::default();
    let sink = Arc::new(Mutex::new(TraceSink::with_output(
        (THREADS * PER_THREAD) as usize,
        SLOT_SIZE,
        out.clone(),
    )));
    let handles: Vec<_> = (0 .. THREADS)
        .map(|t| {
            let sink = Arc::clone(&sink);
            thread::spawn(move || {
                for i in 0 .. PER_THREAD {
                    sink.lock().push("t%u:%u", &[t.into(), i.into()]).unwrap();
                }
            })
        })
        .collect();
    for handle in handles {
        handle.join().unwrap();
    }

    let mut sink = sink.lock();
    assert!(sink.is_full());
    let mut records = sink.drain();
    records.sort();
    records.dedup();
    assert_eq!(records.len(), (THREADS * PER_THREAD) as usize);
    assert_eq!(out.lines().len(), records.len());
}

/// The process-wide sink can only be set up once per process, so everything
/// about it is checked in this one test.
#[test]
fn process_wide_sink() {
    init_logging();
    let out = SharedOutput::default();
    assert!(matches!(trace_sink::try_track("early", &[]), Err(Error::NotInitialized)));

    trace_sink::install(TraceSink::with_output(16, SLOT_SIZE, out.clone())).unwrap();
    assert!(matches!(trace_sink::init(4), Err(Error::AlreadyInitialized)));

    let handles: Vec<_> = (0 .. 4u32)
        .map(|t| thread::spawn(move || trace_sink::track("{[3]Val1:%u=}", &[t.into()])))
        .collect();
    for handle in handles {
        handle.join().unwrap();
    }
    trace_sink::try_track("{[7]Ret=Val1:%p,}", &[TraceArg::Ptr(0)]).unwrap();

    let mut records = trace_sink::with_sink(|sink| sink.drain()).unwrap();
    assert_eq!(records.pop().as_deref(), Some("{[7]Ret=Val1:(nil),}"));
    records.sort();
    assert_eq!(records, vec!["{[3]Val1:0=}", "{[3]Val1:1=}", "{[3]Val1:2=}", "{[3]Val1:3=}"]);
    assert_eq!(out.lines().len(), 5);
}

#[test]
fn handle_from_another_sink_is_rejected() {
    let mut big = TraceSink::with_output(8, SLOT_SIZE, io::sink());
    let mut small = TraceSink::with_output(1, SLOT_SIZE, io::sink());
    let handles: Vec<_> = (0 .. 6).map(|_| big.acquire_slot().unwrap()).collect();
    let last = handles.into_iter().last().unwrap();
    assert_eq!(last.index(), 5);
    match small.format(last, "{[0]Val1:%u=}", &[TraceArg::Int(1)]) {
        Err(Error::ForeignSlot { index }) => assert_eq!(index, 5),
        other => panic!("expected a foreign slot error, got {:?}", other),
    }
    // an index that is in range here is still rejected
    let mut twin = TraceSink::with_output(1, SLOT_SIZE, io::sink());
    let other = twin.acquire_slot().unwrap();
    let mine = small.acquire_slot().unwrap();
    assert_eq!(other.index(), mine.index());
    assert!(matches!(small.format(other, "x", &[]), Err(Error::ForeignSlot { index: 0 })));
    small.format(mine, "x", &[]).unwrap();
    assert_eq!(small.drain(), vec!["x"]);
}
